//! WebSocket transport for the hosted realtime service.
//!
//! DESIGN
//! ======
//! One socket per connection, multiplexing topics through a small JSON
//! protocol: the client sends `join` / `leave` / `broadcast` /
//! `heartbeat` operations, the service pushes `broadcast` and `change`
//! events plus `heartbeat_ack`. A reader task translates service pushes
//! into [`Inbound`] values; the task exiting ends the inbound stream,
//! which is how the pool learns the connection died.
//!
//! Heartbeats are acknowledged, so `ping` measures a real round trip:
//! the ack resolves a oneshot parked by the pinger, with a timeout for
//! an upstream that stopped answering.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use crate::config::{ConfigError, RealtimeConfig};

use super::{ChangeEvent, Connection, Inbound, Transport, TransportError};

const INBOUND_BUFFER: usize = 256;
const PONG_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// WIRE PROTOCOL
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ClientMsg<'a> {
    Join { topic: &'a str },
    Leave { topic: &'a str },
    Broadcast { topic: &'a str, event: &'a str, payload: Value },
    Heartbeat,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ServerMsg {
    Broadcast { topic: String, event: String, payload: Value },
    Change { topic: String, change: ChangeEvent },
    HeartbeatAck,
}

// =============================================================================
// TRANSPORT
// =============================================================================

/// Connects to the hosted service's WebSocket endpoint.
pub struct WsTransport {
    url: String,
    api_key: String,
}

impl WsTransport {
    #[must_use]
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self { url: url.into(), api_key: api_key.into() }
    }

    /// Client transport from configuration (URL + public key).
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the URL or public key is missing.
    pub fn from_config(config: &RealtimeConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(config.require_url()?, config.require_anon_key()?))
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
        let url = format!("{}?apikey={}", self.url, self.api_key);
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (sink, source) = stream.split();

        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        let shared = Arc::new(WsShared { pending_pong: Mutex::new(None) });
        let reader = tokio::spawn(read_loop(source, tx, Arc::clone(&shared)));

        Ok(Box::new(WsConnection { sink, shared, events: Some(rx), reader }))
    }
}

struct WsShared {
    pending_pong: Mutex<Option<oneshot::Sender<()>>>,
}

struct WsConnection {
    sink: SplitSink<WsStream, Message>,
    shared: Arc<WsShared>,
    events: Option<mpsc::Receiver<Inbound>>,
    reader: JoinHandle<()>,
}

impl WsConnection {
    async fn send_msg(&mut self, msg: &ClientMsg<'_>) -> Result<(), TransportError> {
        let json = serde_json::to_string(msg).map_err(|e| TransportError::Send(e.to_string()))?;
        self.sink
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn join(&mut self, topic: &str) -> Result<(), TransportError> {
        self.send_msg(&ClientMsg::Join { topic }).await
    }

    async fn leave(&mut self, topic: &str) -> Result<(), TransportError> {
        self.send_msg(&ClientMsg::Leave { topic }).await
    }

    async fn publish(&mut self, topic: &str, event: &str, payload: Value) -> Result<(), TransportError> {
        self.send_msg(&ClientMsg::Broadcast { topic, event, payload }).await
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending_pong.lock().unwrap_or_else(PoisonError::into_inner);
            *pending = Some(ack_tx);
        }
        self.send_msg(&ClientMsg::Heartbeat).await?;

        match tokio::time::timeout(PONG_TIMEOUT, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    fn events(&mut self) -> Option<mpsc::Receiver<Inbound>> {
        self.events.take()
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// =============================================================================
// READER
// =============================================================================

async fn read_loop(mut source: SplitStream<WsStream>, tx: mpsc::Sender<Inbound>, shared: Arc<WsShared>) {
    while let Some(msg) = source.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "ws: read error");
                break;
            }
        };

        let parsed: ServerMsg = match serde_json::from_str(text.as_str()) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "ws: unrecognized frame dropped");
                continue;
            }
        };

        let inbound = match parsed {
            ServerMsg::Broadcast { topic, event, payload } => Inbound::Broadcast { topic, event, payload },
            ServerMsg::Change { topic, change } => Inbound::Change { topic, change },
            ServerMsg::HeartbeatAck => {
                let waiter = {
                    let mut pending = shared.pending_pong.lock().unwrap_or_else(PoisonError::into_inner);
                    pending.take()
                };
                if let Some(waiter) = waiter {
                    let _ = waiter.send(());
                }
                continue;
            }
        };

        if tx.send(inbound).await.is_err() {
            break;
        }
    }
    // Dropping `tx` ends the inbound stream; the pool treats that as
    // connection loss.
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
