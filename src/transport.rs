//! Hosted pub/sub + change-feed client contract.
//!
//! DESIGN
//! ======
//! The realtime layer never talks to the hosted service directly; it
//! talks to these traits. A [`Transport`] mints one [`Connection`] per
//! attempt — the channel pool owns retry, so a transport makes exactly
//! one try and reports honestly. A connection multiplexes any number of
//! topics and surfaces everything the service pushes (application
//! broadcasts and database change-feed rows) on a single inbound queue.
//!
//! Two implementations ship with the crate: [`memory::MemoryHub`] for
//! tests and single-process development, and [`ws::WsTransport`] for
//! the hosted service's WebSocket endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

pub mod memory;
pub mod ws;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connection closed")]
    Closed,
    #[error("send failed: {0}")]
    Send(String),
    #[error("operation timed out")]
    Timeout,
}

/// Row-level change-feed event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A database row change delivered on a subscribed topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub row: Value,
}

/// Everything a connection can deliver.
#[derive(Debug, Clone)]
pub enum Inbound {
    Broadcast { topic: String, event: String, payload: Value },
    Change { topic: String, change: ChangeEvent },
}

/// Factory for connections. One call, one attempt.
#[async_trait]
pub trait Transport: Send + Sync {
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] when the service is
    /// unreachable or refuses the handshake.
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError>;
}

/// One live connection to the hosted service.
#[async_trait]
pub trait Connection: Send {
    /// Join a topic so this connection receives its events.
    async fn join(&mut self, topic: &str) -> Result<(), TransportError>;

    /// Leave a topic. Leaving a topic that was never joined is not an
    /// error.
    async fn leave(&mut self, topic: &str) -> Result<(), TransportError>;

    /// Publish a broadcast. Best-effort: no delivery acknowledgement is
    /// awaited, so success means "accepted by the connection", not
    /// "seen by a subscriber".
    async fn publish(&mut self, topic: &str, event: &str, payload: Value) -> Result<(), TransportError>;

    /// Liveness probe. An error here means the connection is dead and
    /// the caller should reconnect.
    async fn ping(&mut self) -> Result<(), TransportError>;

    /// Take the inbound event stream. Yields `None` on every call after
    /// the first. The stream ending signals connection loss.
    fn events(&mut self) -> Option<mpsc::Receiver<Inbound>>;
}
