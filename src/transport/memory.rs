//! In-process pub/sub hub.
//!
//! A [`MemoryHub`] stands in for the hosted service inside one process:
//! tests and local development wire every client to the same hub and
//! get real fan-out, change-feed injection, and a kill switch to force
//! connection loss. Delivery skips the publishing connection, matching
//! the hosted client's no-self-delivery default.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{ChangeEvent, Connection, Inbound, Transport, TransportError};

const INBOUND_BUFFER: usize = 256;

#[derive(Default)]
struct HubInner {
    next_id: u64,
    conns: HashMap<u64, ConnEntry>,
}

struct ConnEntry {
    tx: mpsc::Sender<Inbound>,
    joined: HashSet<String>,
}

/// Shared in-process broker. Cheap to clone via [`MemoryHub::transport`].
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A [`Transport`] handle backed by this hub.
    #[must_use]
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport { inner: Arc::clone(&self.inner) }
    }

    /// Inject a change-feed row, delivered to every connection joined
    /// to `topic` — the way the hosted service fans out database
    /// changes.
    pub fn emit_change(&self, topic: &str, change: ChangeEvent) {
        let targets = {
            let inner = lock(&self.inner);
            inner
                .conns
                .values()
                .filter(|c| c.joined.contains(topic))
                .map(|c| c.tx.clone())
                .collect::<Vec<_>>()
        };
        for tx in targets {
            let _ = tx.try_send(Inbound::Change { topic: topic.to_owned(), change: change.clone() });
        }
    }

    /// Kill switch: drop every live connection. Their inbound streams
    /// end and further operations on them fail, as if the service went
    /// away.
    pub fn drop_connections(&self) {
        let mut inner = lock(&self.inner);
        inner.conns.clear();
    }

    /// Number of connections currently joined to `topic`.
    #[must_use]
    pub fn topic_members(&self, topic: &str) -> usize {
        let inner = lock(&self.inner);
        inner.conns.values().filter(|c| c.joined.contains(topic)).count()
    }
}

/// [`Transport`] handle minted by [`MemoryHub::transport`].
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Mutex<HubInner>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        let id = {
            let mut inner = lock(&self.inner);
            let id = inner.next_id;
            inner.next_id += 1;
            inner.conns.insert(id, ConnEntry { tx, joined: HashSet::new() });
            id
        };
        Ok(Box::new(MemoryConnection { id, inner: Arc::clone(&self.inner), events: Some(rx) }))
    }
}

struct MemoryConnection {
    id: u64,
    inner: Arc<Mutex<HubInner>>,
    events: Option<mpsc::Receiver<Inbound>>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn join(&mut self, topic: &str) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        let entry = inner.conns.get_mut(&self.id).ok_or(TransportError::Closed)?;
        entry.joined.insert(topic.to_owned());
        Ok(())
    }

    async fn leave(&mut self, topic: &str) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        let entry = inner.conns.get_mut(&self.id).ok_or(TransportError::Closed)?;
        entry.joined.remove(topic);
        Ok(())
    }

    async fn publish(&mut self, topic: &str, event: &str, payload: Value) -> Result<(), TransportError> {
        let targets = {
            let inner = lock(&self.inner);
            if !inner.conns.contains_key(&self.id) {
                return Err(TransportError::Closed);
            }
            inner
                .conns
                .iter()
                .filter(|(id, c)| **id != self.id && c.joined.contains(topic))
                .map(|(_, c)| c.tx.clone())
                .collect::<Vec<_>>()
        };
        for tx in targets {
            // Best-effort: a subscriber with a full queue misses the event.
            let _ = tx.try_send(Inbound::Broadcast {
                topic: topic.to_owned(),
                event: event.to_owned(),
                payload: payload.clone(),
            });
        }
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        let inner = lock(&self.inner);
        if inner.conns.contains_key(&self.id) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    fn events(&mut self) -> Option<mpsc::Receiver<Inbound>> {
        self.events.take()
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let mut inner = lock(&self.inner);
        inner.conns.remove(&self.id);
    }
}

fn lock(inner: &Mutex<HubInner>) -> std::sync::MutexGuard<'_, HubInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
