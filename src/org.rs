//! Organization-scoped realtime subscription.
//!
//! DESIGN
//! ======
//! The single entry point UI code uses to receive everything scoped to
//! an organization: change-feed rows for new conversations, new
//! messages, and conversation updates, plus broadcast events for
//! typing, presence, and read receipts. Both delivery paths are
//! normalized into one [`OrgEvent`] stream.
//!
//! The same logical message can arrive twice — once as a change-feed
//! row and once as an application broadcast — so every message id
//! passes through a bounded dedup set and the second arrival is dropped
//! before any handler sees it. Typing and presence events from the
//! local user are filtered here as well; no surface renders its own
//! typing indicator.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::dedup::RecentIds;
use crate::envelope::{
    self, ConversationPayload, EVENT_CONVERSATION_UPDATED, EVENT_MESSAGE_CREATED, EVENT_PRESENCE_UPDATE,
    EVENT_READ_RECEIPT, EVENT_TYPING_START, EVENT_TYPING_STOP, Envelope, MessagePayload, PresencePayload,
    ReadReceiptPayload, TypingPayload,
};
use crate::names;
use crate::pool::{ChannelPool, ConnectionHealth, ConnectionStatus, PoolError, PoolEvent, Subscription};
use crate::transport::{ChangeEvent, ChangeKind};

/// Change-feed table carrying conversation rows.
pub const TABLE_CONVERSATIONS: &str = "conversations";
/// Change-feed table carrying message rows.
pub const TABLE_MESSAGES: &str = "messages";

const EVENT_BUFFER: usize = 256;

/// A normalized organization-scoped event, regardless of which path
/// delivered it.
#[derive(Debug, Clone)]
pub enum OrgEvent {
    /// A conversation row was inserted. Carries the raw row.
    NewConversation(Value),
    /// A message arrived (change feed or broadcast), deduplicated by id.
    NewMessage(MessagePayload),
    /// Conversation fields changed; apply last-write-wins.
    ConversationUpdated(ConversationPayload),
    /// A peer started or stopped typing.
    Typing(TypingPayload),
    /// A peer's presence changed.
    Presence(PresencePayload),
    /// A message was read.
    MessageStatus(ReadReceiptPayload),
}

/// Live organization subscription. Dropping it (or calling [`close`])
/// stops the event stream — no event is delivered after that.
///
/// [`close`]: OrgRealtime::close
pub struct OrgRealtime {
    organization_id: Uuid,
    pool: Arc<ChannelPool>,
    task: JoinHandle<()>,
}

impl OrgRealtime {
    /// Subscribe to the organization channel and start forwarding
    /// normalized events.
    ///
    /// # Errors
    ///
    /// Propagates the pool's subscribe failure.
    pub async fn subscribe(
        pool: Arc<ChannelPool>,
        organization_id: Uuid,
        self_user_id: Uuid,
    ) -> Result<(Self, mpsc::Receiver<OrgEvent>), PoolError> {
        let sub = pool.subscribe(&names::organization(organization_id)).await?;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let task = tokio::spawn(forward(sub, tx, organization_id, self_user_id));
        Ok((Self { organization_id, pool, task }, rx))
    }

    #[must_use]
    pub fn organization_id(&self) -> Uuid {
        self.organization_id
    }

    /// Connection health of the underlying pool.
    #[must_use]
    pub fn health(&self) -> ConnectionHealth {
        self.pool.health()
    }

    #[must_use]
    pub fn status_rx(&self) -> watch::Receiver<ConnectionStatus> {
        self.pool.status_rx()
    }

    /// Stop the subscription. The event receiver ends promptly.
    pub fn close(self) {
        // Drop does the work.
    }
}

impl Drop for OrgRealtime {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn forward(
    mut sub: Subscription,
    tx: mpsc::Sender<OrgEvent>,
    organization_id: Uuid,
    self_user_id: Uuid,
) {
    let mut seen = RecentIds::default();
    while let Some(event) = sub.recv().await {
        let Some(normalized) = normalize(event, organization_id, self_user_id, &mut seen) else {
            continue;
        };
        if tx.send(normalized).await.is_err() {
            // Consumer gone; stop forwarding.
            break;
        }
    }
}

fn normalize(
    event: PoolEvent,
    organization_id: Uuid,
    self_user_id: Uuid,
    seen: &mut RecentIds,
) -> Option<OrgEvent> {
    match event {
        PoolEvent::Change(change) => normalize_change(change, organization_id, seen),
        PoolEvent::Broadcast { event, payload } => normalize_broadcast(&event, payload, self_user_id, seen),
    }
}

fn normalize_change(change: ChangeEvent, organization_id: Uuid, seen: &mut RecentIds) -> Option<OrgEvent> {
    match (change.table.as_str(), change.kind) {
        (TABLE_MESSAGES, ChangeKind::Insert) => {
            if let Some(id) = envelope::message_id_of(&change.row)
                && !seen.insert(id)
            {
                debug!(%id, "duplicate message dropped");
                return None;
            }
            let Some(conversation_id) = row_uuid(&change.row, "conversation_id") else {
                debug!("message row without conversation_id dropped");
                return None;
            };
            Some(OrgEvent::NewMessage(MessagePayload {
                message: change.row,
                conversation_id,
                organization_id,
            }))
        }
        (TABLE_CONVERSATIONS, ChangeKind::Insert) => Some(OrgEvent::NewConversation(change.row)),
        (TABLE_CONVERSATIONS, ChangeKind::Update) => {
            let Some(conversation_id) = row_uuid(&change.row, "id") else {
                debug!("conversation row without id dropped");
                return None;
            };
            Some(OrgEvent::ConversationUpdated(ConversationPayload {
                updates: change.row,
                conversation_id,
                organization_id,
            }))
        }
        _ => {
            debug!(table = %change.table, kind = ?change.kind, "unhandled change row");
            None
        }
    }
}

fn normalize_broadcast(
    event: &str,
    payload: Value,
    self_user_id: Uuid,
    seen: &mut RecentIds,
) -> Option<OrgEvent> {
    let env: Envelope = match serde_json::from_value(payload) {
        Ok(env) => env,
        Err(e) => {
            debug!(event, error = %e, "broadcast without envelope dropped");
            return None;
        }
    };

    match envelope::canonical_event(event) {
        EVENT_MESSAGE_CREATED => {
            let payload: MessagePayload = parse_payload(event, env.payload)?;
            if let Some(id) = payload.message_id()
                && !seen.insert(id)
            {
                debug!(%id, "duplicate message dropped");
                return None;
            }
            Some(OrgEvent::NewMessage(payload))
        }
        EVENT_TYPING_START | EVENT_TYPING_STOP => {
            let payload: TypingPayload = parse_payload(event, env.payload)?;
            if payload.user_id == self_user_id {
                return None;
            }
            Some(OrgEvent::Typing(payload))
        }
        EVENT_CONVERSATION_UPDATED => {
            let payload: ConversationPayload = parse_payload(event, env.payload)?;
            Some(OrgEvent::ConversationUpdated(payload))
        }
        EVENT_PRESENCE_UPDATE => {
            let payload: PresencePayload = parse_payload(event, env.payload)?;
            if payload.user_id == self_user_id {
                return None;
            }
            Some(OrgEvent::Presence(payload))
        }
        EVENT_READ_RECEIPT => {
            let payload: ReadReceiptPayload = parse_payload(event, env.payload)?;
            Some(OrgEvent::MessageStatus(payload))
        }
        other => {
            debug!(event = other, "unhandled broadcast event");
            None
        }
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(event: &str, payload: Value) -> Option<T> {
    match serde_json::from_value(payload) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            debug!(event, error = %e, "malformed broadcast payload dropped");
            None
        }
    }
}

fn row_uuid(row: &Value, key: &str) -> Option<Uuid> {
    row.get(key).and_then(Value::as_str).and_then(|s| s.parse().ok())
}

#[cfg(test)]
#[path = "org_test.rs"]
mod tests;
