//! Broadcast envelope and event vocabulary.
//!
//! DESIGN
//! ======
//! Every broadcast on the wire is an [`Envelope`]: a tagged payload that
//! carries enough addressing (`organization_id`, `conversation_id`,
//! `source`, `ts`) for a receiver with no other context to route and
//! deduplicate it. Typed payload structs define the shape of each event;
//! the envelope keeps `payload` as raw JSON so the pool and transports
//! never need to understand event contents.
//!
//! Receivers accept the legacy event aliases still emitted by older
//! surfaces (`new_message`, `typing`); senders only ever emit canonical
//! names.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// =============================================================================
// EVENT NAMES
// =============================================================================

/// A message row was created.
pub const EVENT_MESSAGE_CREATED: &str = "message_created";
/// A user started (or refreshed) typing; may carry a content preview.
pub const EVENT_TYPING_START: &str = "typing_start";
/// A user explicitly stopped typing.
pub const EVENT_TYPING_STOP: &str = "typing_stop";
/// Conversation fields changed.
pub const EVENT_CONVERSATION_UPDATED: &str = "conversation_updated";
/// Online/away/offline signal.
pub const EVENT_PRESENCE_UPDATE: &str = "presence_update";
/// A message was read.
pub const EVENT_READ_RECEIPT: &str = "read_receipt";

const LEGACY_NEW_MESSAGE: &str = "new_message";
const LEGACY_TYPING: &str = "typing";

/// Map legacy event aliases onto canonical names. Canonical and unknown
/// names pass through unchanged.
#[must_use]
pub fn canonical_event(name: &str) -> &str {
    match name {
        LEGACY_NEW_MESSAGE => EVENT_MESSAGE_CREATED,
        LEGACY_TYPING => EVENT_TYPING_START,
        other => other,
    }
}

// =============================================================================
// ENVELOPE
// =============================================================================

/// Which surface produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Dashboard,
    Widget,
    Server,
}

/// The self-addressing wrapper around every broadcast payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    pub payload: Value,
    pub organization_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<Uuid>,
    /// Milliseconds since the Unix epoch at send time.
    pub ts: i64,
    pub source: Source,
}

impl Envelope {
    /// Build an envelope stamped with the current time.
    pub fn new(
        event: impl Into<String>,
        payload: Value,
        organization_id: Uuid,
        conversation_id: Option<Uuid>,
        source: Source,
    ) -> Self {
        Self {
            event: event.into(),
            payload,
            organization_id,
            conversation_id,
            ts: now_ms(),
            source,
        }
    }
}

/// Current time as milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// Payload for [`EVENT_MESSAGE_CREATED`]. `message` is the raw message
/// row as the backend stores it; this layer never interprets it beyond
/// extracting the id for dedup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message: Value,
    pub conversation_id: Uuid,
    pub organization_id: Uuid,
}

impl MessagePayload {
    /// The message row's id, when present and well-formed.
    #[must_use]
    pub fn message_id(&self) -> Option<Uuid> {
        message_id_of(&self.message)
    }
}

/// Extract an `id` field from a raw message row.
#[must_use]
pub fn message_id_of(row: &Value) -> Option<Uuid> {
    row.get("id").and_then(Value::as_str).and_then(|s| s.parse().ok())
}

/// Payload for [`EVENT_TYPING_START`] / [`EVENT_TYPING_STOP`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingPayload {
    pub user_id: Uuid,
    pub user_name: String,
    pub conversation_id: Uuid,
    /// Live content preview, already truncated by the sender.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content: Option<String>,
    pub is_typing: bool,
    pub ts: i64,
}

/// Payload for [`EVENT_CONVERSATION_UPDATED`]. `updates` carries either
/// the full conversation row or just the changed fields; receivers apply
/// it last-write-wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationPayload {
    pub updates: Value,
    pub conversation_id: Uuid,
    pub organization_id: Uuid,
}

/// Presence state carried by [`EVENT_PRESENCE_UPDATE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

/// Payload for [`EVENT_PRESENCE_UPDATE`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresencePayload {
    pub user_id: Uuid,
    pub status: PresenceStatus,
    pub is_online: bool,
    /// Milliseconds since the Unix epoch.
    pub last_seen: i64,
}

/// Payload for [`EVENT_READ_RECEIPT`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReceiptPayload {
    pub message_id: Uuid,
    pub read_by: Uuid,
    /// Milliseconds since the Unix epoch.
    pub read_at: i64,
}

#[cfg(test)]
#[path = "envelope_test.rs"]
mod tests;
