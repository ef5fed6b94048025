//! Broadcast senders.
//!
//! DESIGN
//! ======
//! Two flavors of fire-and-forget delivery:
//!
//! - **Pooled notifiers** (`notify_*`) ride an existing [`ChannelPool`]
//!   and publish on the organization or typing channel the pool is
//!   already subscribed to. Transient failures retry with the shared
//!   sender backoff; a missing subscription is a caller bug and fails
//!   fast.
//! - **[`Broadcaster`]** owns its own transport and performs one-shot
//!   join → publish → leave per target topic. It exists for server-side
//!   notification jobs that have no pool, and requires the privileged
//!   service key when built from configuration.
//!
//! Every sender returns `bool`: `false` means the realtime side channel
//! failed, and callers must not fail the primary operation (persisting
//! a message, updating a conversation) because of it.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::config::{ConfigError, RealtimeConfig};
use crate::envelope::{
    EVENT_CONVERSATION_UPDATED, EVENT_MESSAGE_CREATED, EVENT_PRESENCE_UPDATE, EVENT_READ_RECEIPT,
    EVENT_TYPING_START, EVENT_TYPING_STOP, Envelope, MessagePayload, ConversationPayload, PresencePayload,
    ReadReceiptPayload, Source, TypingPayload,
};
use crate::names;
use crate::pool::{ChannelPool, PoolError};
use crate::retry::RetryPolicy;
use crate::transport::{Transport, TransportError};
use crate::transport::ws::WsTransport;

// =============================================================================
// POOLED NOTIFIERS
// =============================================================================

/// Announce a persisted message on the organization channel.
pub async fn notify_message_created(
    pool: &ChannelPool,
    source: Source,
    conversation_id: Uuid,
    message: Value,
) -> bool {
    let organization_id = pool.organization_id();
    let payload = MessagePayload { message, conversation_id, organization_id };
    let Some(env) = envelope_for(EVENT_MESSAGE_CREATED, &payload, organization_id, Some(conversation_id), source)
    else {
        return false;
    };
    send_with_retry(pool, &names::organization(organization_id), env).await
}

/// Announce conversation field changes on the organization channel.
pub async fn notify_conversation_updated(
    pool: &ChannelPool,
    source: Source,
    conversation_id: Uuid,
    updates: Value,
) -> bool {
    let organization_id = pool.organization_id();
    let payload = ConversationPayload { updates, conversation_id, organization_id };
    let Some(env) =
        envelope_for(EVENT_CONVERSATION_UPDATED, &payload, organization_id, Some(conversation_id), source)
    else {
        return false;
    };
    send_with_retry(pool, &names::organization(organization_id), env).await
}

/// Announce a read receipt on the organization channel.
pub async fn notify_read_receipt(
    pool: &ChannelPool,
    source: Source,
    conversation_id: Uuid,
    receipt: ReadReceiptPayload,
) -> bool {
    let organization_id = pool.organization_id();
    let Some(env) = envelope_for(EVENT_READ_RECEIPT, &receipt, organization_id, Some(conversation_id), source)
    else {
        return false;
    };
    send_with_retry(pool, &names::organization(organization_id), env).await
}

/// Publish a typing payload on the conversation's typing channel.
/// Widget surfaces without a [`crate::typing::TypingPreview`] use this
/// directly; the event name follows `is_typing`.
pub async fn notify_typing(pool: &ChannelPool, source: Source, payload: TypingPayload) -> bool {
    let organization_id = pool.organization_id();
    let conversation_id = payload.conversation_id;
    let event = if payload.is_typing { EVENT_TYPING_START } else { EVENT_TYPING_STOP };
    let Some(env) = envelope_for(event, &payload, organization_id, Some(conversation_id), source) else {
        return false;
    };
    send_with_retry(pool, &names::typing(organization_id, conversation_id), env).await
}

fn envelope_for<T: serde::Serialize>(
    event: &str,
    payload: &T,
    organization_id: Uuid,
    conversation_id: Option<Uuid>,
    source: Source,
) -> Option<Envelope> {
    match serde_json::to_value(payload) {
        Ok(value) => Some(Envelope::new(event, value, organization_id, conversation_id, source)),
        Err(e) => {
            warn!(event, error = %e, "broadcast payload serialization failed");
            None
        }
    }
}

async fn send_with_retry(pool: &ChannelPool, topic: &str, env: Envelope) -> bool {
    let policy = RetryPolicy::sender();
    let payload = match serde_json::to_value(&env) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "broadcast envelope serialization failed");
            return false;
        }
    };

    for attempt in 1..=policy.max_attempts {
        match pool.send(topic, &env.event, payload.clone()).await {
            Ok(()) => return true,
            // A missing subscription will not fix itself by waiting.
            Err(e @ PoolError::NotSubscribed(_)) => {
                warn!(error = %e, topic, "broadcast on unsubscribed channel");
                return false;
            }
            Err(e) if policy.allows_retry(attempt) => {
                warn!(error = %e, topic, attempt, "broadcast failed; retrying");
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
            Err(e) => {
                warn!(error = %e, topic, "broadcast failed; giving up");
                return false;
            }
        }
    }
    false
}

// =============================================================================
// PRIVILEGED BROADCASTER
// =============================================================================

/// Server-side one-shot broadcaster. Each send opens a connection,
/// joins the target topics, publishes, and tears down.
pub struct Broadcaster {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl Broadcaster {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport, retry: RetryPolicy::sender() }
    }

    /// Build a privileged broadcaster from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingServiceKey`] (or `MissingUrl`) when
    /// the privileged credentials are not configured. Callers treat this
    /// as "notification side effect unavailable", not as a failure of
    /// the request that wanted to notify.
    pub fn from_config(config: &RealtimeConfig) -> Result<Self, ConfigError> {
        let url = config.require_url()?;
        let service_key = config.require_service_key()?;
        Ok(Self::new(Arc::new(WsTransport::new(url, service_key))))
    }

    /// Fan a persisted message out to the organization and conversation
    /// channels.
    pub async fn broadcast_message_created(
        &self,
        organization_id: Uuid,
        conversation_id: Uuid,
        message: Value,
    ) -> bool {
        let payload = MessagePayload { message, conversation_id, organization_id };
        let Some(env) =
            envelope_for(EVENT_MESSAGE_CREATED, &payload, organization_id, Some(conversation_id), Source::Server)
        else {
            return false;
        };
        let topics = [
            names::organization(organization_id),
            names::conversation(organization_id, conversation_id),
        ];
        self.publish(&topics, env).await
    }

    /// Fan conversation changes out to the organization and conversation
    /// channels.
    pub async fn broadcast_conversation_updated(
        &self,
        organization_id: Uuid,
        conversation_id: Uuid,
        updates: Value,
    ) -> bool {
        let payload = ConversationPayload { updates, conversation_id, organization_id };
        let Some(env) = envelope_for(
            EVENT_CONVERSATION_UPDATED,
            &payload,
            organization_id,
            Some(conversation_id),
            Source::Server,
        ) else {
            return false;
        };
        let topics = [
            names::organization(organization_id),
            names::conversation(organization_id, conversation_id),
        ];
        self.publish(&topics, env).await
    }

    /// Announce a read receipt on the conversation channel.
    pub async fn broadcast_read_receipt(
        &self,
        organization_id: Uuid,
        conversation_id: Uuid,
        receipt: ReadReceiptPayload,
    ) -> bool {
        let Some(env) =
            envelope_for(EVENT_READ_RECEIPT, &receipt, organization_id, Some(conversation_id), Source::Server)
        else {
            return false;
        };
        let topics = [names::conversation(organization_id, conversation_id)];
        self.publish(&topics, env).await
    }

    /// Announce a presence change on the organization channel.
    pub async fn broadcast_presence(&self, organization_id: Uuid, presence: PresencePayload) -> bool {
        let Some(env) = envelope_for(EVENT_PRESENCE_UPDATE, &presence, organization_id, None, Source::Server)
        else {
            return false;
        };
        let topics = [names::organization(organization_id)];
        self.publish(&topics, env).await
    }

    async fn publish(&self, topics: &[String], env: Envelope) -> bool {
        let payload = match serde_json::to_value(&env) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "broadcast envelope serialization failed");
                return false;
            }
        };

        for attempt in 1..=self.retry.max_attempts {
            match self.try_publish(topics, &env.event, &payload).await {
                Ok(()) => return true,
                Err(e) if self.retry.allows_retry(attempt) => {
                    warn!(error = %e, attempt, "one-shot broadcast failed; retrying");
                    tokio::time::sleep(self.retry.delay_for(attempt)).await;
                }
                Err(e) => {
                    warn!(error = %e, "one-shot broadcast failed; giving up");
                    return false;
                }
            }
        }
        false
    }

    async fn try_publish(&self, topics: &[String], event: &str, payload: &Value) -> Result<(), TransportError> {
        let mut conn = self.transport.connect().await?;
        for topic in topics {
            conn.join(topic).await?;
            conn.publish(topic, event, payload.clone()).await?;
            conn.leave(topic).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "broadcast_test.rs"]
mod tests;
