//! Presence broadcast helpers.
//!
//! Thin fire-and-forget wrappers with no state of their own: a presence
//! signal that fails to send is logged and forgotten, never allowed to
//! fail whatever the user was actually doing.

use tracing::warn;
use uuid::Uuid;

use crate::envelope::{self, EVENT_PRESENCE_UPDATE, Envelope, PresencePayload, PresenceStatus, Source};
use crate::names;
use crate::pool::ChannelPool;

/// Broadcast a presence change on the organization channel. Returns
/// `false` when the realtime side channel failed; callers must not fail
/// their primary operation because of it.
pub async fn broadcast_presence(pool: &ChannelPool, user_id: Uuid, status: PresenceStatus, source: Source) -> bool {
    let organization_id = pool.organization_id();
    let payload = PresencePayload {
        user_id,
        status,
        is_online: status == PresenceStatus::Online,
        last_seen: envelope::now_ms(),
    };
    let env = Envelope::new(
        EVENT_PRESENCE_UPDATE,
        match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "presence payload serialization failed");
                return false;
            }
        },
        organization_id,
        None,
        source,
    );
    let value = match serde_json::to_value(&env) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "presence envelope serialization failed");
            return false;
        }
    };

    match pool.send(&names::organization(organization_id), EVENT_PRESENCE_UPDATE, value).await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, %user_id, "presence broadcast failed");
            false
        }
    }
}

/// Signal that a user came online.
pub async fn mark_online(pool: &ChannelPool, user_id: Uuid, source: Source) -> bool {
    broadcast_presence(pool, user_id, PresenceStatus::Online, source).await
}

/// Signal that a user went idle.
pub async fn mark_away(pool: &ChannelPool, user_id: Uuid, source: Source) -> bool {
    broadcast_presence(pool, user_id, PresenceStatus::Away, source).await
}

/// Signal that a user left.
pub async fn mark_offline(pool: &ChannelPool, user_id: Uuid, source: Source) -> bool {
    broadcast_presence(pool, user_id, PresenceStatus::Offline, source).await
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
