//! Per-conversation typing preview.
//!
//! DESIGN
//! ======
//! Bidirectional typing-state exchange on one conversation's typing
//! topic. Outbound previews are throttled to one publish per 200 ms:
//! the first keystroke sends immediately, later ones inside the window
//! coalesce into a trailing timer that fires with the latest content.
//! Content is capped at 100 chars on the wire and resending unchanged
//! content is a no-op.
//!
//! Inbound previews upsert a per-user entry keyed by user id; the local
//! user is always filtered out. A once-per-second sweep drops entries
//! not refreshed within 3 s, so a peer that crashed mid-keystroke
//! disappears without an explicit stop event. `stop_typing` clears
//! local state, cancels the trailing timer, and tells peers
//! immediately.
//!
//! Every send here is a best-effort UX side channel: failures are
//! logged and reported as `false`, never propagated.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::envelope::{self, EVENT_TYPING_START, EVENT_TYPING_STOP, Envelope, Source, TypingPayload};
use crate::names;
use crate::pool::{ChannelPool, PoolError, PoolEvent, Subscription};

/// At most one preview publish per conversation per window.
const PREVIEW_THROTTLE: Duration = Duration::from_millis(200);
/// Wire-level cap for preview content.
const PREVIEW_MAX_CHARS: usize = 100;
/// A peer not refreshed within this window is no longer typing.
const TYPING_TTL: Duration = Duration::from_millis(3000);
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// A peer currently typing in this conversation.
#[derive(Debug, Clone)]
pub struct TypingUser {
    pub user_id: Uuid,
    pub user_name: String,
    /// Live content preview, if the peer shares one.
    pub preview: Option<String>,
    /// Which surface the peer is typing from.
    pub sender: Source,
    /// When this entry was last refreshed (local clock).
    pub last_seen: Instant,
}

// =============================================================================
// THROTTLE
// =============================================================================

struct SendState {
    last_sent_at: Option<Instant>,
    last_content: Option<String>,
    pending_content: Option<String>,
    pending_timer: Option<JoinHandle<()>>,
}

impl SendState {
    fn new() -> Self {
        Self { last_sent_at: None, last_content: None, pending_content: None, pending_timer: None }
    }
}

enum Throttle {
    SendNow,
    Defer(Duration),
    Skip,
}

/// Decide what to do with a new preview at time `now`, updating the
/// send state accordingly.
fn throttle_decision(state: &mut SendState, content: &str, now: Instant) -> Throttle {
    if state.last_content.as_deref() == Some(content) {
        return Throttle::Skip;
    }
    state.last_content = Some(content.to_owned());

    let elapsed = state.last_sent_at.map(|prev| now.duration_since(prev));
    match elapsed {
        Some(elapsed) if elapsed < PREVIEW_THROTTLE => {
            state.pending_content = Some(content.to_owned());
            Throttle::Defer(PREVIEW_THROTTLE - elapsed)
        }
        _ => {
            state.last_sent_at = Some(now);
            state.pending_content = None;
            Throttle::SendNow
        }
    }
}

fn truncate_preview(content: &str) -> String {
    content.chars().take(PREVIEW_MAX_CHARS).collect()
}

// =============================================================================
// TYPING PREVIEW
// =============================================================================

/// Bidirectional typing-preview handle for one conversation.
pub struct TypingPreview {
    organization_id: Uuid,
    conversation_id: Uuid,
    user_id: Uuid,
    user_name: String,
    source: Source,
    topic: String,
    pool: Arc<ChannelPool>,
    users: Arc<Mutex<HashMap<Uuid, TypingUser>>>,
    send_state: Arc<Mutex<SendState>>,
    recv_task: JoinHandle<()>,
    sweep_task: JoinHandle<()>,
}

impl TypingPreview {
    /// Subscribe to the conversation's typing topic and start the
    /// receive and sweep tasks.
    ///
    /// # Errors
    ///
    /// Propagates the pool's subscribe failure.
    pub async fn subscribe(
        pool: Arc<ChannelPool>,
        organization_id: Uuid,
        conversation_id: Uuid,
        user_id: Uuid,
        user_name: impl Into<String>,
        source: Source,
    ) -> Result<Self, PoolError> {
        let topic = names::typing(organization_id, conversation_id);
        let sub = pool.subscribe(&topic).await?;

        let users = Arc::new(Mutex::new(HashMap::new()));
        let recv_task = tokio::spawn(receive_loop(sub, Arc::clone(&users), user_id));
        let sweep_task = tokio::spawn(sweep_loop(Arc::clone(&users)));

        Ok(Self {
            organization_id,
            conversation_id,
            user_id,
            user_name: user_name.into(),
            source,
            topic,
            pool,
            users,
            send_state: Arc::new(Mutex::new(SendState::new())),
            recv_task,
            sweep_task,
        })
    }

    #[must_use]
    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    /// Share the current draft content with peers, throttled. Returns
    /// `false` only when an immediate publish failed; deferred and
    /// skipped updates report `true`.
    pub async fn update_preview(&self, content: &str) -> bool {
        let decision = {
            let mut state = lock(&self.send_state);
            throttle_decision(&mut state, content, Instant::now())
        };
        match decision {
            Throttle::Skip => true,
            Throttle::SendNow => self.publish_typing(Some(truncate_preview(content)), true).await,
            Throttle::Defer(delay) => {
                self.schedule_trailing(delay);
                true
            }
        }
    }

    /// Stop typing: clear local throttle state, cancel the trailing
    /// timer, and tell peers immediately so they need not wait out the
    /// liveness timeout.
    pub async fn stop_typing(&self) -> bool {
        {
            let mut state = lock(&self.send_state);
            if let Some(timer) = state.pending_timer.take() {
                timer.abort();
            }
            state.pending_content = None;
            state.last_content = None;
            state.last_sent_at = None;
        }
        self.publish_typing(None, false).await
    }

    /// Peers currently typing, sorted by name. Entries past the
    /// liveness window are excluded even if the sweep has not run yet.
    #[must_use]
    pub fn typing_users(&self) -> Vec<TypingUser> {
        snapshot_at(&lock(&self.users), Instant::now())
    }

    fn schedule_trailing(&self, delay: Duration) {
        let mut state = lock(&self.send_state);
        if state.pending_timer.as_ref().is_some_and(|timer| !timer.is_finished()) {
            return;
        }

        let send_state = Arc::clone(&self.send_state);
        let pool = Arc::clone(&self.pool);
        let topic = self.topic.clone();
        let organization_id = self.organization_id;
        let conversation_id = self.conversation_id;
        let user_id = self.user_id;
        let user_name = self.user_name.clone();
        let source = self.source;

        state.pending_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let content = {
                let mut state = lock(&send_state);
                let content = state.pending_content.take();
                if content.is_some() {
                    state.last_sent_at = Some(Instant::now());
                }
                content
            };
            if let Some(content) = content {
                publish_typing(
                    &pool,
                    &topic,
                    organization_id,
                    conversation_id,
                    user_id,
                    &user_name,
                    source,
                    Some(truncate_preview(&content)),
                    true,
                )
                .await;
            }
        }));
    }

    async fn publish_typing(&self, content: Option<String>, is_typing: bool) -> bool {
        publish_typing(
            &self.pool,
            &self.topic,
            self.organization_id,
            self.conversation_id,
            self.user_id,
            &self.user_name,
            self.source,
            content,
            is_typing,
        )
        .await
    }
}

impl Drop for TypingPreview {
    fn drop(&mut self) {
        self.recv_task.abort();
        self.sweep_task.abort();
        let mut state = lock(&self.send_state);
        if let Some(timer) = state.pending_timer.take() {
            timer.abort();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn publish_typing(
    pool: &ChannelPool,
    topic: &str,
    organization_id: Uuid,
    conversation_id: Uuid,
    user_id: Uuid,
    user_name: &str,
    source: Source,
    content: Option<String>,
    is_typing: bool,
) -> bool {
    let payload = TypingPayload {
        user_id,
        user_name: user_name.to_owned(),
        conversation_id,
        content,
        is_typing,
        ts: envelope::now_ms(),
    };
    let event = if is_typing { EVENT_TYPING_START } else { EVENT_TYPING_STOP };
    let env = Envelope::new(
        event,
        match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "typing payload serialization failed");
                return false;
            }
        },
        organization_id,
        Some(conversation_id),
        source,
    );
    let value = match serde_json::to_value(&env) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "typing envelope serialization failed");
            return false;
        }
    };

    match pool.send(topic, event, value).await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, topic, "typing broadcast failed");
            false
        }
    }
}

// =============================================================================
// RECEIVE + SWEEP
// =============================================================================

async fn receive_loop(mut sub: Subscription, users: Arc<Mutex<HashMap<Uuid, TypingUser>>>, self_user_id: Uuid) {
    while let Some(event) = sub.recv().await {
        let PoolEvent::Broadcast { event, payload } = event else {
            continue;
        };
        let env: Envelope = match serde_json::from_value(payload) {
            Ok(env) => env,
            Err(e) => {
                debug!(event, error = %e, "typing broadcast without envelope dropped");
                continue;
            }
        };
        let canonical = envelope::canonical_event(&event);
        if canonical != EVENT_TYPING_START && canonical != EVENT_TYPING_STOP {
            continue;
        }
        let payload: TypingPayload = match serde_json::from_value(env.payload) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(event, error = %e, "malformed typing payload dropped");
                continue;
            }
        };
        if payload.user_id == self_user_id {
            continue;
        }

        let stopped = canonical == EVENT_TYPING_STOP || !payload.is_typing;
        apply_typing(&users, stopped, payload, env.source, Instant::now());
    }
}

fn apply_typing(
    users: &Mutex<HashMap<Uuid, TypingUser>>,
    stopped: bool,
    payload: TypingPayload,
    sender: Source,
    now: Instant,
) {
    let mut users = lock(users);
    if stopped {
        users.remove(&payload.user_id);
        return;
    }
    users.insert(
        payload.user_id,
        TypingUser {
            user_id: payload.user_id,
            user_name: payload.user_name,
            preview: payload.content,
            sender,
            last_seen: now,
        },
    );
}

async fn sweep_loop(users: Arc<Mutex<HashMap<Uuid, TypingUser>>>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        sweep_at(&mut lock(&users), Instant::now());
    }
}

/// Drop entries whose last refresh is older than the liveness window.
fn sweep_at(users: &mut HashMap<Uuid, TypingUser>, now: Instant) {
    users.retain(|_, user| now.duration_since(user.last_seen) <= TYPING_TTL);
}

fn snapshot_at(users: &HashMap<Uuid, TypingUser>, now: Instant) -> Vec<TypingUser> {
    let mut list: Vec<TypingUser> = users
        .values()
        .filter(|user| now.duration_since(user.last_seen) <= TYPING_TTL)
        .cloned()
        .collect();
    list.sort_by(|a, b| a.user_name.cmp(&b.user_name));
    list
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "typing_test.rs"]
mod tests;
