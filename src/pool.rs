//! Channel pool — owns every live subscription for one organization.
//!
//! DESIGN
//! ======
//! One pool per organization, shared by every consumer in the process
//! (see [`PoolSet`]). A driver task owns the transport connection and
//! runs a `select!` loop over outbound commands, inbound events, and a
//! heartbeat. Consumers never touch the connection: `subscribe` and
//! `send` go through a command queue, and inbound events fan out to
//! per-subscription channels.
//!
//! LIFECYCLE
//! =========
//! 1. `spawn` → driver connects, status `Connecting → Connected`
//! 2. Connection loss (stream end, send failure, missed heartbeat) →
//!    status `Reconnecting`, exponential backoff, reconnect, re-join
//!    every registered topic in original registration order
//! 3. Subscriptions unregister on drop; topics with no subscribers are
//!    left by a periodic idle sweep
//! 4. Dropping the pool aborts the driver and sweeper
//!
//! ERROR HANDLING
//! ==============
//! Transport failures never escape to consumers as panics: they surface
//! as `Reconnecting`/`Error` status plus `last_error` in the health
//! snapshot, while commands submitted mid-outage wait in the queue and
//! time out if the outage outlasts them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RealtimeConfig;
use crate::envelope::now_ms;
use crate::retry::RetryPolicy;
use crate::transport::{ChangeEvent, Connection, Inbound, Transport, TransportError};

const SUBSCRIPTION_BUFFER: usize = 256;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("not subscribed to channel {0}")]
    NotSubscribed(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("channel pool is shut down")]
    Closed,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Pool-level connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

/// Read-only health snapshot for UI display.
#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    pub status: ConnectionStatus,
    /// Milliseconds since the Unix epoch of the last successful connect.
    pub last_connected_ms: Option<i64>,
    /// Consecutive failed attempts; reset to 0 once connected.
    pub reconnect_attempts: u32,
    /// Heartbeat round-trip time.
    pub latency_ms: Option<u64>,
    pub events_in: u64,
    pub events_out: u64,
    pub last_error: Option<String>,
}

impl ConnectionHealth {
    fn new() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            last_connected_ms: None,
            reconnect_attempts: 0,
            latency_ms: None,
            events_in: 0,
            events_out: 0,
            last_error: None,
        }
    }
}

/// An event delivered to one subscription.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    Broadcast { event: String, payload: Value },
    Change(ChangeEvent),
}

enum Command {
    Join { topic: String, ack: oneshot::Sender<Result<(), PoolError>> },
    Leave { topic: String },
    Publish { topic: String, event: String, payload: Value, ack: oneshot::Sender<Result<(), PoolError>> },
}

struct TopicState {
    topic: String,
    joined: bool,
    subs: Vec<(u64, mpsc::Sender<PoolEvent>)>,
    idle_since: Option<Instant>,
}

struct PoolShared {
    /// Registration-ordered: reconnect re-joins topics in this order.
    topics: Mutex<Vec<TopicState>>,
    health: Mutex<ConnectionHealth>,
    status_tx: watch::Sender<ConnectionStatus>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    next_sub_id: AtomicU64,
    subscribe_timeout: Duration,
}

// =============================================================================
// SUBSCRIPTION
// =============================================================================

/// A live subscription to one topic. Dropping it unregisters the
/// consumer; the last consumer gone leaves the topic idle for the sweep
/// to reclaim.
pub struct Subscription {
    topic: String,
    id: u64,
    events: mpsc::Receiver<PoolEvent>,
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next event on this topic. `None` once the pool is gone.
    pub async fn recv(&mut self) -> Option<PoolEvent> {
        self.events.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        remove_sub(&self.shared, &self.topic, self.id);
    }
}

fn remove_sub(shared: &PoolShared, topic: &str, id: u64) {
    let mut topics = lock(&shared.topics);
    if let Some(state) = topics.iter_mut().find(|t| t.topic == topic) {
        state.subs.retain(|(sub_id, _)| *sub_id != id);
        if state.subs.is_empty() {
            state.idle_since = Some(Instant::now());
        }
    }
}

// =============================================================================
// POOL
// =============================================================================

/// Pooled realtime client for one organization.
pub struct ChannelPool {
    organization_id: Uuid,
    shared: Arc<PoolShared>,
    driver: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl ChannelPool {
    /// Spawn the driver and idle sweeper. The pool starts connecting
    /// immediately.
    #[must_use]
    pub fn spawn(transport: Arc<dyn Transport>, organization_id: Uuid, config: &RealtimeConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);

        let shared = Arc::new(PoolShared {
            topics: Mutex::new(Vec::new()),
            health: Mutex::new(ConnectionHealth::new()),
            status_tx,
            cmd_tx,
            next_sub_id: AtomicU64::new(0),
            subscribe_timeout: config.subscribe_timeout,
        });

        let driver = tokio::spawn(drive(
            transport,
            Arc::clone(&shared),
            cmd_rx,
            organization_id,
            config.reconnect,
            config.heartbeat_interval,
        ));
        let sweeper = tokio::spawn(sweep_idle(
            Arc::clone(&shared),
            config.idle_sweep_interval,
            config.idle_max_age,
        ));

        Self { organization_id, shared, driver, sweeper }
    }

    #[must_use]
    pub fn organization_id(&self) -> Uuid {
        self.organization_id
    }

    /// Subscribe to a topic. Waits for the topic join to complete on a
    /// live connection, up to the configured subscribe timeout.
    ///
    /// Multiple subscriptions to one topic share the underlying join;
    /// each gets an independent event stream.
    ///
    /// # Errors
    ///
    /// [`PoolError::Timeout`] when no live connection could join the
    /// topic in time; [`PoolError::Transport`] when the join itself
    /// failed; [`PoolError::Closed`] when the pool is shut down.
    pub async fn subscribe(&self, topic: &str) -> Result<Subscription, PoolError> {
        let id = self.shared.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        {
            let mut topics = lock(&self.shared.topics);
            let idx = match topics.iter().position(|t| t.topic == topic) {
                Some(idx) => idx,
                None => {
                    topics.push(TopicState {
                        topic: topic.to_owned(),
                        joined: false,
                        subs: Vec::new(),
                        idle_since: None,
                    });
                    topics.len() - 1
                }
            };
            let state = &mut topics[idx];
            state.subs.push((id, tx));
            state.idle_since = None;
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .shared
            .cmd_tx
            .send(Command::Join { topic: topic.to_owned(), ack: ack_tx })
            .is_err()
        {
            remove_sub(&self.shared, topic, id);
            return Err(PoolError::Closed);
        }

        match tokio::time::timeout(self.shared.subscribe_timeout, ack_rx).await {
            Ok(Ok(Ok(()))) => Ok(Subscription {
                topic: topic.to_owned(),
                id,
                events: rx,
                shared: Arc::clone(&self.shared),
            }),
            Ok(Ok(Err(e))) => {
                remove_sub(&self.shared, topic, id);
                Err(e)
            }
            Ok(Err(_)) => {
                remove_sub(&self.shared, topic, id);
                Err(PoolError::Closed)
            }
            Err(_) => {
                remove_sub(&self.shared, topic, id);
                Err(PoolError::Timeout(self.shared.subscribe_timeout))
            }
        }
    }

    /// Publish on a topic this pool is actively subscribed to.
    ///
    /// # Errors
    ///
    /// [`PoolError::NotSubscribed`] when no live subscription exists for
    /// the topic in this pool — callers must subscribe before sending on
    /// a pooled channel.
    pub async fn send(&self, topic: &str, event: &str, payload: Value) -> Result<(), PoolError> {
        {
            let topics = lock(&self.shared.topics);
            let active = topics.iter().any(|t| t.topic == topic && !t.subs.is_empty());
            if !active {
                return Err(PoolError::NotSubscribed(topic.to_owned()));
            }
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        let cmd = Command::Publish {
            topic: topic.to_owned(),
            event: event.to_owned(),
            payload,
            ack: ack_tx,
        };
        if self.shared.cmd_tx.send(cmd).is_err() {
            return Err(PoolError::Closed);
        }

        match tokio::time::timeout(self.shared.subscribe_timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PoolError::Closed),
            Err(_) => Err(PoolError::Timeout(self.shared.subscribe_timeout)),
        }
    }

    /// Current health snapshot.
    #[must_use]
    pub fn health(&self) -> ConnectionHealth {
        lock(&self.shared.health).clone()
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status_tx.borrow()
    }

    /// Watch channel for status transitions (for UI indicators).
    #[must_use]
    pub fn status_rx(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status_tx.subscribe()
    }
}

impl Drop for ChannelPool {
    fn drop(&mut self) {
        self.driver.abort();
        self.sweeper.abort();
    }
}

// =============================================================================
// POOL SET
// =============================================================================

/// Process-wide registry handing out one shared pool per organization.
/// Holding only `Weak` references, it lets the last consumer dropping
/// its `Arc` tear the pool down.
pub struct PoolSet {
    transport: Arc<dyn Transport>,
    config: RealtimeConfig,
    pools: Mutex<HashMap<Uuid, Weak<ChannelPool>>>,
}

impl PoolSet {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: RealtimeConfig) -> Self {
        Self { transport, config, pools: Mutex::new(HashMap::new()) }
    }

    /// The shared pool for an organization, creating it on first use.
    #[must_use]
    pub fn organization(&self, organization_id: Uuid) -> Arc<ChannelPool> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = pools.get(&organization_id).and_then(Weak::upgrade) {
            return existing;
        }
        let pool = Arc::new(ChannelPool::spawn(
            Arc::clone(&self.transport),
            organization_id,
            &self.config,
        ));
        pools.insert(organization_id, Arc::downgrade(&pool));
        pool
    }
}

// =============================================================================
// DRIVER
// =============================================================================

enum LoopExit {
    Lost,
    Shutdown,
}

async fn drive(
    transport: Arc<dyn Transport>,
    shared: Arc<PoolShared>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    organization_id: Uuid,
    reconnect: RetryPolicy,
    heartbeat_interval: Duration,
) {
    let mut attempts: u32 = 0;
    let mut connected_before = false;

    loop {
        set_status(
            &shared,
            if connected_before { ConnectionStatus::Reconnecting } else { ConnectionStatus::Connecting },
        );

        let mut conn = match transport.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(%organization_id, error = %e, "realtime connect failed");
                if backoff_or_give_up(&shared, reconnect, &mut attempts, &e).await {
                    continue;
                }
                return;
            }
        };

        let Some(mut events) = conn.events() else {
            warn!(%organization_id, "transport yielded no inbound stream");
            record_error(&shared, &TransportError::Closed);
            set_status(&shared, ConnectionStatus::Error);
            return;
        };

        // Re-join every registered topic in original registration order.
        let registered: Vec<String> = lock(&shared.topics).iter().map(|t| t.topic.clone()).collect();
        let mut join_error = None;
        for topic in registered {
            match conn.join(&topic).await {
                Ok(()) => mark_joined(&shared, &topic),
                Err(e) => {
                    warn!(%organization_id, %topic, error = %e, "topic rejoin failed");
                    join_error = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = join_error {
            mark_all_unjoined(&shared);
            if backoff_or_give_up(&shared, reconnect, &mut attempts, &e).await {
                continue;
            }
            return;
        }

        attempts = 0;
        {
            let mut health = lock(&shared.health);
            health.reconnect_attempts = 0;
            health.last_connected_ms = Some(now_ms());
            health.last_error = None;
        }
        set_status(&shared, ConnectionStatus::Connected);
        info!(%organization_id, "realtime connected");

        let exit = run_connected(&mut conn, &mut events, &mut cmd_rx, &shared, heartbeat_interval).await;
        mark_all_unjoined(&shared);
        match exit {
            LoopExit::Shutdown => return,
            LoopExit::Lost => {
                connected_before = true;
                attempts = 1;
                {
                    let mut health = lock(&shared.health);
                    health.reconnect_attempts = attempts;
                }
                set_status(&shared, ConnectionStatus::Reconnecting);
                tokio::time::sleep(reconnect.delay_for(attempts)).await;
            }
        }
    }
}

/// Record a failure and sleep out the backoff. Returns `false` when the
/// policy is exhausted, in which case the driver parks in `Error`.
async fn backoff_or_give_up(
    shared: &PoolShared,
    reconnect: RetryPolicy,
    attempts: &mut u32,
    error: &TransportError,
) -> bool {
    record_error(shared, error);
    *attempts = attempts.saturating_add(1);
    {
        let mut health = lock(&shared.health);
        health.reconnect_attempts = *attempts;
    }
    if !reconnect.allows_retry(*attempts) {
        set_status(shared, ConnectionStatus::Error);
        return false;
    }
    tokio::time::sleep(reconnect.delay_for(*attempts)).await;
    true
}

async fn run_connected(
    conn: &mut Box<dyn Connection>,
    events: &mut mpsc::Receiver<Inbound>,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    shared: &PoolShared,
    heartbeat_interval: Duration,
) -> LoopExit {
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            maybe_cmd = cmd_rx.recv() => {
                let Some(cmd) = maybe_cmd else { return LoopExit::Shutdown };
                match cmd {
                    Command::Join { topic, ack } => {
                        let result = handle_join(conn, shared, &topic).await;
                        let lost = result.is_err();
                        let _ = ack.send(result.map_err(PoolError::from));
                        if lost {
                            return LoopExit::Lost;
                        }
                    }
                    Command::Leave { topic } => {
                        if let Err(e) = conn.leave(&topic).await {
                            record_error(shared, &e);
                            return LoopExit::Lost;
                        }
                    }
                    Command::Publish { topic, event, payload, ack } => {
                        match conn.publish(&topic, &event, payload).await {
                            Ok(()) => {
                                lock(&shared.health).events_out += 1;
                                let _ = ack.send(Ok(()));
                            }
                            Err(e) => {
                                record_error(shared, &e);
                                let _ = ack.send(Err(e.into()));
                                return LoopExit::Lost;
                            }
                        }
                    }
                }
            }
            maybe_inbound = events.recv() => {
                let Some(inbound) = maybe_inbound else {
                    warn!("realtime inbound stream ended");
                    record_error(shared, &TransportError::Closed);
                    return LoopExit::Lost;
                };
                dispatch(shared, inbound);
            }
            _ = heartbeat.tick() => {
                let started = Instant::now();
                match conn.ping().await {
                    Ok(()) => {
                        let elapsed = started.elapsed().as_millis();
                        lock(&shared.health).latency_ms = Some(u64::try_from(elapsed).unwrap_or(u64::MAX));
                    }
                    Err(e) => {
                        warn!(error = %e, "heartbeat failed");
                        record_error(shared, &e);
                        return LoopExit::Lost;
                    }
                }
            }
        }
    }
}

/// Join a topic on the live connection unless it is already joined or
/// its last subscriber vanished while the command was queued.
async fn handle_join(
    conn: &mut Box<dyn Connection>,
    shared: &PoolShared,
    topic: &str,
) -> Result<(), TransportError> {
    let needs_join = {
        let topics = lock(&shared.topics);
        match topics.iter().find(|t| t.topic == topic) {
            None => return Ok(()),
            Some(state) => !state.joined,
        }
    };
    if needs_join {
        conn.join(topic).await?;
        mark_joined(shared, topic);
    }
    Ok(())
}

fn dispatch(shared: &PoolShared, inbound: Inbound) {
    lock(&shared.health).events_in += 1;

    let (topic, event) = match inbound {
        Inbound::Broadcast { topic, event, payload } => (topic, PoolEvent::Broadcast { event, payload }),
        Inbound::Change { topic, change } => (topic, PoolEvent::Change(change)),
    };

    let targets: Vec<mpsc::Sender<PoolEvent>> = {
        let topics = lock(&shared.topics);
        match topics.iter().find(|t| t.topic == topic) {
            Some(state) => state.subs.iter().map(|(_, tx)| tx.clone()).collect(),
            None => {
                debug!(%topic, "event for unregistered topic dropped");
                return;
            }
        }
    };
    for tx in targets {
        // Best-effort: a subscriber that stopped draining misses events.
        let _ = tx.try_send(event.clone());
    }
}

async fn sweep_idle(shared: Arc<PoolShared>, sweep_interval: Duration, max_age: Duration) {
    let mut ticker = tokio::time::interval(sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let expired: Vec<String> = {
            let mut topics = lock(&shared.topics);
            let now = Instant::now();
            let expired: Vec<String> = topics
                .iter()
                .filter(|t| {
                    t.subs.is_empty()
                        && t.idle_since.is_some_and(|since| now.duration_since(since) > max_age)
                })
                .map(|t| t.topic.clone())
                .collect();
            topics.retain(|t| !expired.contains(&t.topic));
            expired
        };
        for topic in expired {
            debug!(%topic, "evicting idle channel");
            let _ = shared.cmd_tx.send(Command::Leave { topic });
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn set_status(shared: &PoolShared, status: ConnectionStatus) {
    lock(&shared.health).status = status;
    let _ = shared.status_tx.send_replace(status);
}

fn record_error(shared: &PoolShared, error: &TransportError) {
    lock(&shared.health).last_error = Some(error.to_string());
}

fn mark_joined(shared: &PoolShared, topic: &str) {
    let mut topics = lock(&shared.topics);
    if let Some(state) = topics.iter_mut().find(|t| t.topic == topic) {
        state.joined = true;
    }
}

fn mark_all_unjoined(shared: &PoolShared) {
    let mut topics = lock(&shared.topics);
    for state in topics.iter_mut() {
        state.joined = false;
    }
}

#[cfg(test)]
#[path = "pool_test.rs"]
mod tests;
