use super::*;
use crate::config::RealtimeConfig;
use crate::transport::memory::MemoryHub;
use crate::transport::{Connection, Inbound, Transport};
use tokio::sync::mpsc;
use tokio::time::timeout;

// =============================================================================
// THROTTLE DECISIONS
// =============================================================================

#[test]
fn first_update_sends_immediately() {
    let mut state = SendState::new();
    let t0 = Instant::now();
    assert!(matches!(throttle_decision(&mut state, "H", t0), Throttle::SendNow));
}

#[test]
fn rapid_updates_inside_window_defer_to_one_send() {
    let mut state = SendState::new();
    let t0 = Instant::now();

    let mut immediate = 0;
    for i in 0..10u64 {
        let content = format!("draft {i}");
        match throttle_decision(&mut state, &content, t0 + Duration::from_millis(i * 10)) {
            Throttle::SendNow => immediate += 1,
            Throttle::Defer(_) => {}
            Throttle::Skip => panic!("changing content must not be skipped"),
        }
    }
    assert_eq!(immediate, 1, "at most one immediate send per window");
    assert_eq!(state.pending_content.as_deref(), Some("draft 9"));
}

#[test]
fn spaced_updates_send_every_time() {
    let mut state = SendState::new();
    let t0 = Instant::now();

    for i in 0..4u64 {
        let content = format!("draft {i}");
        let decision = throttle_decision(&mut state, &content, t0 + Duration::from_millis(i * 250));
        assert!(matches!(decision, Throttle::SendNow), "update {i} should send");
    }
}

#[test]
fn window_boundary_sends_immediately() {
    let mut state = SendState::new();
    let t0 = Instant::now();
    assert!(matches!(throttle_decision(&mut state, "a", t0), Throttle::SendNow));
    assert!(matches!(
        throttle_decision(&mut state, "ab", t0 + Duration::from_millis(199)),
        Throttle::Defer(_)
    ));
    // Exactly one window later a new send is allowed.
    let mut fresh = SendState::new();
    assert!(matches!(throttle_decision(&mut fresh, "a", t0), Throttle::SendNow));
    assert!(matches!(
        throttle_decision(&mut fresh, "ab", t0 + Duration::from_millis(200)),
        Throttle::SendNow
    ));
}

#[test]
fn unchanged_content_is_skipped() {
    let mut state = SendState::new();
    let t0 = Instant::now();
    assert!(matches!(throttle_decision(&mut state, "same", t0), Throttle::SendNow));
    assert!(matches!(
        throttle_decision(&mut state, "same", t0 + Duration::from_millis(500)),
        Throttle::Skip
    ));
}

#[test]
fn preview_truncates_to_wire_cap() {
    let long: String = "x".repeat(150);
    assert_eq!(truncate_preview(&long).chars().count(), 100);
    assert_eq!(truncate_preview("short"), "short");
}

// =============================================================================
// LIVENESS SWEEP
// =============================================================================

fn typing_user(name: &str, last_seen: Instant) -> TypingUser {
    TypingUser {
        user_id: Uuid::new_v4(),
        user_name: name.into(),
        preview: None,
        sender: Source::Dashboard,
        last_seen,
    }
}

#[test]
fn sweep_boundary_is_three_seconds() {
    let t0 = Instant::now();
    let user = typing_user("Alice", t0);
    let mut users = HashMap::new();
    users.insert(user.user_id, user);

    sweep_at(&mut users, t0 + Duration::from_millis(2999));
    assert_eq!(users.len(), 1, "present just inside the window");

    sweep_at(&mut users, t0 + Duration::from_millis(3000));
    assert_eq!(users.len(), 1, "present at the boundary");

    sweep_at(&mut users, t0 + Duration::from_millis(3001));
    assert!(users.is_empty(), "gone just past the window");
}

#[test]
fn snapshot_excludes_stale_and_sorts_by_name() {
    let t0 = Instant::now();
    let later = t0 + Duration::from_millis(3500);
    let mut users = HashMap::new();
    for user in [typing_user("Noah", later), typing_user("Alice", later), typing_user("Maya", t0)] {
        users.insert(user.user_id, user);
    }

    let names: Vec<String> = snapshot_at(&users, later).into_iter().map(|u| u.user_name).collect();
    assert_eq!(names, vec!["Alice".to_owned(), "Noah".to_owned()]);
}

// =============================================================================
// END TO END (memory hub)
// =============================================================================

struct Pair {
    hub: MemoryHub,
    org: Uuid,
    conv: Uuid,
    alice: TypingPreview,
    bob: TypingPreview,
    bob_id: Uuid,
    _pools: (Arc<ChannelPool>, Arc<ChannelPool>),
}

async fn pair() -> Pair {
    let hub = MemoryHub::new();
    let org = Uuid::new_v4();
    let conv = Uuid::new_v4();
    let config = RealtimeConfig::default();

    let pool_a = Arc::new(ChannelPool::spawn(Arc::new(hub.transport()), org, &config));
    let pool_b = Arc::new(ChannelPool::spawn(Arc::new(hub.transport()), org, &config));

    let alice = TypingPreview::subscribe(
        Arc::clone(&pool_a),
        org,
        conv,
        Uuid::new_v4(),
        "Alice",
        Source::Dashboard,
    )
    .await
    .expect("alice subscribe");
    let bob_id = Uuid::new_v4();
    let bob = TypingPreview::subscribe(Arc::clone(&pool_b), org, conv, bob_id, "Bob", Source::Widget)
        .await
        .expect("bob subscribe");

    Pair { hub, org, conv, alice, bob, bob_id, _pools: (pool_a, pool_b) }
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..40 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(start_paused = true)]
async fn preview_reaches_peer_and_expires_without_refresh() {
    let pair = pair().await;

    assert!(pair.alice.update_preview("Hel").await);

    let bob = &pair.bob;
    wait_until("bob to see alice typing", || !bob.typing_users().is_empty()).await;
    let users = bob.typing_users();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].user_name, "Alice");
    assert_eq!(users[0].preview.as_deref(), Some("Hel"));
    assert_eq!(users[0].sender, Source::Dashboard);

    // No refresh, no explicit stop: the liveness sweep clears it.
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(bob.typing_users().is_empty(), "stale typing entry must expire");
}

#[tokio::test(start_paused = true)]
async fn stop_typing_clears_peer_state_before_the_timeout() {
    let pair = pair().await;

    assert!(pair.alice.update_preview("Hello wor").await);
    let bob = &pair.bob;
    wait_until("bob to see alice typing", || !bob.typing_users().is_empty()).await;

    assert!(pair.alice.stop_typing().await);

    // Removal rides the explicit stop event, well inside the 3 s window.
    for _ in 0..8 {
        if bob.typing_users().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("explicit stop should clear the peer's list promptly");
}

#[tokio::test(start_paused = true)]
async fn own_events_never_appear_in_own_list() {
    let pair = pair().await;

    // A peer connection impersonating bob's own user id.
    let topic = names::typing(pair.org, pair.conv);
    let mut conn = pair.hub.transport().connect().await.unwrap();
    conn.join(&topic).await.unwrap();

    let payload = TypingPayload {
        user_id: pair.bob_id,
        user_name: "Bob".into(),
        conversation_id: pair.conv,
        content: Some("self echo".into()),
        is_typing: true,
        ts: envelope::now_ms(),
    };
    let env = serde_json::to_value(Envelope::new(
        EVENT_TYPING_START,
        serde_json::to_value(payload).unwrap(),
        pair.org,
        Some(pair.conv),
        Source::Widget,
    ))
    .unwrap();
    conn.publish(&topic, EVENT_TYPING_START, env).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(pair.bob.typing_users().is_empty(), "self events must be filtered");

    // Alice still sees it: the id is not hers.
    wait_until("alice to see the event", || !pair.alice.typing_users().is_empty()).await;
}

async fn observe_typing(hub: &MemoryHub, org: Uuid, conv: Uuid) -> (Box<dyn Connection>, mpsc::Receiver<Inbound>) {
    let mut conn = hub.transport().connect().await.unwrap();
    let rx = conn.events().unwrap();
    conn.join(&names::typing(org, conv)).await.unwrap();
    (conn, rx)
}

fn preview_of(inbound: &Inbound) -> Option<String> {
    let Inbound::Broadcast { payload, .. } = inbound else {
        return None;
    };
    let env: Envelope = serde_json::from_value(payload.clone()).ok()?;
    let typing: TypingPayload = serde_json::from_value(env.payload).ok()?;
    typing.content
}

#[tokio::test(start_paused = true)]
async fn rapid_updates_coalesce_into_leading_and_trailing_sends() {
    let pair = pair().await;
    let (_conn, mut observed) = observe_typing(&pair.hub, pair.org, pair.conv).await;

    for i in 0..10 {
        assert!(pair.alice.update_preview(&format!("draft {i}")).await);
    }

    let first = timeout(Duration::from_millis(500), observed.recv())
        .await
        .expect("leading send expected")
        .expect("observer closed");
    assert_eq!(preview_of(&first).as_deref(), Some("draft 0"));

    let second = timeout(Duration::from_millis(500), observed.recv())
        .await
        .expect("trailing send expected")
        .expect("observer closed");
    assert_eq!(preview_of(&second).as_deref(), Some("draft 9"));

    assert!(
        timeout(Duration::from_millis(300), observed.recv()).await.is_err(),
        "ten rapid updates must publish exactly twice"
    );
}

#[tokio::test(start_paused = true)]
async fn unchanged_content_publishes_once() {
    let pair = pair().await;
    let (_conn, mut observed) = observe_typing(&pair.hub, pair.org, pair.conv).await;

    assert!(pair.alice.update_preview("Hi").await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(pair.alice.update_preview("Hi").await);

    assert!(timeout(Duration::from_millis(300), observed.recv()).await.is_ok());
    assert!(
        timeout(Duration::from_millis(300), observed.recv()).await.is_err(),
        "unchanged content must not be re-sent"
    );
}

#[tokio::test(start_paused = true)]
async fn long_previews_are_truncated_on_the_wire() {
    let pair = pair().await;

    let long: String = "y".repeat(150);
    assert!(pair.alice.update_preview(&long).await);

    let bob = &pair.bob;
    wait_until("bob to see alice typing", || !bob.typing_users().is_empty()).await;
    let users = bob.typing_users();
    let preview = users[0].preview.as_deref().expect("preview expected");
    assert_eq!(preview.chars().count(), 100);
    assert_eq!(pair.alice.conversation_id(), pair.conv);
}
