use super::*;
use crate::pool::PoolEvent;
use crate::transport::memory::MemoryHub;
use crate::transport::{Connection, Inbound, TransportError};
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time::{Duration, timeout};

async fn org_pools(hub: &MemoryHub) -> (Arc<ChannelPool>, Arc<ChannelPool>, Uuid) {
    let org = Uuid::new_v4();
    let config = RealtimeConfig::default();
    let sender = Arc::new(ChannelPool::spawn(Arc::new(hub.transport()), org, &config));
    let receiver = Arc::new(ChannelPool::spawn(Arc::new(hub.transport()), org, &config));
    (sender, receiver, org)
}

async fn recv_envelope(sub: &mut crate::pool::Subscription) -> (String, Envelope) {
    let received = timeout(Duration::from_millis(500), sub.recv())
        .await
        .expect("broadcast receive timed out")
        .expect("subscription closed");
    let PoolEvent::Broadcast { event, payload } = received else {
        panic!("expected broadcast");
    };
    let env: Envelope = serde_json::from_value(payload).expect("payload should be an envelope");
    (event, env)
}

#[tokio::test]
async fn notify_message_created_reaches_org_subscribers() {
    let hub = MemoryHub::new();
    let (sender, receiver, org) = org_pools(&hub).await;
    let _sender_sub = sender.subscribe(&names::organization(org)).await.expect("subscribe");
    let mut receiver_sub = receiver.subscribe(&names::organization(org)).await.expect("subscribe");

    let conv = Uuid::new_v4();
    let message_id = Uuid::new_v4();
    let ok = notify_message_created(
        &sender,
        Source::Dashboard,
        conv,
        json!({"id": message_id.to_string(), "body": "hi"}),
    )
    .await;
    assert!(ok);

    let (event, env) = recv_envelope(&mut receiver_sub).await;
    assert_eq!(event, EVENT_MESSAGE_CREATED);
    assert_eq!(env.organization_id, org);
    assert_eq!(env.conversation_id, Some(conv));
    assert_eq!(env.source, Source::Dashboard);

    let payload: MessagePayload = serde_json::from_value(env.payload).unwrap();
    assert_eq!(payload.message_id(), Some(message_id));
}

#[tokio::test]
async fn notify_conversation_updated_carries_updates() {
    let hub = MemoryHub::new();
    let (sender, receiver, org) = org_pools(&hub).await;
    let _sender_sub = sender.subscribe(&names::organization(org)).await.expect("subscribe");
    let mut receiver_sub = receiver.subscribe(&names::organization(org)).await.expect("subscribe");

    let conv = Uuid::new_v4();
    assert!(
        notify_conversation_updated(&sender, Source::Widget, conv, json!({"status": "closed"})).await
    );

    let (event, env) = recv_envelope(&mut receiver_sub).await;
    assert_eq!(event, EVENT_CONVERSATION_UPDATED);
    let payload: ConversationPayload = serde_json::from_value(env.payload).unwrap();
    assert_eq!(payload.conversation_id, conv);
    assert_eq!(payload.updates, json!({"status": "closed"}));
}

#[tokio::test]
async fn notify_typing_routes_to_typing_channel() {
    let hub = MemoryHub::new();
    let (sender, receiver, org) = org_pools(&hub).await;
    let conv = Uuid::new_v4();
    let topic = names::typing(org, conv);
    let _sender_sub = sender.subscribe(&topic).await.expect("subscribe");
    let mut receiver_sub = receiver.subscribe(&topic).await.expect("subscribe");

    let payload = TypingPayload {
        user_id: Uuid::new_v4(),
        user_name: "Visitor".into(),
        conversation_id: conv,
        content: Some("Hel".into()),
        is_typing: true,
        ts: crate::envelope::now_ms(),
    };
    assert!(notify_typing(&sender, Source::Widget, payload).await);

    let (event, env) = recv_envelope(&mut receiver_sub).await;
    assert_eq!(event, EVENT_TYPING_START);
    let typing: TypingPayload = serde_json::from_value(env.payload).unwrap();
    assert_eq!(typing.content.as_deref(), Some("Hel"));
}

#[tokio::test]
async fn notify_without_subscription_fails_without_retry_storm() {
    let hub = MemoryHub::new();
    let (sender, _receiver, _org) = org_pools(&hub).await;

    // NotSubscribed is not transient; this returns promptly.
    let started = std::time::Instant::now();
    assert!(!notify_message_created(&sender, Source::Dashboard, Uuid::new_v4(), json!({})).await);
    assert!(started.elapsed() < std::time::Duration::from_millis(150));
}

#[tokio::test]
async fn broadcaster_requires_privileged_config() {
    let config = RealtimeConfig { url: Some("wss://realtime.example.com".into()), ..RealtimeConfig::default() };
    assert!(matches!(
        Broadcaster::from_config(&config),
        Err(ConfigError::MissingServiceKey)
    ));

    let config = RealtimeConfig { service_key: Some("svc".into()), ..RealtimeConfig::default() };
    assert!(matches!(Broadcaster::from_config(&config), Err(ConfigError::MissingUrl)));
}

#[tokio::test]
async fn broadcaster_fans_out_to_org_and_conversation_channels() {
    let hub = MemoryHub::new();
    let org = Uuid::new_v4();
    let conv = Uuid::new_v4();

    let mut org_conn = hub.transport().connect().await.unwrap();
    let mut org_rx = org_conn.events().unwrap();
    org_conn.join(&names::organization(org)).await.unwrap();

    let mut conv_conn = hub.transport().connect().await.unwrap();
    let mut conv_rx = conv_conn.events().unwrap();
    conv_conn.join(&names::conversation(org, conv)).await.unwrap();

    let broadcaster = Broadcaster::new(Arc::new(hub.transport()));
    let ok = broadcaster
        .broadcast_message_created(org, conv, json!({"id": Uuid::new_v4().to_string()}))
        .await;
    assert!(ok);

    for rx in [&mut org_rx, &mut conv_rx] {
        let inbound = timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("broadcast receive timed out")
            .expect("stream closed");
        let Inbound::Broadcast { event, payload, .. } = inbound else {
            panic!("expected broadcast");
        };
        assert_eq!(event, EVENT_MESSAGE_CREATED);
        let env: Envelope = serde_json::from_value(payload).unwrap();
        assert_eq!(env.source, Source::Server);
    }
}

struct FlakyConnectTransport {
    hub: MemoryHub,
    failures_left: AtomicUsize,
}

#[async_trait]
impl Transport for FlakyConnectTransport {
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::Connect("transient outage".into()));
        }
        self.hub.transport().connect().await
    }
}

#[tokio::test(start_paused = true)]
async fn broadcaster_retries_transient_connect_failures() {
    let hub = MemoryHub::new();
    let org = Uuid::new_v4();

    let mut listener = hub.transport().connect().await.unwrap();
    let mut listener_rx = listener.events().unwrap();
    listener.join(&names::organization(org)).await.unwrap();

    let transport = FlakyConnectTransport { hub: hub.clone(), failures_left: AtomicUsize::new(2) };
    let broadcaster = Broadcaster::new(Arc::new(transport));

    let presence = PresencePayload {
        user_id: Uuid::new_v4(),
        status: crate::envelope::PresenceStatus::Offline,
        is_online: false,
        last_seen: crate::envelope::now_ms(),
    };
    assert!(broadcaster.broadcast_presence(org, presence).await);

    let inbound = timeout(Duration::from_millis(500), listener_rx.recv())
        .await
        .expect("presence receive timed out")
        .expect("stream closed");
    assert!(matches!(inbound, Inbound::Broadcast { .. }));
}

#[tokio::test(start_paused = true)]
async fn broadcaster_gives_up_after_exhausting_retries() {
    let hub = MemoryHub::new();
    let transport = FlakyConnectTransport { hub, failures_left: AtomicUsize::new(usize::MAX) };
    let broadcaster = Broadcaster::new(Arc::new(transport));

    let ok = broadcaster
        .broadcast_read_receipt(
            Uuid::new_v4(),
            Uuid::new_v4(),
            ReadReceiptPayload {
                message_id: Uuid::new_v4(),
                read_by: Uuid::new_v4(),
                read_at: crate::envelope::now_ms(),
            },
        )
        .await;
    assert!(!ok);
}
