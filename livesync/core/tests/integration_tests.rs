//! End-to-End Live-Sync Scenarios
//!
//! Each test drives a full session over the in-memory push connector and a
//! scripted pull source:
//! - admission under the connection budget
//! - stale push topic falling back to polling and recovering
//! - reconnect re-subscribing every topic
//! - out-of-order samples never reverting a topic
//! - detach leaving nothing behind

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use livesync_core::{
    AdmissionMode, AuthContext, ChannelKey, ConnectionState, InMemoryConnector, LiveSync,
    LiveSyncConfig, ScriptedPullSource, Session, SessionEvent, Topic, TopicId, TopicState,
};
use livesync_core::push::protocol::ClientFrame;

// =============================================================================
// Test Infrastructure
// =============================================================================

const WAIT: Duration = Duration::from_secs(3);

struct Harness {
    sync: LiveSync,
    connector: InMemoryConnector,
    source: Arc<ScriptedPullSource>,
}

fn harness(config: LiveSyncConfig) -> Harness {
    let connector = InMemoryConnector::new();
    connector.set_auto_ack(true);
    let source = Arc::new(ScriptedPullSource::new());
    let sync = LiveSync::new(
        config,
        AuthContext::new("token", "me@example.com"),
        Arc::new(connector.clone()),
        source.clone(),
    )
    .unwrap();
    Harness {
        sync,
        connector,
        source,
    }
}

/// Poll a condition until it holds or the wait expires
async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let result = tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

/// Wait for the first event matching `pred`
async fn wait_event(
    session: &mut Session,
    mut pred: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match session.next_event().await {
                Some(event) if pred(&event) => return event,
                Some(_) => {}
                None => panic!("event stream ended"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn price_of(session: &Session, topic: &str) -> Option<f64> {
    session
        .latest(&TopicId::new(topic))
        .and_then(|s| s.price().map(|p| p.price))
}

// =============================================================================
// Admission
// =============================================================================

#[tokio::test]
async fn test_capacity_bounds_push_admission() {
    let h = harness(LiveSyncConfig::for_testing().with_max_push_connections(2));
    h.source.set_price("C", 3.0, 1);

    let mut session = h
        .sync
        .attach(vec![Topic::price("A"), Topic::price("B"), Topic::price("C")])
        .await
        .unwrap();

    assert_eq!(session.push_count(), 2);
    assert_eq!(session.status(&"A".into()).unwrap().mode, AdmissionMode::Push);
    assert_eq!(session.status(&"B".into()).unwrap().mode, AdmissionMode::Push);
    let c = session.status(&"C".into()).unwrap();
    assert_eq!(c.mode, AdmissionMode::Pull);
    assert_eq!(c.state, TopicState::PullActive);

    // C is served by polling from the start
    wait_until("pull sample for C", || price_of(&session, "C") == Some(3.0)).await;

    // One push connection carries both push topics; C was never subscribed
    let mut peer = h.connector.next_peer().await.unwrap();
    assert_eq!(peer.recv_control().await, Some(ClientFrame::Subscribe("A".into())));
    assert_eq!(peer.recv_control().await, Some(ClientFrame::Subscribe("B".into())));
    assert!(peer.try_recv_frame().is_none());
    assert_eq!(h.connector.connect_count(), 1);

    // Freeing a slot does not promote C
    session.detach_topics(&[TopicId::new("A")]).await.unwrap();
    assert_eq!(session.push_count(), 1);
    assert_eq!(session.status(&"C".into()).unwrap().mode, AdmissionMode::Pull);

    session.detach().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_attach_never_exceeds_budget() {
    let h = harness(LiveSyncConfig::for_testing().with_max_push_connections(3));
    let session = h.sync.attach(vec![]).await.unwrap();

    let attaches = (0..16).map(|i| session.attach(vec![Topic::price(format!("S{i}"))]));
    let push = futures::future::join_all(attaches)
        .await
        .into_iter()
        .filter(|modes| modes.as_ref().unwrap()[0] == AdmissionMode::Push)
        .count();
    assert_eq!(push, 3);
    assert_eq!(session.push_count(), 3);
    assert_eq!(session.topics().len(), 16);
}

// =============================================================================
// Fallback and Recovery
// =============================================================================

#[tokio::test]
async fn test_stale_push_topic_polls_until_push_resumes() {
    let h = harness(LiveSyncConfig::for_testing());
    h.source.set_price("A", 1.0, 1);

    let mut session = h.sync.attach(vec![Topic::price("A")]).await.unwrap();
    let peer = h.connector.next_peer().await.unwrap();

    // No push data: the topic goes stale and polling fills in
    let event = wait_event(&mut session, |e| matches!(e, SessionEvent::Stale { .. })).await;
    assert_eq!(event, SessionEvent::Stale { topic: "A".into() });
    let status = session.status(&"A".into()).unwrap();
    assert!(status.stale);
    assert!(status.polling);
    assert_eq!(status.state, TopicState::PushPendingFallback);
    wait_until("pull sample for A", || price_of(&session, "A") == Some(1.0)).await;

    // Push resumes: polling stops at the next tick
    assert!(peer.send_price("A", 2.0, 10));
    wait_event(&mut session, |e| matches!(e, SessionEvent::Recovered { .. })).await;
    wait_until("push sample for A", || price_of(&session, "A") == Some(2.0)).await;
    let status = session.status(&"A".into()).unwrap();
    assert!(!status.stale);
    assert!(!status.polling);
    assert_eq!(status.state, TopicState::PushActive);

    tokio::time::sleep(Duration::from_millis(60)).await;
    let calls = h.source.calls(&"A".into());
    // Keep push alive so the topic stays healthy while we watch
    for seq in 11..15 {
        peer.send_price("A", 2.0, seq);
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    assert_eq!(h.source.calls(&"A".into()), calls);
    assert_eq!(session.stats().stale_transitions, 1);

    session.detach().await.unwrap();
}

#[tokio::test]
async fn test_healthy_push_topic_is_never_polled() {
    let h = harness(LiveSyncConfig::for_testing());
    let mut session = h.sync.attach(vec![Topic::price("A")]).await.unwrap();
    let peer = h.connector.next_peer().await.unwrap();

    for seq in 1..=10u32 {
        peer.send_price("A", f64::from(seq), u64::from(seq));
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    wait_until("last push sample", || price_of(&session, "A") == Some(10.0)).await;
    assert_eq!(h.source.total_calls(), 0);
    assert!(!session.status(&"A".into()).unwrap().stale);

    session.detach().await.unwrap();
}

// =============================================================================
// Reconnect
// =============================================================================

#[tokio::test]
async fn test_reconnect_resubscribes_all_topics() {
    let h = harness(LiveSyncConfig::for_testing());
    let mut session = h
        .sync
        .attach(vec![Topic::price("A"), Topic::price("B")])
        .await
        .unwrap();

    let mut first = h.connector.next_peer().await.unwrap();
    first.recv_control().await;
    first.recv_control().await;
    first.disconnect();

    wait_event(&mut session, |e| {
        matches!(
            e,
            SessionEvent::ConnectionState {
                state: ConnectionState::Reconnecting,
                ..
            }
        )
    })
    .await;

    let mut second = h.connector.next_peer().await.unwrap();
    let mut topics = vec![
        second.recv_control().await.unwrap(),
        second.recv_control().await.unwrap(),
    ];
    topics.sort_by(|a, b| a.topic().cmp(b.topic()));
    assert_eq!(
        topics,
        vec![
            ClientFrame::Subscribe("A".into()),
            ClientFrame::Subscribe("B".into())
        ]
    );

    wait_until("shared channel subscribed", || {
        session.connection_state(&ChannelKey::Shared) == Some(ConnectionState::Subscribed)
    })
    .await;
    assert!(second.send_price("B", 7.0, 1));
    wait_until("sample after reconnect", || price_of(&session, "B") == Some(7.0)).await;
    assert_eq!(session.stats().reconnects, 1);

    session.detach().await.unwrap();
}

// =============================================================================
// Ordering
// =============================================================================

#[tokio::test]
async fn test_out_of_order_sample_never_reverts() {
    let h = harness(LiveSyncConfig::for_testing());
    let mut session = h.sync.attach(vec![Topic::price("A")]).await.unwrap();
    let mut updates = session.subscribe(&"A".into()).unwrap();
    let peer = h.connector.next_peer().await.unwrap();

    peer.send_price("A", 5.0, 5);
    peer.send_price("A", 3.0, 3);
    peer.send_price("A", 6.0, 6);

    let first = tokio::time::timeout(WAIT, updates.recv()).await.unwrap().unwrap();
    let second = tokio::time::timeout(WAIT, updates.recv()).await.unwrap().unwrap();
    assert_eq!(first.source_seq, Some(5));
    assert_eq!(second.source_seq, Some(6));
    assert_eq!(session.stats().samples_rejected, 1);

    session.detach().await.unwrap();
}

#[tokio::test]
async fn test_pull_sample_older_than_push_is_rejected() {
    let h = harness(LiveSyncConfig::for_testing().with_max_push_connections(0));
    h.source.set_price("A", 1.0, 1);
    let mut session = h.sync.attach(vec![Topic::price("A")]).await.unwrap();
    wait_until("first pull", || price_of(&session, "A") == Some(1.0)).await;

    h.source.set_price("A", 9.0, 9);
    wait_until("newer pull", || price_of(&session, "A") == Some(9.0)).await;

    h.source.set_price("A", 4.0, 4);
    wait_until("older pull rejected", || session.stats().samples_rejected > 0).await;
    assert_eq!(price_of(&session, "A"), Some(9.0));

    session.detach().await.unwrap();
}

// =============================================================================
// Alerts
// =============================================================================

#[tokio::test]
async fn test_alert_feed_uses_dedicated_channel() {
    let h = harness(LiveSyncConfig::for_testing());
    let topic = Topic::alerts("me@example.com");
    let mut session = h.sync.attach(vec![topic.clone()]).await.unwrap();

    let peer = h.connector.next_peer().await.unwrap();
    assert!(peer.url().ends_with("/ws/socket/alert?email=me%40example.com"));
    assert!(peer.send(
        r#"{"id":7,"symbol":"005930","targetPrice":70000,"triggeredPrice":70100,"condition":"ABOVE","triggeredAt":"2024-03-01T09:00:00"}"#
    ));

    wait_until("alert sample", || session.latest(&topic.id).is_some()).await;
    let alert = session.latest(&topic.id).unwrap();
    assert_eq!(alert.alert().unwrap().id, Some(7));

    session.detach().await.unwrap();
    assert_eq!(
        session.connection_state(&ChannelKey::Dedicated(topic.id.clone())),
        None
    );
}

// =============================================================================
// Detach
// =============================================================================

#[tokio::test]
async fn test_detach_releases_everything() {
    let h = harness(LiveSyncConfig::for_testing().with_max_push_connections(1));
    h.source.set_price("B", 1.0, 1);
    let mut session = h
        .sync
        .attach(vec![Topic::price("A"), Topic::price("B")])
        .await
        .unwrap();
    let mut updates = session.subscribe(&"A".into()).unwrap();
    let mut peer = h.connector.next_peer().await.unwrap();
    peer.recv_control().await;
    wait_until("pull sample for B", || price_of(&session, "B").is_some()).await;

    session.detach().await.unwrap();

    // Unsubscribe flushed, then the link closed
    assert_eq!(peer.recv_control().await, Some(ClientFrame::Unsubscribe("A".into())));
    tokio::time::timeout(WAIT, peer.closed()).await.unwrap();

    // Listeners ended, nothing stored, nothing polled any more
    assert!(tokio::time::timeout(WAIT, updates.recv()).await.unwrap().is_none());
    assert!(session.snapshot().is_empty());
    let calls = h.source.total_calls();
    let stats = session.stats();
    peer.send_price("A", 99.0, 99);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.source.total_calls(), calls);
    assert_eq!(session.stats(), stats);
    assert!(session.latest(&"A".into()).is_none());
    assert_eq!(session.push_count(), 0);
}

#[tokio::test]
async fn test_detach_one_topic_keeps_others() {
    let h = harness(LiveSyncConfig::for_testing());
    let session = h
        .sync
        .attach(vec![Topic::price("A"), Topic::price("B")])
        .await
        .unwrap();
    let mut peer = h.connector.next_peer().await.unwrap();
    peer.recv_control().await;
    peer.recv_control().await;

    assert_eq!(session.detach_topics(&[TopicId::new("A"), TopicId::new("Z")]).await.unwrap(), 1);
    assert_eq!(peer.recv_control().await, Some(ClientFrame::Unsubscribe("A".into())));

    // Late data for A is discarded; B still flows
    peer.send_price("A", 1.0, 1);
    peer.send_price("B", 2.0, 1);
    wait_until("sample for B", || price_of(&session, "B") == Some(2.0)).await;
    assert!(session.latest(&"A".into()).is_none());
    assert!(session.status(&"A".into()).is_none());
}

#[tokio::test]
async fn test_reattach_after_detach_gets_fresh_subscription() {
    let h = harness(LiveSyncConfig::for_testing());
    let session = h.sync.attach(vec![Topic::price("A")]).await.unwrap();
    let mut peer = h.connector.next_peer().await.unwrap();
    peer.recv_control().await;

    session.detach_topics(&[TopicId::new("A")]).await.unwrap();
    tokio::time::timeout(WAIT, peer.closed()).await.unwrap();

    session.attach(vec![Topic::price("A")]).await.unwrap();
    let mut peer = h.connector.next_peer().await.unwrap();
    assert_eq!(peer.recv_control().await, Some(ClientFrame::Subscribe("A".into())));
    assert_eq!(session.push_count(), 1);
}
