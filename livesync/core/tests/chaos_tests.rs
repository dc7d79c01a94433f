//! Chaos Tests for Push/Pull Resilience
//!
//! These tests verify behavior under adverse conditions:
//! - Garbage frames on a healthy connection
//! - Credentials refused at handshake
//! - Connections dropped over and over
//! - Subscriptions the server never acknowledges
//! - Pull endpoints failing for some topics only
//!
//! # Running
//!
//! The churn test is ignored by default due to its long-running nature:
//! ```bash
//! cargo test chaos -- --ignored --nocapture
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

use livesync_core::{
    AdmissionMode, AuthContext, ChannelKey, ConnectionState, InMemoryConnector, LiveSync,
    LiveSyncConfig, ScriptedPullSource, Session, SessionEvent, Topic, TopicId, TopicState,
};
use livesync_core::push::protocol::ClientFrame;

// =============================================================================
// Chaos Test Infrastructure
// =============================================================================

const WAIT: Duration = Duration::from_secs(3);

/// Configuration for chaos test scenarios
#[derive(Clone, Debug)]
pub struct ChaosConfig {
    /// Duration to run chaos scenario
    pub duration: Duration,
    /// Number of concurrent sessions
    pub concurrency: usize,
    /// Topics each session attaches
    pub topics_per_session: usize,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(10),
            concurrency: 20,
            topics_per_session: 8,
        }
    }
}

struct Harness {
    sync: LiveSync,
    connector: InMemoryConnector,
    source: Arc<ScriptedPullSource>,
}

fn harness(config: LiveSyncConfig, auto_ack: bool) -> Harness {
    let connector = InMemoryConnector::new();
    connector.set_auto_ack(auto_ack);
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

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let result = tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

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
// Malformed Input
// =============================================================================

#[tokio::test]
async fn chaos_malformed_frames_keep_connection() {
    let h = harness(LiveSyncConfig::for_testing(), true);
    let mut session = h.sync.attach(vec![Topic::price("A")]).await.unwrap();
    let peer = h.connector.next_peer().await.unwrap();

    for garbage in ["", "}{", "not json at all", "[1,2,3", "\u{0}\u{1}"] {
        assert!(peer.send(garbage));
    }
    assert!(peer.send_price("A", 42.0, 1));

    wait_until("valid sample after garbage", || price_of(&session, "A") == Some(42.0)).await;
    assert!(session.stats().frames_malformed >= 5);
    assert_eq!(h.connector.connect_count(), 1);
    assert_eq!(session.stats().reconnects, 0);
    assert_eq!(
        session.connection_state(&ChannelKey::Shared),
        Some(ConnectionState::Subscribed)
    );

    session.detach().await.unwrap();
}

// =============================================================================
// Credentials
// =============================================================================

#[tokio::test]
async fn chaos_auth_rejected_falls_back_to_polling() {
    let h = harness(LiveSyncConfig::for_testing(), true);
    h.connector.set_reject_auth(true);
    h.source.set_price("A", 5.0, 1);

    let mut session = h.sync.attach(vec![Topic::price("A")]).await.unwrap();

    let event = wait_event(&mut session, |e| matches!(e, SessionEvent::AuthFailed(_))).await;
    let SessionEvent::AuthFailed(error) = event else {
        unreachable!()
    };
    assert_eq!(error.channel, "shared");

    wait_until("pull sample for A", || price_of(&session, "A") == Some(5.0)).await;
    let status = session.status(&"A".into()).unwrap();
    assert_eq!(status.mode, AdmissionMode::Push);
    assert!(status.stale);
    assert!(status.polling);
    assert_eq!(status.state, TopicState::PushPendingFallback);

    // Refused credentials are never retried
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.connector.connect_count(), 1);

    session.detach().await.unwrap();
}

// =============================================================================
// Connection Loss
// =============================================================================

#[tokio::test]
async fn chaos_repeated_drops_resubscribe_every_time() {
    let h = harness(LiveSyncConfig::for_testing(), true);
    let mut session = h.sync.attach(vec![Topic::price("A")]).await.unwrap();

    for round in 1..=5u32 {
        let mut peer = h.connector.next_peer().await.unwrap();
        assert_eq!(
            peer.recv_control().await,
            Some(ClientFrame::Subscribe("A".into()))
        );
        assert!(peer.send_price("A", f64::from(round), u64::from(round)));
        wait_until("sample this round", || {
            price_of(&session, "A") == Some(f64::from(round))
        })
        .await;
        peer.disconnect();
    }

    let _ = h.connector.next_peer().await.unwrap();
    assert_eq!(session.stats().reconnects, 5);
    assert_eq!(h.connector.connect_count(), 6);
    assert_eq!(session.push_count(), 1);

    session.detach().await.unwrap();
}

#[tokio::test]
async fn chaos_refused_connects_back_off_then_recover() {
    let h = harness(LiveSyncConfig::for_testing(), true);
    h.connector.fail_next(3);
    let mut session = h.sync.attach(vec![Topic::price("A")]).await.unwrap();

    let peer = tokio::time::timeout(WAIT, h.connector.next_peer())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.connector.connect_count(), 4);
    assert!(peer.send_price("A", 1.5, 1));
    wait_until("sample after recovery", || price_of(&session, "A") == Some(1.5)).await;
    assert_eq!(session.stats().reconnects, 3);

    session.detach().await.unwrap();
}

// =============================================================================
// Unacknowledged Subscriptions
// =============================================================================

#[tokio::test]
async fn chaos_unacknowledged_subscribe_falls_back() {
    let config =
        LiveSyncConfig::for_testing().with_subscribe_ack_timeout(Duration::from_millis(100));
    let h = harness(config, false);
    h.source.set_price("A", 8.0, 1);

    let mut session = h.sync.attach(vec![Topic::price("A")]).await.unwrap();
    let mut peer = h.connector.next_peer().await.unwrap();
    assert_eq!(
        peer.recv_control().await,
        Some(ClientFrame::Subscribe("A".into()))
    );

    wait_event(&mut session, |e| matches!(e, SessionEvent::Stale { .. })).await;
    wait_until("pull sample for A", || price_of(&session, "A") == Some(8.0)).await;
    assert!(session.status(&"A".into()).unwrap().polling);

    session.detach().await.unwrap();
}

// =============================================================================
// Pull Failures
// =============================================================================

#[tokio::test]
async fn chaos_failing_pull_does_not_stall_siblings() {
    let h = harness(LiveSyncConfig::for_testing().with_max_push_connections(0), true);
    h.source.fail("A");
    h.source.set_price("B", 1.0, 1);

    let mut session = h
        .sync
        .attach(vec![Topic::price("A"), Topic::price("B")])
        .await
        .unwrap();

    wait_until("pull sample for B", || price_of(&session, "B") == Some(1.0)).await;
    wait_until("repeated pulls for A", || h.source.calls(&"A".into()) >= 3).await;

    h.source.set_price("B", 2.0, 2);
    wait_until("next pull sample for B", || price_of(&session, "B") == Some(2.0)).await;

    let stats = session.stats();
    assert!(stats.pulls_failed >= 3);
    assert!(stats.pulls_succeeded >= 2);
    assert!(session.latest(&"A".into()).is_none());
    assert_eq!(session.status(&"A".into()).unwrap().state, TopicState::PullActive);
    assert_eq!(h.connector.connect_count(), 0);

    session.detach().await.unwrap();
}

// =============================================================================
// Churn
// =============================================================================

#[tokio::test]
#[ignore = "long-running churn test"]
async fn chaos_attach_detach_churn() {
    // Initialize logging for debugging
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("livesync_core=info".parse().unwrap()),
        )
        .try_init();

    let chaos = ChaosConfig::default();
    let h = harness(LiveSyncConfig::for_testing().with_max_push_connections(4), true);
    for i in 0..chaos.topics_per_session * 4 {
        h.source.set_price(format!("T{i}"), 1.0, 1);
    }

    let deadline = Instant::now() + chaos.duration;
    let mut rounds = 0u64;
    while Instant::now() < deadline {
        let attaches = (0..chaos.concurrency).map(|_| {
            let topics: Vec<Topic> = {
                let mut rng = rand::thread_rng();
                (0..chaos.topics_per_session)
                    .map(|_| {
                        let n = rng.gen_range(0..chaos.topics_per_session * 4);
                        Topic::price(format!("T{n}"))
                    })
                    .collect()
            };
            h.sync.attach(topics)
        });
        let sessions = futures::future::join_all(attaches).await;

        for session in &sessions {
            let session = session.as_ref().unwrap();
            assert!(session.push_count() <= 4);
        }
        // Let some peers go away underneath live channels
        let mut kept = Vec::new();
        while let Some(peer) = h.connector.try_next_peer() {
            if rand::thread_rng().gen_bool(0.3) {
                peer.disconnect();
            } else {
                kept.push(peer);
            }
        }

        for session in sessions {
            let mut session = session.unwrap();
            tokio_test::assert_ok!(session.detach().await);
            assert!(session.is_closed());
            assert_eq!(session.push_count(), 0);
            assert!(session.snapshot().is_empty());
        }
        drop(kept);
        rounds += 1;
    }

    println!("churn completed {rounds} rounds");
    assert!(rounds > 0);
}
