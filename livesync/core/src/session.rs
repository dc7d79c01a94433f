//! Lifecycle Coordinator
//!
//! [`LiveSync`] is the service; [`Session`] is one consumer's set of attached
//! topics. Each session owns its own registry, store, health monitor, poll
//! scheduler and push supervisor, and one driver task that runs every timer
//! and reacts to push and health events.
//!
//! # Event Flow
//!
//! ```text
//!  push channels ──PushEvent──┐
//!                             ▼
//!  health tick ──► HealthMonitor ──HealthEvent──► driver ──► registry / scheduler
//!                             ▲                     │
//!  poll tick ──► PollScheduler┘ (via SampleSink)    └──SessionEvent──► consumer
//! ```
//!
//! # Release Order
//!
//! Releasing a topic removes it from the registry first and closes its store
//! entry next, so anything still in flight for it is discarded at merge time.
//! Its poll entry, health timer and push subscription go after that.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::config::LiveSyncConfig;
use crate::error::{AuthError, SyncError};
use crate::health::{HealthEvent, HealthMonitor};
use crate::poll::{PollOutcome, PollScheduler, PullSource};
use crate::push::{ChannelKey, ConnectionState, PushConnector, PushEvent, PushSupervisor};
use crate::registry::{RegistryEvent, TopicRegistry, TopicState};
use crate::sample::Sample;
use crate::stats::{StatsSnapshot, SyncStats};
use crate::store::{SampleSink, SampleStore, TopicSubscription};
use crate::topic::{AdmissionMode, Topic, TopicId, TopicKind};

/// Bound on waiting for the driver task during detach
const DRIVER_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Notifications delivered to the consumer of a session
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// A topic was attached
    Admitted {
        /// Topic id
        topic: TopicId,
        /// Push slot or pull-only
        mode: AdmissionMode,
    },
    /// A push topic went quiet; polling covers it
    Stale {
        /// Topic id
        topic: TopicId,
    },
    /// A stale topic received push data again; polling stops
    Recovered {
        /// Topic id
        topic: TopicId,
    },
    /// A push channel changed state
    ConnectionState {
        /// Channel
        channel: ChannelKey,
        /// New state
        state: ConnectionState,
    },
    /// Push credentials were refused; affected topics are polled instead
    AuthFailed(AuthError),
}

/// Point-in-time view of one attached topic
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TopicStatus {
    /// Admission mode
    pub mode: AdmissionMode,
    /// Registry state
    pub state: TopicState,
    /// Whether the push path is considered stale
    pub stale: bool,
    /// Whether the topic is currently being polled
    pub polling: bool,
    /// When the last sample from either path arrived
    #[serde(skip)]
    pub last_sample_at: Option<Instant>,
}

/// Live-sync service
///
/// Holds configuration, credentials and the two delivery seams. Every
/// [`attach`](Self::attach) opens an independent session.
pub struct LiveSync {
    config: LiveSyncConfig,
    auth: AuthContext,
    connector: Arc<dyn PushConnector>,
    source: Arc<dyn PullSource>,
}

impl LiveSync {
    /// Create the service over explicit delivery seams
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] if the configuration does not validate.
    pub fn new(
        config: LiveSyncConfig,
        auth: AuthContext,
        connector: Arc<dyn PushConnector>,
        source: Arc<dyn PullSource>,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        Ok(Self {
            config,
            auth,
            connector,
            source,
        })
    }

    /// Create the service with the WebSocket connector and HTTP pull source
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] for an invalid configuration and
    /// [`SyncError::Client`] if the HTTP client cannot be built.
    #[cfg(feature = "websocket")]
    pub fn from_config(config: LiveSyncConfig, auth: AuthContext) -> Result<Self, SyncError> {
        config.validate()?;
        let source = crate::poll::HttpPullSource::new(
            config.pull_base_url.clone(),
            auth.clone(),
            config.pull_timeout,
        )
        .map_err(|e| SyncError::Client(e.to_string()))?;
        Self::new(
            config,
            auth,
            Arc::new(crate::push::WebSocketConnector::new()),
            Arc::new(source),
        )
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &LiveSyncConfig {
        &self.config
    }

    /// Open a session and attach topics to it
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidTopic`] if any topic is unusable; no
    /// session is opened in that case.
    pub async fn attach(&self, topics: Vec<Topic>) -> Result<Session, SyncError> {
        validate_topics(&topics)?;
        let session = self.open_session();
        session.attach(topics).await?;
        Ok(session)
    }

    fn open_session(&self) -> Session {
        let id = Uuid::new_v4();
        let stats = Arc::new(SyncStats::default());
        let store = SampleStore::new(Arc::clone(&stats));
        let (health, health_rx) = HealthMonitor::with_events(self.config.health());
        let sink = SampleSink::new(store.clone(), health.clone());
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let (registry_tx, registry_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(self.config.event_buffer.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let shared = Arc::new(SessionShared {
            id,
            registry: TopicRegistry::with_events(self.config.max_push_connections, registry_tx),
            scheduler: PollScheduler::new(self.config.poll(), Arc::clone(&self.source), sink.clone()),
            supervisor: PushSupervisor::new(
                self.config.push(),
                self.auth.clone(),
                Arc::clone(&self.connector),
                sink,
                push_tx,
            ),
            store,
            health,
            stats,
            events: event_tx,
            lifecycle: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        });

        let channels = DriverChannels {
            push: push_rx,
            health: health_rx,
            registry: registry_rx,
            shutdown: shutdown_rx,
        };
        let driver = tokio::spawn(drive(Arc::clone(&shared), channels));
        tracing::info!(
            session = %id,
            capacity = self.config.max_push_connections,
            "Live-sync session opened"
        );

        Session {
            shared,
            events: event_rx,
            driver: Some(driver),
            shutdown: Some(shutdown_tx),
        }
    }
}

impl std::fmt::Debug for LiveSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSync")
            .field("config", &self.config)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

fn validate_topics(topics: &[Topic]) -> Result<(), SyncError> {
    for topic in topics {
        if topic.id.as_str().trim().is_empty() {
            return Err(SyncError::InvalidTopic("empty topic id".into()));
        }
        if topic.kind == TopicKind::Alert && topic.alert_user().map_or(true, str::is_empty) {
            return Err(SyncError::InvalidTopic(format!("{} has no user", topic.id)));
        }
    }
    Ok(())
}

struct SessionShared {
    id: Uuid,
    registry: TopicRegistry,
    store: SampleStore,
    health: HealthMonitor,
    scheduler: PollScheduler,
    supervisor: PushSupervisor,
    stats: Arc<SyncStats>,
    events: mpsc::Sender<SessionEvent>,
    /// Serializes attach and detach
    lifecycle: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl SessionShared {
    fn emit(&self, event: SessionEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::debug!(session = %self.id, ?event, "Event buffer full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn attach_one(&self, topic: &Topic) -> AdmissionMode {
        if self.registry.contains(&topic.id) {
            return self.registry.mode(&topic.id);
        }

        self.store.open(&topic.id);
        let mode = self.registry.admit(topic);
        self.health.watch(&topic.id, topic.kind, mode);
        match mode {
            AdmissionMode::Push => {
                self.supervisor.subscribe(topic);
            }
            AdmissionMode::Pull | AdmissionMode::None => {
                self.scheduler.enroll_pull_only(topic);
            }
        }
        mode
    }

    /// Release everything held for a topic
    ///
    /// Returns false if the topic was not attached.
    async fn release_topic(&self, topic: &TopicId) -> bool {
        let Some(mode) = self.registry.release(topic) else {
            return false;
        };
        self.store.close(topic);
        self.scheduler.release(topic);
        self.health.release(topic);
        if mode == AdmissionMode::Push {
            self.supervisor.unsubscribe(topic).await;
        }
        tracing::debug!(session = %self.id, topic = %topic, ?mode, "Topic detached");
        true
    }

    /// Synchronous part of release, for `Drop`
    fn release_now(&self) {
        for topic in self.registry.topics() {
            self.registry.release(&topic.id);
            self.store.close(&topic.id);
            self.health.release(&topic.id);
        }
        self.scheduler.clear();
    }

    fn on_push_event(&self, event: PushEvent) {
        match event {
            PushEvent::StateChanged { channel, state } => {
                self.emit(SessionEvent::ConnectionState { channel, state });
            }
            PushEvent::Subscribed { topic } => {
                self.health.arm(&topic);
            }
            PushEvent::SubscribeFailed { topic, reason } => {
                tracing::warn!(session = %self.id, topic = %topic, ?reason, "Push subscription failed, falling back");
                self.health.mark_stale(&topic);
            }
            PushEvent::AuthFailed {
                channel,
                topics,
                reason,
            } => {
                for topic in &topics {
                    self.health.mark_stale(topic);
                }
                self.emit(SessionEvent::AuthFailed(AuthError {
                    channel: channel.to_string(),
                    reason,
                }));
            }
        }
    }

    /// Apply a health transition
    ///
    /// Runs under the lifecycle lock so it never interleaves with attach or
    /// detach. An event that no longer matches the topic's current health
    /// (released, re-attached, or already recovered) is dropped.
    async fn on_health_event(&self, event: HealthEvent) {
        let _guard = self.lifecycle.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        match event {
            HealthEvent::Stale { topic, silent_for } => {
                if !self.registry.contains(&topic) || !self.health.is_stale(&topic) {
                    tracing::trace!(session = %self.id, topic = %topic, "Dropping outdated stale event");
                    return;
                }
                if !self.registry.mark_stale(&topic) {
                    return;
                }
                self.stats.record_stale();
                if let Some(t) = self.registry.topic(&topic) {
                    self.scheduler.enroll_stale(&t);
                }
                tracing::info!(
                    session = %self.id,
                    topic = %topic,
                    silent_ms = silent_for.as_millis() as u64,
                    "Topic stale, polling"
                );
                self.emit(SessionEvent::Stale { topic });
            }
            HealthEvent::Recovered { topic } => {
                if self.health.is_stale(&topic) || !self.registry.mark_recovered(&topic) {
                    return;
                }
                self.scheduler.clear_stale(&topic);
                tracing::info!(session = %self.id, topic = %topic, "Topic recovered, push resumed");
                self.emit(SessionEvent::Recovered { topic });
            }
        }
    }

    fn on_registry_event(&self, event: RegistryEvent) {
        match event {
            RegistryEvent::Admitted { topic, mode } => {
                self.emit(SessionEvent::Admitted { topic, mode });
            }
            RegistryEvent::StateChanged { topic, from, to } => {
                tracing::debug!(session = %self.id, topic = %topic, ?from, ?to, "Topic state changed");
            }
            RegistryEvent::Released { topic, mode } => {
                tracing::trace!(session = %self.id, topic = %topic, ?mode, "Topic released");
            }
        }
    }

    fn on_poll_joined(&self, joined: Result<PollOutcome, tokio::task::JoinError>) {
        match joined {
            Ok(outcome) => self.scheduler.complete(&outcome),
            Err(e) if e.is_cancelled() => {}
            Err(e) => tracing::warn!(session = %self.id, error = %e, "Pull task failed"),
        }
    }
}

/// Inputs of the session driver
struct DriverChannels {
    push: mpsc::UnboundedReceiver<PushEvent>,
    health: mpsc::UnboundedReceiver<HealthEvent>,
    registry: mpsc::UnboundedReceiver<RegistryEvent>,
    shutdown: oneshot::Receiver<()>,
}

/// The session's single event loop
async fn drive(shared: Arc<SessionShared>, channels: DriverChannels) {
    let DriverChannels {
        push: mut push_rx,
        health: mut health_rx,
        registry: mut registry_rx,
        mut shutdown,
    } = channels;
    let mut health_tick = tokio::time::interval(shared.health.config().tick_interval());
    health_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut poll_tick = tokio::time::interval(shared.scheduler.config().tick_interval());
    poll_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut in_flight: JoinSet<PollOutcome> = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = health_tick.tick() => {
                shared.health.check_stale();
            }
            _ = poll_tick.tick() => {
                shared.scheduler.tick(&mut in_flight);
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                shared.on_poll_joined(joined);
            }
            Some(event) = push_rx.recv() => shared.on_push_event(event),
            Some(event) = health_rx.recv() => shared.on_health_event(event).await,
            Some(event) = registry_rx.recv() => shared.on_registry_event(event),
        }
    }

    in_flight.abort_all();
    tracing::debug!(session = %shared.id, "Session driver stopped");
}

/// One consumer's set of attached topics
///
/// Call [`detach`](Self::detach) to release everything and wait for the push
/// channels to close. Dropping the session releases synchronously and aborts
/// its tasks.
pub struct Session {
    shared: Arc<SessionShared>,
    events: mpsc::Receiver<SessionEvent>,
    driver: Option<JoinHandle<()>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Session {
    /// Session id
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Whether the session has been detached
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Attach more topics
    ///
    /// Already-attached topics keep their mode. Returns the mode of each
    /// topic, in order.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SessionClosed`] after `detach`, and
    /// [`SyncError::InvalidTopic`] if any topic is unusable (nothing is
    /// attached in that case).
    pub async fn attach(&self, topics: Vec<Topic>) -> Result<Vec<AdmissionMode>, SyncError> {
        validate_topics(&topics)?;
        let _guard = self.shared.lifecycle.lock().await;
        if self.is_closed() {
            return Err(SyncError::SessionClosed);
        }
        Ok(topics.iter().map(|t| self.shared.attach_one(t)).collect())
    }

    /// Release some topics
    ///
    /// Returns how many were attached. Unknown ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SessionClosed`] after `detach`.
    pub async fn detach_topics(&self, topics: &[TopicId]) -> Result<usize, SyncError> {
        let _guard = self.shared.lifecycle.lock().await;
        if self.is_closed() {
            return Err(SyncError::SessionClosed);
        }
        let mut released = 0;
        for topic in topics {
            if self.shared.release_topic(topic).await {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Release every topic, close all push channels and stop the driver
    ///
    /// Idempotent. After it returns no timer, request or connection belonging
    /// to this session remains, and the store no longer changes.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Teardown`] if the driver did not stop in time; it
    /// is aborted in that case and nothing is left running.
    pub async fn detach(&mut self) -> Result<(), SyncError> {
        {
            let _guard = self.shared.lifecycle.lock().await;
            if self.shared.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            for topic in self.shared.registry.topics() {
                self.shared.release_topic(&topic.id).await;
            }
            self.shared.scheduler.clear();
            self.shared.supervisor.close().await;
        }

        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(mut driver) = self.driver.take() {
            if tokio::time::timeout(DRIVER_STOP_TIMEOUT, &mut driver).await.is_err() {
                driver.abort();
                return Err(SyncError::Teardown("session driver did not stop".into()));
            }
        }
        tracing::info!(session = %self.shared.id, "Live-sync session detached");
        Ok(())
    }

    /// Latest accepted sample of a topic
    #[must_use]
    pub fn latest(&self, topic: &TopicId) -> Option<Sample> {
        self.shared.store.latest(topic)
    }

    /// Latest sample of every attached topic that has one
    #[must_use]
    pub fn snapshot(&self) -> HashMap<TopicId, Sample> {
        self.shared.store.snapshot()
    }

    /// Receive every future accepted sample of a topic
    ///
    /// The subscription ends when dropped or when the topic is detached.
    #[must_use]
    pub fn subscribe(&self, topic: &TopicId) -> Option<TopicSubscription> {
        self.shared.store.subscribe(topic)
    }

    /// Status of an attached topic
    #[must_use]
    pub fn status(&self, topic: &TopicId) -> Option<TopicStatus> {
        if !self.shared.registry.contains(topic) {
            return None;
        }
        let health = self.shared.health.get(topic);
        Some(TopicStatus {
            mode: self.shared.registry.mode(topic),
            state: self.shared.registry.state(topic),
            stale: health.is_some_and(|h| h.stale),
            polling: self.shared.scheduler.is_polling(topic),
            last_sample_at: health.and_then(|h| h.last_sample_at),
        })
    }

    /// Attached topics
    #[must_use]
    pub fn topics(&self) -> Vec<Topic> {
        self.shared.registry.topics()
    }

    /// Topics currently holding a push slot
    #[must_use]
    pub fn push_count(&self) -> usize {
        self.shared.registry.push_count()
    }

    /// State of a push channel
    #[must_use]
    pub fn connection_state(&self, channel: &ChannelKey) -> Option<ConnectionState> {
        self.shared.supervisor.channel_state(channel)
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Wait for the next session event
    ///
    /// Returns `None` once the session is detached and drained.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        if self.is_closed() {
            return self.events.try_recv().ok();
        }
        self.events.recv().await
    }

    /// Take a pending event without waiting
    pub fn try_next_event(&mut self) -> Option<SessionEvent> {
        self.events.try_recv().ok()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("topics", &self.shared.registry.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(session = %self.shared.id, "Session dropped without detach, releasing");
        self.shared.release_now();
    }
}
