//! Health Monitor - Per-Topic Stale Detection
//!
//! Tracks, for each attached topic, when it last received a sample and flags
//! push topics whose push path has gone quiet.
//!
//! # Protocol
//!
//! 1. `watch` starts tracking a topic when it is attached
//! 2. `arm` restarts the clock when the push subscription is confirmed
//! 3. `record_sample` resets the clock on every accepted inbound sample
//! 4. `check_stale`, driven by the session tick, flags topics silent for
//!    longer than their threshold and emits [`HealthEvent::Stale`] once
//! 5. The next push sample for a stale topic emits [`HealthEvent::Recovered`]
//!
//! Only push samples count for push-admitted topics: a fallback poll result
//! keeps the data fresh but does not prove the push path is alive. Pull-only
//! topics are tracked for their last sample but never flagged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::sample::SampleOrigin;
use crate::topic::{AdmissionMode, TopicId, TopicKind};

/// Stale thresholds
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Threshold applied to every kind without an override (default: 5 seconds)
    pub stale_timeout: Duration,
    /// Override for price topics
    pub price_stale_timeout: Option<Duration>,
    /// Override for alert topics
    pub alert_stale_timeout: Option<Duration>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stale_timeout: Duration::from_millis(5000),
            price_stale_timeout: None,
            alert_stale_timeout: None,
        }
    }
}

impl HealthConfig {
    /// Create a new config with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shared stale threshold
    #[must_use]
    pub fn with_stale_timeout(mut self, timeout: Duration) -> Self {
        self.stale_timeout = timeout;
        self
    }

    /// Set a per-kind override
    #[must_use]
    pub fn with_kind_timeout(mut self, kind: TopicKind, timeout: Duration) -> Self {
        match kind {
            TopicKind::Price => self.price_stale_timeout = Some(timeout),
            TopicKind::Alert => self.alert_stale_timeout = Some(timeout),
        }
        self
    }

    /// Create a config suitable for testing (shorter thresholds)
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            stale_timeout: Duration::from_millis(100),
            ..Self::default()
        }
    }

    /// Threshold for a topic kind
    #[must_use]
    pub fn timeout_for(&self, kind: TopicKind) -> Duration {
        match kind {
            TopicKind::Price => self.price_stale_timeout,
            TopicKind::Alert => self.alert_stale_timeout,
        }
        .unwrap_or(self.stale_timeout)
    }

    /// How often `check_stale` should run
    ///
    /// A quarter of the smallest threshold, at least 10ms.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        let smallest = [
            Some(self.stale_timeout),
            self.price_stale_timeout,
            self.alert_stale_timeout,
        ]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(self.stale_timeout);
        (smallest / 4).max(Duration::from_millis(10))
    }
}

/// Point-in-time health of one topic
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TopicHealth {
    /// Kind of the topic
    pub kind: TopicKind,
    /// Admission mode the topic is tracked under
    pub mode: AdmissionMode,
    /// Whether the push path is considered stale
    pub stale: bool,
    /// Last accepted sample from either path
    pub last_sample_at: Option<Instant>,
    /// Last accepted push sample
    pub last_push_at: Option<Instant>,
}

#[derive(Debug)]
struct WatchState {
    health: TopicHealth,
    /// Start of the current silence window when no push sample arrived yet
    armed_at: Instant,
}

impl WatchState {
    fn silent_for(&self, now: Instant) -> Duration {
        let since = match self.health.last_push_at {
            Some(at) if at > self.armed_at => at,
            _ => self.armed_at,
        };
        now.saturating_duration_since(since)
    }
}

/// Health transitions
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HealthEvent {
    /// A push topic has been silent past its threshold
    Stale {
        /// Topic that went stale
        topic: TopicId,
        /// How long it had been silent
        silent_for: Duration,
    },
    /// A stale topic received a push sample again
    Recovered {
        /// Topic that recovered
        topic: TopicId,
    },
}

/// Per-topic health monitor
///
/// Thread-safe monitor that can be shared across tasks.
#[derive(Clone)]
pub struct HealthMonitor {
    config: HealthConfig,
    topics: Arc<RwLock<HashMap<TopicId, WatchState>>>,
    event_tx: Option<mpsc::UnboundedSender<HealthEvent>>,
}

impl HealthMonitor {
    /// Create a monitor without an event channel
    #[must_use]
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            topics: Arc::new(RwLock::new(HashMap::new())),
            event_tx: None,
        }
    }

    /// Create a monitor with an event channel
    #[must_use]
    pub fn with_events(config: HealthConfig) -> (Self, mpsc::UnboundedReceiver<HealthEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = Self {
            event_tx: Some(tx),
            ..Self::new(config)
        };
        (monitor, rx)
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    fn emit_event(&self, event: HealthEvent) {
        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Start tracking a topic
    ///
    /// Watching an already-watched topic leaves its state untouched.
    pub fn watch(&self, topic: &TopicId, kind: TopicKind, mode: AdmissionMode) {
        let mut topics = self.topics.write();
        topics.entry(topic.clone()).or_insert_with(|| WatchState {
            health: TopicHealth {
                kind,
                mode,
                stale: false,
                last_sample_at: None,
                last_push_at: None,
            },
            armed_at: Instant::now(),
        });
        tracing::trace!(topic = %topic, %kind, ?mode, "Watching topic health");
    }

    /// Restart the silence window (push subscription confirmed)
    ///
    /// Has no effect on a topic that is already stale.
    pub fn arm(&self, topic: &TopicId) {
        let mut topics = self.topics.write();
        if let Some(state) = topics.get_mut(topic) {
            if !state.health.stale {
                state.armed_at = Instant::now();
            }
        }
    }

    /// Record an accepted sample
    ///
    /// Returns true if this sample recovered a stale topic. Samples for
    /// topics that are not watched are ignored and never start tracking.
    pub fn record_sample(&self, topic: &TopicId, origin: SampleOrigin) -> bool {
        let now = Instant::now();
        let mut topics = self.topics.write();
        let Some(state) = topics.get_mut(topic) else {
            return false;
        };

        state.health.last_sample_at = Some(now);
        if origin != SampleOrigin::Push {
            return false;
        }
        state.health.last_push_at = Some(now);

        if !state.health.stale {
            return false;
        }
        state.health.stale = false;
        drop(topics);

        tracing::info!(topic = %topic, "Push path recovered");
        self.emit_event(HealthEvent::Recovered {
            topic: topic.clone(),
        });
        true
    }

    /// Flag a push topic stale without waiting for its threshold
    ///
    /// Used when the push path is known to be unusable (rejected
    /// subscription, acknowledgement timeout, credentials refused). Returns
    /// true if the topic was not already stale.
    pub fn mark_stale(&self, topic: &TopicId) -> bool {
        let mut topics = self.topics.write();
        let Some(state) = topics.get_mut(topic) else {
            return false;
        };
        if state.health.stale || state.health.mode != AdmissionMode::Push {
            return false;
        }
        state.health.stale = true;
        let silent_for = state.silent_for(Instant::now());
        drop(topics);

        self.emit_event(HealthEvent::Stale {
            topic: topic.clone(),
            silent_for,
        });
        true
    }

    /// Stop tracking a topic
    pub fn release(&self, topic: &TopicId) {
        if self.topics.write().remove(topic).is_some() {
            tracing::trace!(topic = %topic, "Stopped watching topic health");
        }
    }

    /// Flag push topics that have been silent past their threshold
    ///
    /// Returns only the topics that became stale during this call; a topic
    /// already stale is not reported again until it recovers.
    pub fn check_stale(&self) -> Vec<TopicId> {
        let now = Instant::now();
        let mut newly_stale = Vec::new();
        let mut topics = self.topics.write();

        for (id, state) in topics.iter_mut() {
            if state.health.stale || state.health.mode != AdmissionMode::Push {
                continue;
            }
            let silent_for = state.silent_for(now);
            if silent_for <= self.config.timeout_for(state.health.kind) {
                continue;
            }

            state.health.stale = true;
            tracing::warn!(
                topic = %id,
                silent_ms = silent_for.as_millis() as u64,
                "Topic went stale"
            );
            newly_stale.push((id.clone(), silent_for));
        }
        drop(topics);

        newly_stale
            .into_iter()
            .map(|(topic, silent_for)| {
                self.emit_event(HealthEvent::Stale {
                    topic: topic.clone(),
                    silent_for,
                });
                topic
            })
            .collect()
    }

    /// Health of a topic
    #[must_use]
    pub fn get(&self, topic: &TopicId) -> Option<TopicHealth> {
        self.topics.read().get(topic).map(|s| s.health)
    }

    /// Whether a topic is currently stale
    #[must_use]
    pub fn is_stale(&self, topic: &TopicId) -> bool {
        self.topics
            .read()
            .get(topic)
            .is_some_and(|s| s.health.stale)
    }

    /// Number of watched topics
    #[must_use]
    pub fn watched_count(&self) -> usize {
        self.topics.read().len()
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("watched_count", &self.watched_count())
            .finish()
    }
}
