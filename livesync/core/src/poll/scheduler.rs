//! Fallback Poll Scheduler
//!
//! Keeps topics fresh by pulling when push is unavailable:
//! - pull-only topics (no push slot) are polled for as long as they are attached
//! - push topics are polled only while flagged stale
//!
//! Each tick dispatches at most `batch_size` due topics, one request each,
//! concurrently. Topics not picked because the batch was full stay ahead of
//! the ones just polled, so every due topic is reached within a few ticks.
//!
//! When a stale topic recovers it is marked for removal and dropped at the
//! next tick boundary; a request already in flight completes and merges
//! normally.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use super::source::PullSource;
use crate::error::PullError;
use crate::store::SampleSink;
use crate::topic::{Topic, TopicId, TopicKind};

/// Poll cadence settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    /// How often a price topic is pulled
    pub price_interval: Duration,
    /// How often an alert topic is pulled
    pub alert_interval: Duration,
    /// Most requests dispatched per tick
    pub batch_size: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            price_interval: Duration::from_millis(2000),
            alert_interval: Duration::from_millis(5000),
            batch_size: 10,
        }
    }
}

impl PollConfig {
    /// Interval for a topic kind
    #[must_use]
    pub fn interval_for(&self, kind: TopicKind) -> Duration {
        match kind {
            TopicKind::Price => self.price_interval,
            TopicKind::Alert => self.alert_interval,
        }
    }

    /// Scheduler tick period: the shorter of the two intervals
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        self.price_interval
            .min(self.alert_interval)
            .max(Duration::from_millis(1))
    }
}

/// Why a topic is being polled
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollReason {
    /// Topic was admitted without a push slot
    PullOnly,
    /// Topic's push path went stale
    Stale,
}

/// Result of one dispatched pull
#[derive(Debug)]
pub struct PollOutcome {
    /// Topic that was pulled
    pub topic: TopicId,
    /// Whether the pull produced a sample; merged or not
    pub result: Result<bool, PullError>,
}

#[derive(Debug)]
struct PollEntry {
    topic: Topic,
    reason: PollReason,
    next_due: Instant,
    in_flight: bool,
    stopping: bool,
}

#[derive(Debug, Default)]
struct SchedulerInner {
    entries: HashMap<TopicId, PollEntry>,
    order: VecDeque<TopicId>,
}

impl SchedulerInner {
    fn enroll(&mut self, topic: &Topic, reason: PollReason) -> bool {
        if let Some(entry) = self.entries.get_mut(&topic.id) {
            let restarted = entry.stopping;
            entry.stopping = false;
            if reason == PollReason::Stale && restarted {
                entry.next_due = Instant::now();
            }
            return restarted;
        }
        self.entries.insert(
            topic.id.clone(),
            PollEntry {
                topic: topic.clone(),
                reason,
                next_due: Instant::now(),
                in_flight: false,
                stopping: false,
            },
        );
        self.order.push_back(topic.id.clone());
        true
    }

    fn remove(&mut self, topic: &TopicId) -> bool {
        if self.entries.remove(topic).is_none() {
            return false;
        }
        self.order.retain(|id| id != topic);
        true
    }
}

/// Schedules pulls for topics without a healthy push path
pub struct PollScheduler {
    config: PollConfig,
    source: Arc<dyn PullSource>,
    sink: SampleSink,
    inner: Mutex<SchedulerInner>,
}

impl PollScheduler {
    /// Create a scheduler
    pub fn new(config: PollConfig, source: Arc<dyn PullSource>, sink: SampleSink) -> Self {
        Self {
            config,
            source,
            sink,
            inner: Mutex::new(SchedulerInner::default()),
        }
    }

    /// Poll cadence
    #[must_use]
    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Poll a topic that has no push slot
    pub fn enroll_pull_only(&self, topic: &Topic) -> bool {
        let enrolled = self.inner.lock().enroll(topic, PollReason::PullOnly);
        if enrolled {
            tracing::debug!(topic = %topic.id, "Polling pull-only topic");
        }
        enrolled
    }

    /// Start fallback polling for a stale push topic
    ///
    /// The topic is due at once. Returns false if it was already polling.
    pub fn enroll_stale(&self, topic: &Topic) -> bool {
        let enrolled = self.inner.lock().enroll(topic, PollReason::Stale);
        if enrolled {
            tracing::info!(topic = %topic.id, "Fallback polling started");
        }
        enrolled
    }

    /// Stop fallback polling at the next tick boundary
    ///
    /// Only topics polled because they were stale are affected.
    pub fn clear_stale(&self, topic: &TopicId) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(topic) {
            Some(entry) if entry.reason == PollReason::Stale && !entry.stopping => {
                entry.stopping = true;
                tracing::debug!(topic = %topic, "Fallback polling ends at next tick");
                true
            }
            _ => false,
        }
    }

    /// Forget a topic immediately
    pub fn release(&self, topic: &TopicId) -> bool {
        self.inner.lock().remove(topic)
    }

    /// Forget every topic
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    /// Whether a topic will be pulled on coming ticks
    #[must_use]
    pub fn is_polling(&self, topic: &TopicId) -> bool {
        self.inner
            .lock()
            .entries
            .get(topic)
            .is_some_and(|entry| !entry.stopping)
    }

    /// Why a topic is polled, if it is
    #[must_use]
    pub fn reason(&self, topic: &TopicId) -> Option<PollReason> {
        self.inner
            .lock()
            .entries
            .get(topic)
            .filter(|entry| !entry.stopping)
            .map(|entry| entry.reason)
    }

    /// Number of topics being polled
    #[must_use]
    pub fn polling_count(&self) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|entry| !entry.stopping)
            .count()
    }

    /// Take up to `batch_size` due topics
    ///
    /// Drops topics marked for removal first. Picked topics move to the back
    /// of the rotation and become due again one interval from now.
    fn take_due(&self, now: Instant) -> Vec<Topic> {
        let mut inner = self.inner.lock();
        let stopped: Vec<TopicId> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.stopping)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stopped {
            inner.remove(id);
            tracing::debug!(topic = %id, "Fallback polling stopped");
        }

        let SchedulerInner { entries, order } = &mut *inner;
        let mut kept = VecDeque::with_capacity(order.len());
        let mut picked_ids = Vec::new();
        let mut batch = Vec::new();

        for id in order.drain(..) {
            let due = batch.len() < self.config.batch_size
                && entries
                    .get(&id)
                    .is_some_and(|entry| !entry.in_flight && entry.next_due <= now);
            if !due {
                kept.push_back(id);
                continue;
            }
            if let Some(entry) = entries.get_mut(&id) {
                entry.in_flight = true;
                entry.next_due = now + self.config.interval_for(entry.topic.kind);
                batch.push(entry.topic.clone());
            }
            picked_ids.push(id);
        }
        kept.extend(picked_ids);
        *order = kept;
        batch
    }

    /// Dispatch one tick's worth of pulls into `in_flight`
    ///
    /// Returns how many requests were started.
    pub fn tick(&self, in_flight: &mut JoinSet<PollOutcome>) -> usize {
        let batch = self.take_due(Instant::now());
        let count = batch.len();
        if count > 0 {
            tracing::trace!(count, "Dispatching pulls");
        }

        for topic in batch {
            let source = Arc::clone(&self.source);
            let sink = self.sink.clone();
            in_flight.spawn(async move {
                let stats = Arc::clone(sink.store().stats());
                let result = match source.fetch(&topic).await {
                    Ok(sample) if sample.topic == topic.id => {
                        stats.record_pull_ok();
                        Ok(sink.ingest(sample))
                    }
                    Ok(sample) => {
                        stats.record_pull_failed();
                        Err(PullError::Decode(format!(
                            "sample for {} returned when pulling {}",
                            sample.topic, topic.id
                        )))
                    }
                    Err(e) => {
                        stats.record_pull_failed();
                        Err(e)
                    }
                };
                PollOutcome {
                    topic: topic.id,
                    result,
                }
            });
        }
        count
    }

    /// Record that a dispatched pull finished
    pub fn complete(&self, outcome: &PollOutcome) {
        if let Err(ref e) = outcome.result {
            tracing::warn!(topic = %outcome.topic, error = %e, "Pull failed");
        }
        if let Some(entry) = self.inner.lock().entries.get_mut(&outcome.topic) {
            entry.in_flight = false;
        }
    }
}

impl std::fmt::Debug for PollScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollScheduler")
            .field("config", &self.config)
            .field("polling", &self.polling_count())
            .finish_non_exhaustive()
    }
}
