//! Sample Store - Single Writer of Externally Observed State
//!
//! Both delivery paths write through [`SampleStore::merge`]. A sample is
//! applied only when it is not older than the stored one, so late or
//! duplicated deliveries can never revert a topic.
//!
//! Entries live in a `DashMap`; the compare-and-set for a topic runs under
//! that key's shard lock, so merges for one topic are atomic while merges for
//! different topics proceed independently.
//!
//! Readers register with [`SampleStore::subscribe`] and get a
//! [`TopicSubscription`]. Dropping it unregisters the listener.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::health::HealthMonitor;
use crate::sample::Sample;
use crate::stats::SyncStats;
use crate::topic::TopicId;

#[derive(Debug, Default)]
struct StoreEntry {
    latest: Option<Sample>,
    listeners: Vec<(u64, mpsc::UnboundedSender<Sample>)>,
}

#[derive(Debug)]
struct StoreInner {
    entries: DashMap<TopicId, StoreEntry>,
    next_listener: AtomicU64,
    stats: Arc<SyncStats>,
}

/// Per-topic latest-sample store
#[derive(Debug, Clone)]
pub struct SampleStore {
    inner: Arc<StoreInner>,
}

impl Default for SampleStore {
    fn default() -> Self {
        Self::new(Arc::new(SyncStats::default()))
    }
}

impl SampleStore {
    /// Create an empty store reporting into `stats`
    #[must_use]
    pub fn new(stats: Arc<SyncStats>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                entries: DashMap::new(),
                next_listener: AtomicU64::new(1),
                stats,
            }),
        }
    }

    /// Start accepting samples for a topic
    ///
    /// Opening an already-open topic keeps its current sample.
    pub fn open(&self, topic: &TopicId) {
        self.inner.entries.entry(topic.clone()).or_default();
    }

    /// Stop accepting samples for a topic
    ///
    /// Drops the stored sample and every listener; their receivers end.
    pub fn close(&self, topic: &TopicId) {
        if let Some((_, entry)) = self.inner.entries.remove(topic) {
            tracing::trace!(
                topic = %topic,
                listeners = entry.listeners.len(),
                "Store entry closed"
            );
        }
    }

    /// Whether a topic is open
    #[must_use]
    pub fn is_open(&self, topic: &TopicId) -> bool {
        self.inner.entries.contains_key(topic)
    }

    /// Merge a sample, returning whether it was applied
    ///
    /// Rejected when the topic is not open or the sample is strictly older
    /// than the stored one. Listeners are notified of applied samples in
    /// merge order.
    pub fn merge(&self, sample: Sample) -> bool {
        let Some(mut entry) = self.inner.entries.get_mut(&sample.topic) else {
            tracing::trace!(topic = %sample.topic, "Discarding sample for closed topic");
            self.inner.stats.record_discarded();
            return false;
        };

        if let Some(ref current) = entry.latest {
            if sample.is_older_than(current) {
                tracing::trace!(
                    topic = %sample.topic,
                    incoming = ?sample.token(),
                    stored = ?current.token(),
                    "Rejecting out-of-order sample"
                );
                self.inner.stats.record_rejected();
                return false;
            }
        }

        entry
            .listeners
            .retain(|(_, tx)| tx.send(sample.clone()).is_ok());
        entry.latest = Some(sample);
        self.inner.stats.record_applied();
        true
    }

    /// Latest sample of a topic
    #[must_use]
    pub fn latest(&self, topic: &TopicId) -> Option<Sample> {
        self.inner
            .entries
            .get(topic)
            .and_then(|entry| entry.latest.clone())
    }

    /// Latest sample of every open topic that has one
    #[must_use]
    pub fn snapshot(&self) -> HashMap<TopicId, Sample> {
        self.inner
            .entries
            .iter()
            .filter_map(|entry| {
                entry
                    .latest
                    .clone()
                    .map(|sample| (entry.key().clone(), sample))
            })
            .collect()
    }

    /// Register a listener for applied samples of an open topic
    ///
    /// Returns `None` if the topic is not open.
    #[must_use]
    pub fn subscribe(&self, topic: &TopicId) -> Option<TopicSubscription> {
        let mut entry = self.inner.entries.get_mut(topic)?;
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        entry.listeners.push((id, tx));

        Some(TopicSubscription {
            topic: topic.clone(),
            id,
            rx,
            store: Arc::downgrade(&self.inner),
        })
    }

    /// Number of listeners on a topic
    #[must_use]
    pub fn listener_count(&self, topic: &TopicId) -> usize {
        self.inner
            .entries
            .get(topic)
            .map_or(0, |entry| entry.listeners.len())
    }

    /// Shared counters
    #[must_use]
    pub fn stats(&self) -> &Arc<SyncStats> {
        &self.inner.stats
    }
}

/// Listener on one topic's applied samples
///
/// Dropping the subscription unregisters it.
#[derive(Debug)]
pub struct TopicSubscription {
    topic: TopicId,
    id: u64,
    rx: mpsc::UnboundedReceiver<Sample>,
    store: Weak<StoreInner>,
}

impl TopicSubscription {
    /// Topic this subscription listens on
    #[must_use]
    pub fn topic(&self) -> &TopicId {
        &self.topic
    }

    /// Wait for the next applied sample
    ///
    /// Returns `None` once the topic is detached.
    pub async fn recv(&mut self) -> Option<Sample> {
        self.rx.recv().await
    }

    /// Take the next applied sample if one is queued
    pub fn try_recv(&mut self) -> Option<Sample> {
        self.rx.try_recv().ok()
    }
}

impl Drop for TopicSubscription {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            if let Some(mut entry) = store.entries.get_mut(&self.topic) {
                entry.listeners.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

/// Entry point shared by the push and pull paths
///
/// Merges a sample and resets its topic's health clock. The clock is reset
/// even when the merge is rejected as out of order: the sample still proves
/// the path is alive.
#[derive(Debug, Clone)]
pub struct SampleSink {
    store: SampleStore,
    health: HealthMonitor,
}

impl SampleSink {
    /// Create a sink over a store and health monitor
    #[must_use]
    pub fn new(store: SampleStore, health: HealthMonitor) -> Self {
        Self { store, health }
    }

    /// Merge a sample and record it with the health monitor
    ///
    /// Returns whether the store was updated.
    pub fn ingest(&self, sample: Sample) -> bool {
        let topic = sample.topic.clone();
        let origin = sample.origin;
        let applied = self.store.merge(sample);
        self.health.record_sample(&topic, origin);
        applied
    }

    /// The underlying store
    #[must_use]
    pub fn store(&self) -> &SampleStore {
        &self.store
    }
}
