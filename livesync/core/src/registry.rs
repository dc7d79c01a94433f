//! Topic Registry - Admission Under the Connection Budget
//!
//! The registry decides, once per topic, whether it holds a push slot or is
//! served by polling only. At most `capacity` topics are push-admitted at any
//! time; topics beyond the budget are admitted pull-only rather than rejected.
//!
//! # State Machine
//!
//! ```text
//!                 admit (slot free)            mark_stale
//!  Unsubscribed ───────────────────► PushActive ─────────► PushPendingFallback
//!       │                                ▲                        │
//!       │ admit (budget full)            └────── mark_recovered ──┘
//!       ▼
//!   PullActive
//!
//!  release: any state ──► Unsubscribed (frees the push slot if held)
//! ```
//!
//! # Thread Safety
//!
//! All transitions go through one `parking_lot::Mutex`, so transitions of a
//! topic are serialized and the push count can never exceed the budget.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::topic::{AdmissionMode, Topic, TopicId};

/// Lifecycle state of a topic inside the registry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicState {
    /// Not attached
    #[default]
    Unsubscribed,
    /// Push-admitted and considered healthy
    PushActive,
    /// Admitted pull-only
    PullActive,
    /// Push-admitted but stale; polling covers it until push recovers
    PushPendingFallback,
}

impl fmt::Display for TopicState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unsubscribed => "unsubscribed",
            Self::PushActive => "push_active",
            Self::PullActive => "pull_active",
            Self::PushPendingFallback => "push_pending_fallback",
        };
        f.write_str(name)
    }
}

/// Notification of a registry transition
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A topic was admitted
    Admitted {
        /// Topic id
        topic: TopicId,
        /// Mode it was admitted under
        mode: AdmissionMode,
    },
    /// A topic was released
    Released {
        /// Topic id
        topic: TopicId,
        /// Mode it held
        mode: AdmissionMode,
    },
    /// A topic moved between states
    StateChanged {
        /// Topic id
        topic: TopicId,
        /// Previous state
        from: TopicState,
        /// New state
        to: TopicState,
    },
}

#[derive(Debug)]
struct TopicEntry {
    topic: Topic,
    mode: AdmissionMode,
    state: TopicState,
    admitted_at: Instant,
}

#[derive(Debug, Default)]
struct RegistryInner {
    entries: HashMap<TopicId, TopicEntry>,
    push_count: usize,
}

/// Registry of attached topics and their admission modes
#[derive(Debug, Clone)]
pub struct TopicRegistry {
    capacity: usize,
    inner: Arc<Mutex<RegistryInner>>,
    event_tx: Option<mpsc::UnboundedSender<RegistryEvent>>,
}

impl TopicRegistry {
    /// Create a registry with a push budget of `capacity`
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Arc::new(Mutex::new(RegistryInner::default())),
            event_tx: None,
        }
    }

    /// Create a registry that reports transitions on a channel
    #[must_use]
    pub fn with_events(capacity: usize, event_tx: mpsc::UnboundedSender<RegistryEvent>) -> Self {
        Self {
            event_tx: Some(event_tx),
            ..Self::new(capacity)
        }
    }

    fn emit(&self, event: RegistryEvent) {
        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Admit a topic, deciding its mode
    ///
    /// Idempotent: admitting an already-admitted topic returns its existing
    /// mode without taking another slot.
    pub fn admit(&self, topic: &Topic) -> AdmissionMode {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get(&topic.id) {
            return entry.mode;
        }

        let (mode, state) = if inner.push_count < self.capacity {
            inner.push_count += 1;
            (AdmissionMode::Push, TopicState::PushActive)
        } else {
            (AdmissionMode::Pull, TopicState::PullActive)
        };

        inner.entries.insert(
            topic.id.clone(),
            TopicEntry {
                topic: topic.clone(),
                mode,
                state,
                admitted_at: Instant::now(),
            },
        );
        let push_count = inner.push_count;
        drop(inner);

        tracing::debug!(
            topic = %topic.id,
            ?mode,
            push_count,
            capacity = self.capacity,
            "Topic admitted"
        );
        self.emit(RegistryEvent::Admitted {
            topic: topic.id.clone(),
            mode,
        });
        mode
    }

    /// Release a topic, freeing its push slot if it held one
    ///
    /// Returns the mode it was admitted under, or `None` if it was not
    /// admitted. Releasing twice is a no-op.
    pub fn release(&self, id: &TopicId) -> Option<AdmissionMode> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.remove(id)?;
        if entry.mode == AdmissionMode::Push {
            inner.push_count = inner.push_count.saturating_sub(1);
        }
        drop(inner);

        tracing::debug!(
            topic = %id,
            mode = ?entry.mode,
            held_for_ms = entry.admitted_at.elapsed().as_millis() as u64,
            "Topic released"
        );
        self.emit(RegistryEvent::Released {
            topic: id.clone(),
            mode: entry.mode,
        });
        Some(entry.mode)
    }

    fn transition(&self, id: &TopicId, from: TopicState, to: TopicState) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(id) else {
            return false;
        };
        if entry.state != from {
            return false;
        }
        entry.state = to;
        drop(inner);

        tracing::debug!(topic = %id, %from, %to, "Topic state changed");
        self.emit(RegistryEvent::StateChanged {
            topic: id.clone(),
            from,
            to,
        });
        true
    }

    /// Move a push topic into fallback
    ///
    /// Returns true if the topic was `PushActive`.
    pub fn mark_stale(&self, id: &TopicId) -> bool {
        self.transition(id, TopicState::PushActive, TopicState::PushPendingFallback)
    }

    /// Move a push topic out of fallback
    ///
    /// Returns true if the topic was `PushPendingFallback`.
    pub fn mark_recovered(&self, id: &TopicId) -> bool {
        self.transition(id, TopicState::PushPendingFallback, TopicState::PushActive)
    }

    /// Current state of a topic
    #[must_use]
    pub fn state(&self, id: &TopicId) -> TopicState {
        self.inner
            .lock()
            .entries
            .get(id)
            .map_or(TopicState::Unsubscribed, |e| e.state)
    }

    /// Admission mode of a topic (`None` when not admitted)
    #[must_use]
    pub fn mode(&self, id: &TopicId) -> AdmissionMode {
        self.inner
            .lock()
            .entries
            .get(id)
            .map_or(AdmissionMode::None, |e| e.mode)
    }

    /// The admitted topic for an id
    #[must_use]
    pub fn topic(&self, id: &TopicId) -> Option<Topic> {
        self.inner.lock().entries.get(id).map(|e| e.topic.clone())
    }

    /// Whether a topic is admitted
    #[must_use]
    pub fn contains(&self, id: &TopicId) -> bool {
        self.inner.lock().entries.contains_key(id)
    }

    /// Number of push-admitted topics
    #[must_use]
    pub fn push_count(&self) -> usize {
        self.inner.lock().push_count
    }

    /// The push budget
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of admitted topics
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether no topic is admitted
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// All admitted topics
    #[must_use]
    pub fn topics(&self) -> Vec<Topic> {
        self.inner
            .lock()
            .entries
            .values()
            .map(|e| e.topic.clone())
            .collect()
    }
}
