//! Push Connection Supervisor
//!
//! Maps push-admitted topics onto managed channels:
//! - price topics share one multiplexed channel, opened on first use and
//!   closed when its last topic leaves
//! - alert topics each get a dedicated channel to the alert endpoint
//!
//! A topic holds at most one subscription at a time. Channels that ended
//! after refused credentials are replaced only when a topic is subscribed
//! again; they are never retried on their own.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::channel::{ChannelHandle, ChannelKey, ConnectionState, PushEvent};
use super::transport::{ConnectRequest, PushConnector};
use super::PushConfig;
use crate::auth::AuthContext;
use crate::store::SampleSink;
use crate::topic::{Topic, TopicId, TopicKind};

#[derive(Default)]
struct SupervisorInner {
    channels: HashMap<ChannelKey, ChannelHandle>,
    routes: HashMap<TopicId, ChannelKey>,
}

/// Owns every push channel of one session
pub struct PushSupervisor {
    config: PushConfig,
    auth: AuthContext,
    connector: Arc<dyn PushConnector>,
    sink: SampleSink,
    events: mpsc::UnboundedSender<PushEvent>,
    inner: Mutex<SupervisorInner>,
}

impl PushSupervisor {
    /// Create a supervisor; channels are opened lazily
    pub fn new(
        config: PushConfig,
        auth: AuthContext,
        connector: Arc<dyn PushConnector>,
        sink: SampleSink,
        events: mpsc::UnboundedSender<PushEvent>,
    ) -> Self {
        Self {
            config,
            auth,
            connector,
            sink,
            events,
            inner: Mutex::new(SupervisorInner::default()),
        }
    }

    fn key_for(topic: &Topic) -> ChannelKey {
        match topic.kind {
            TopicKind::Price => ChannelKey::Shared,
            TopicKind::Alert => ChannelKey::Dedicated(topic.id.clone()),
        }
    }

    fn spawn_channel(&self, key: &ChannelKey, topic: &Topic) -> ChannelHandle {
        let (url, implicit) = match key {
            ChannelKey::Shared => (self.config.push_url.clone(), None),
            ChannelKey::Dedicated(id) => {
                let user = topic.alert_user().unwrap_or_default();
                (self.config.alert_url_for(user), Some(id.clone()))
            }
        };
        tracing::debug!(channel = %key, %url, "Opening push channel");
        ChannelHandle::spawn(
            key.clone(),
            implicit,
            &self.config,
            ConnectRequest::new(url, self.auth.clone()),
            Arc::clone(&self.connector),
            self.sink.clone(),
            self.events.clone(),
        )
    }

    /// Route a topic onto its channel
    ///
    /// Returns false if the topic already has a subscription.
    pub fn subscribe(&self, topic: &Topic) -> bool {
        let key = Self::key_for(topic);
        let mut inner = self.inner.lock();
        if inner.routes.contains_key(&topic.id) {
            return false;
        }

        let finished = inner.channels.get(&key).is_some_and(ChannelHandle::is_finished);
        if finished {
            tracing::info!(channel = %key, "Replacing ended push channel");
            inner.channels.remove(&key);
        }
        let spawned = !inner.channels.contains_key(&key);
        if spawned {
            let handle = self.spawn_channel(&key, topic);
            inner.channels.insert(key.clone(), handle);
        }
        inner.routes.insert(topic.id.clone(), key.clone());

        if key == ChannelKey::Shared {
            // A fresh shared channel carries every routed price topic
            let topics: Vec<TopicId> = if spawned {
                inner
                    .routes
                    .iter()
                    .filter(|(_, k)| **k == key)
                    .map(|(id, _)| id.clone())
                    .collect()
            } else {
                vec![topic.id.clone()]
            };
            if let Some(handle) = inner.channels.get(&key) {
                for id in topics {
                    handle.subscribe(id);
                }
            }
        }
        true
    }

    /// Drop a topic's subscription
    ///
    /// Waits for the channel to close when this was its last topic. Returns
    /// false if the topic had no subscription.
    pub async fn unsubscribe(&self, topic: &TopicId) -> bool {
        let closing = {
            let mut inner = self.inner.lock();
            let Some(key) = inner.routes.remove(topic) else {
                return false;
            };
            let still_used = inner.routes.values().any(|k| *k == key);
            if still_used {
                if let Some(handle) = inner.channels.get(&key) {
                    handle.unsubscribe(topic.clone());
                }
                None
            } else {
                inner.channels.remove(&key)
            }
        };

        if let Some(handle) = closing {
            tracing::debug!(channel = %handle.key(), "Closing idle push channel");
            handle.close().await;
        }
        true
    }

    /// Close every channel and wait for them to end
    pub async fn close(&self) {
        let handles: Vec<ChannelHandle> = {
            let mut inner = self.inner.lock();
            inner.routes.clear();
            inner.channels.drain().map(|(_, handle)| handle).collect()
        };
        if handles.is_empty() {
            return;
        }
        tracing::debug!(count = handles.len(), "Closing push channels");
        join_all(handles.into_iter().map(ChannelHandle::close)).await;
    }

    /// Whether a topic currently has a subscription
    #[must_use]
    pub fn is_subscribed(&self, topic: &TopicId) -> bool {
        self.inner.lock().routes.contains_key(topic)
    }

    /// Channel carrying a topic
    #[must_use]
    pub fn channel_for(&self, topic: &TopicId) -> Option<ChannelKey> {
        self.inner.lock().routes.get(topic).cloned()
    }

    /// State of a channel, if it exists
    #[must_use]
    pub fn channel_state(&self, key: &ChannelKey) -> Option<ConnectionState> {
        self.inner.lock().channels.get(key).map(ChannelHandle::state)
    }

    /// Number of open channels
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.inner.lock().channels.len()
    }

    /// Number of subscribed topics
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.lock().routes.len()
    }
}

impl std::fmt::Debug for PushSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PushSupervisor")
            .field("channels", &inner.channels.len())
            .field("subscriptions", &inner.routes.len())
            .finish_non_exhaustive()
    }
}
