//! Push Delivery
//!
//! Server-initiated samples over long-lived connections.
//!
//! - `protocol`: JSON control and data frames
//! - `transport`: connector/link traits the channels are written against
//! - `websocket`: production connector (feature `websocket`)
//! - `in_memory`: scriptable connector for tests
//! - `channel`: one managed connection and its state machine
//! - `supervisor`: maps topics onto channels

mod backoff;
mod channel;
pub mod in_memory;
pub mod protocol;
mod supervisor;
pub mod transport;
#[cfg(feature = "websocket")]
pub mod websocket;

use std::time::Duration;

pub use backoff::{Backoff, BackoffPolicy};
pub use channel::{ChannelKey, ConnectionState, PushEvent, SubscribeFailure};
pub use in_memory::{InMemoryConnector, InMemoryPeer};
pub use supervisor::PushSupervisor;
pub use transport::{ConnectRequest, PushConnector, PushLink};
#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;

/// Connection settings for the push supervisor
#[derive(Clone, Debug, PartialEq)]
pub struct PushConfig {
    /// Multiplexed price endpoint
    pub push_url: String,
    /// Alert endpoint; the user is appended as the `email` query parameter
    pub alert_url: String,
    /// Bound on one connect attempt
    pub connect_timeout: Duration,
    /// Bound on waiting for a subscribe acknowledgement
    pub subscribe_ack_timeout: Duration,
    /// Bound on flushing unsubscribes when a channel closes
    pub unsubscribe_grace: Duration,
    /// Base reconnect delay
    pub reconnect_delay: Duration,
    /// Cap for exponential reconnect delays
    pub reconnect_max_delay: Duration,
    /// Random extra delay ratio (0.0..=1.0)
    pub reconnect_jitter: f64,
    /// How the reconnect delay grows
    pub backoff: BackoffPolicy,
}

impl Default for PushConfig {
    fn default() -> Self {
        crate::config::LiveSyncConfig::default().push()
    }
}

impl PushConfig {
    /// Short timeouts suitable for tests
    #[must_use]
    pub fn for_testing() -> Self {
        crate::config::LiveSyncConfig::for_testing().push()
    }

    /// URL of the dedicated alert channel for a user
    #[must_use]
    pub fn alert_url_for(&self, user: &str) -> String {
        match reqwest::Url::parse(&self.alert_url) {
            Ok(mut url) => {
                url.query_pairs_mut().append_pair("email", user);
                url.to_string()
            }
            Err(_) => format!("{}?email={user}", self.alert_url),
        }
    }
}
