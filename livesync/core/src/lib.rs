//! Live-Sync Core - Push-First Market Data With Polling Fallback
//!
//! Keeps a local view of a dynamic set of topics (asset prices, user alert
//! feeds) fresh. Topics are served over push connections while those are
//! healthy and switch transparently to polling when they are not. Connection
//! count and timers stay bounded, and everything held for a topic is
//! released when the consumer detaches.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Consumer                                │
//! │        attach / detach        latest / subscribe / events        │
//! └───────────────┬──────────────────────────────▲───────────────────┘
//!                 │                              │
//! ┌───────────────▼──────────────────────────────┴───────────────────┐
//! │                       Session (driver task)                      │
//! │  ┌──────────┐  ┌──────────┐  ┌───────────┐  ┌─────────────────┐  │
//! │  │ Topic    │  │ Health   │  │ Poll      │  │ Push            │  │
//! │  │ Registry │  │ Monitor  │  │ Scheduler │  │ Supervisor      │  │
//! │  └──────────┘  └────▲─────┘  └─────┬─────┘  └────────┬────────┘  │
//! │                     │              │ pull            │ frames    │
//! │                ┌────┴──────────────▼─────────────────▼────────┐  │
//! │                │          SampleSink ──► SampleStore          │  │
//! │                └──────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`LiveSync`]: the service; opens sessions
//! - [`Session`]: attached topics plus the read API
//! - [`Topic`]: one price or alert stream
//! - [`Sample`]: one update, ordered by server token or receipt time
//! - [`LiveSyncConfig`]: TOML + environment configuration
//!
//! # Quick Start
//!
//! ```ignore
//! use livesync_core::{AuthContext, LiveSync, Topic, load_config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sync = LiveSync::from_config(load_config()?, AuthContext::from_env())?;
//!     let mut session = sync
//!         .attach(vec![Topic::price("005930"), Topic::price("KRW-BTC")])
//!         .await?;
//!
//!     while let Some(event) = session.next_event().await {
//!         println!("{event:?}");
//!     }
//!     session.detach().await?;
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod config;
pub mod error;
pub mod health;
pub mod poll;
pub mod push;
pub mod registry;
pub mod sample;
pub mod session;
pub mod stats;
pub mod store;
pub mod topic;

pub use auth::AuthContext;
pub use config::{load_config, load_config_from_path, ConfigError, ConfigSource, LiveSyncConfig};
pub use error::{AuthError, ProtocolError, PullError, SyncError, TransportError};
pub use health::{HealthConfig, HealthEvent, HealthMonitor, TopicHealth};
pub use poll::{HttpPullSource, PollConfig, PollScheduler, PullSource, ScriptedPullSource};
pub use push::{
    BackoffPolicy, ChannelKey, ConnectionState, InMemoryConnector, InMemoryPeer, PushConfig,
    PushConnector, PushEvent, PushLink, PushSupervisor,
};
#[cfg(feature = "websocket")]
pub use push::WebSocketConnector;
pub use registry::{RegistryEvent, TopicRegistry, TopicState};
pub use sample::{AlertPayload, OrderingToken, Payload, PricePayload, Sample, SampleOrigin};
pub use session::{LiveSync, Session, SessionEvent, TopicStatus};
pub use stats::{StatsSnapshot, SyncStats};
pub use store::{SampleSink, SampleStore, TopicSubscription};
pub use topic::{AdmissionMode, AssetClass, Topic, TopicId, TopicKind};
