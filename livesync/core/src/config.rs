//! Live-Sync Configuration
//!
//! Configuration is loaded with the following priority (highest first):
//! 1. Environment variables (`LIVESYNC_*`)
//! 2. TOML configuration file
//! 3. Default values
//!
//! The file lives at `$XDG_CONFIG_HOME/livesync/livesync.toml` by default.
//!
//! # Example Configuration
//!
//! ```toml
//! [endpoints]
//! push_url = "ws://34.210.11.121:8080/ws/stocks"
//! alert_url = "ws://34.210.11.121:8080/ws/socket/alert"
//! pull_base_url = "http://34.210.11.121:8080"
//!
//! [push]
//! max_push_connections = 10
//! reconnect_delay_ms = 5000
//! backoff = "exponential"
//! reconnect_max_delay_ms = 60000
//!
//! [poll]
//! price_poll_interval_ms = 2000
//! alert_poll_interval_ms = 5000
//! poll_batch_size = 10
//!
//! [health]
//! stale_timeout_ms = 5000
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::health::HealthConfig;
use crate::poll::PollConfig;
use crate::push::{BackoffPolicy, PushConfig};
use crate::topic::TopicKind;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Tracks where the configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Endpoint section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsToml {
    /// Multiplexed price channel
    pub push_url: Option<String>,
    /// Per-user alert channel (user is appended as `?email=`)
    pub alert_url: Option<String>,
    /// Base URL of the pull endpoint
    pub pull_base_url: Option<String>,
}

/// Push section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PushToml {
    /// Connection budget: topics that may hold a push slot
    pub max_push_connections: Option<usize>,
    /// Base reconnect delay in milliseconds
    pub reconnect_delay_ms: Option<u64>,
    /// `"fixed"` or `"exponential"`
    pub backoff: Option<String>,
    /// Upper bound for exponential backoff in milliseconds
    pub reconnect_max_delay_ms: Option<u64>,
    /// Random jitter applied to each delay, 0.0..=1.0
    pub reconnect_jitter: Option<f64>,
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
    /// Subscribe acknowledgement timeout in milliseconds
    pub subscribe_ack_timeout_ms: Option<u64>,
    /// Time allowed to flush unsubscribes on close, in milliseconds
    pub unsubscribe_grace_ms: Option<u64>,
}

/// Poll section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PollToml {
    /// Poll cadence for both kinds; the per-kind keys below override it
    pub poll_interval_ms: Option<u64>,
    /// Poll cadence for price topics in milliseconds
    pub price_poll_interval_ms: Option<u64>,
    /// Poll cadence for alert topics in milliseconds
    pub alert_poll_interval_ms: Option<u64>,
    /// Maximum pull requests per tick
    pub poll_batch_size: Option<usize>,
    /// Per-request timeout in milliseconds
    pub pull_timeout_ms: Option<u64>,
}

/// Health section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthToml {
    /// Stale threshold applied to every topic kind
    pub stale_timeout_ms: Option<u64>,
    /// Override for price topics
    pub price_stale_timeout_ms: Option<u64>,
    /// Override for alert topics
    pub alert_stale_timeout_ms: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveSyncToml {
    /// Endpoints section
    pub endpoints: EndpointsToml,
    /// Push section
    pub push: PushToml,
    /// Poll section
    pub poll: PollToml,
    /// Health section
    pub health: HealthToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Configuration of the live-sync service
#[derive(Clone, Debug)]
pub struct LiveSyncConfig {
    /// Multiplexed price channel URL
    pub push_url: String,
    /// Alert channel URL
    pub alert_url: String,
    /// Pull endpoint base URL
    pub pull_base_url: String,
    /// Connection budget `C`
    pub max_push_connections: usize,
    /// Poll cadence for price topics
    pub price_poll_interval: Duration,
    /// Poll cadence for alert topics
    pub alert_poll_interval: Duration,
    /// Maximum pull requests per tick `B`
    pub poll_batch_size: usize,
    /// Per-request pull timeout
    pub pull_timeout: Duration,
    /// Stale threshold
    pub stale_timeout: Duration,
    /// Stale threshold override for price topics
    pub price_stale_timeout: Option<Duration>,
    /// Stale threshold override for alert topics
    pub alert_stale_timeout: Option<Duration>,
    /// Base reconnect delay
    pub reconnect_delay: Duration,
    /// Reconnect delay policy
    pub backoff: BackoffPolicy,
    /// Upper bound for exponential backoff
    pub reconnect_max_delay: Duration,
    /// Jitter ratio applied to reconnect delays
    pub reconnect_jitter: f64,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Subscribe acknowledgement timeout
    pub subscribe_ack_timeout: Duration,
    /// Grace period for flushing unsubscribes on close
    pub unsubscribe_grace: Duration,
    /// Capacity of each session's event queue
    pub event_buffer: usize,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    /// Source of configuration values
    source: ConfigSource,
}

impl Default for LiveSyncConfig {
    fn default() -> Self {
        Self {
            push_url: "ws://127.0.0.1:8080/ws/stocks".to_string(),
            alert_url: "ws://127.0.0.1:8080/ws/socket/alert".to_string(),
            pull_base_url: "http://127.0.0.1:8080".to_string(),
            max_push_connections: 10,
            price_poll_interval: Duration::from_millis(2000),
            alert_poll_interval: Duration::from_millis(5000),
            poll_batch_size: 10,
            pull_timeout: Duration::from_secs(10),
            stale_timeout: Duration::from_millis(5000),
            price_stale_timeout: None,
            alert_stale_timeout: None,
            reconnect_delay: Duration::from_millis(5000),
            backoff: BackoffPolicy::Fixed,
            reconnect_max_delay: Duration::from_secs(60),
            reconnect_jitter: 0.0,
            connect_timeout: Duration::from_millis(5000),
            subscribe_ack_timeout: Duration::from_millis(5000),
            unsubscribe_grace: Duration::from_millis(100),
            event_buffer: 256,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl LiveSyncConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration with short timings for tests
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            max_push_connections: 10,
            price_poll_interval: Duration::from_millis(40),
            alert_poll_interval: Duration::from_millis(40),
            pull_timeout: Duration::from_millis(500),
            stale_timeout: Duration::from_millis(150),
            reconnect_delay: Duration::from_millis(50),
            reconnect_max_delay: Duration::from_millis(400),
            connect_timeout: Duration::from_millis(500),
            subscribe_ack_timeout: Duration::from_millis(500),
            unsubscribe_grace: Duration::from_millis(20),
            ..Self::default()
        }
    }

    /// Set the connection budget
    #[must_use]
    pub fn with_max_push_connections(mut self, cap: usize) -> Self {
        self.max_push_connections = cap;
        self
    }

    /// Set the stale threshold for every kind
    #[must_use]
    pub fn with_stale_timeout(mut self, timeout: Duration) -> Self {
        self.stale_timeout = timeout;
        self
    }

    /// Set how long a subscribe may wait for its acknowledgement
    #[must_use]
    pub fn with_subscribe_ack_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_ack_timeout = timeout;
        self
    }

    /// Set the poll batch size
    #[must_use]
    pub fn with_poll_batch_size(mut self, batch: usize) -> Self {
        self.poll_batch_size = batch;
        self
    }

    /// Set the reconnect delay and policy
    #[must_use]
    pub fn with_backoff(mut self, policy: BackoffPolicy, base: Duration) -> Self {
        self.backoff = policy;
        self.reconnect_delay = base;
        self
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Poll cadence for a topic kind
    #[must_use]
    pub fn poll_interval(&self, kind: TopicKind) -> Duration {
        match kind {
            TopicKind::Price => self.price_poll_interval,
            TopicKind::Alert => self.alert_poll_interval,
        }
    }

    /// Stale threshold for a topic kind
    #[must_use]
    pub fn stale_timeout_for(&self, kind: TopicKind) -> Duration {
        match kind {
            TopicKind::Price => self.price_stale_timeout,
            TopicKind::Alert => self.alert_stale_timeout,
        }
        .unwrap_or(self.stale_timeout)
    }

    /// Health monitor settings
    #[must_use]
    pub fn health(&self) -> HealthConfig {
        HealthConfig {
            stale_timeout: self.stale_timeout,
            price_stale_timeout: self.price_stale_timeout,
            alert_stale_timeout: self.alert_stale_timeout,
        }
    }

    /// Poll scheduler settings
    #[must_use]
    pub fn poll(&self) -> PollConfig {
        PollConfig {
            price_interval: self.price_poll_interval,
            alert_interval: self.alert_poll_interval,
            batch_size: self.poll_batch_size,
        }
    }

    /// Push supervisor settings
    #[must_use]
    pub fn push(&self) -> PushConfig {
        PushConfig {
            push_url: self.push_url.clone(),
            alert_url: self.alert_url.clone(),
            connect_timeout: self.connect_timeout,
            subscribe_ack_timeout: self.subscribe_ack_timeout,
            unsubscribe_grace: self.unsubscribe_grace,
            reconnect_delay: self.reconnect_delay,
            reconnect_max_delay: self.reconnect_max_delay,
            reconnect_jitter: self.reconnect_jitter,
            backoff: self.backoff,
        }
    }

    /// Check the configuration for unusable values
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.poll_batch_size == 0 {
            return invalid("poll_batch_size must be at least 1".into());
        }
        for (name, value) in [
            ("price_poll_interval", self.price_poll_interval),
            ("alert_poll_interval", self.alert_poll_interval),
            ("stale_timeout", self.stale_timeout),
            ("connect_timeout", self.connect_timeout),
            ("subscribe_ack_timeout", self.subscribe_ack_timeout),
            ("pull_timeout", self.pull_timeout),
        ] {
            if value.is_zero() {
                return invalid(format!("{name} must be greater than zero"));
            }
        }
        if !(0.0..=1.0).contains(&self.reconnect_jitter) {
            return invalid(format!(
                "reconnect_jitter must be within 0.0..=1.0, got {}",
                self.reconnect_jitter
            ));
        }
        if self.backoff == BackoffPolicy::Exponential && self.reconnect_max_delay < self.reconnect_delay
        {
            return invalid("reconnect_max_delay must not be below reconnect_delay".into());
        }
        for (name, url, schemes) in [
            ("push_url", &self.push_url, &["ws", "wss"][..]),
            ("alert_url", &self.alert_url, &["ws", "wss"][..]),
            ("pull_base_url", &self.pull_base_url, &["http", "https"][..]),
        ] {
            match reqwest::Url::parse(url) {
                Ok(parsed) if schemes.contains(&parsed.scheme()) => {}
                Ok(parsed) => {
                    return invalid(format!(
                        "{name} has unsupported scheme `{}`",
                        parsed.scheme()
                    ))
                }
                Err(e) => return invalid(format!("{name} is not a valid URL: {e}")),
            }
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/livesync/livesync.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("livesync").join("livesync.toml"))
}

/// Load configuration from the default path, environment and defaults
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if the
/// resulting configuration does not validate.
pub fn load_config() -> Result<LiveSyncConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// A missing file is not an error: defaults and environment are used.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if the resulting
/// configuration does not validate.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<LiveSyncConfig, ConfigError> {
    let mut config = LiveSyncConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: LiveSyncToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, |key| std::env::var(key).ok())?;
    config.validate()?;

    Ok(config)
}

fn parse_backoff(value: &str) -> Result<BackoffPolicy, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "fixed" | "constant" => Ok(BackoffPolicy::Fixed),
        "exponential" | "exp" => Ok(BackoffPolicy::Exponential),
        other => Err(ConfigError::ValidationError(format!(
            "unknown backoff policy `{other}`"
        ))),
    }
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut LiveSyncConfig, toml: &LiveSyncToml) -> Result<(), ConfigError> {
    let ms = Duration::from_millis;

    if let Some(ref url) = toml.endpoints.push_url {
        config.push_url.clone_from(url);
    }
    if let Some(ref url) = toml.endpoints.alert_url {
        config.alert_url.clone_from(url);
    }
    if let Some(ref url) = toml.endpoints.pull_base_url {
        config.pull_base_url.clone_from(url);
    }

    if let Some(cap) = toml.push.max_push_connections {
        config.max_push_connections = cap;
    }
    if let Some(delay) = toml.push.reconnect_delay_ms {
        config.reconnect_delay = ms(delay);
    }
    if let Some(ref policy) = toml.push.backoff {
        config.backoff = parse_backoff(policy)?;
    }
    if let Some(max) = toml.push.reconnect_max_delay_ms {
        config.reconnect_max_delay = ms(max);
    }
    if let Some(jitter) = toml.push.reconnect_jitter {
        config.reconnect_jitter = jitter;
    }
    if let Some(timeout) = toml.push.connect_timeout_ms {
        config.connect_timeout = ms(timeout);
    }
    if let Some(timeout) = toml.push.subscribe_ack_timeout_ms {
        config.subscribe_ack_timeout = ms(timeout);
    }
    if let Some(grace) = toml.push.unsubscribe_grace_ms {
        config.unsubscribe_grace = ms(grace);
    }

    if let Some(interval) = toml.poll.poll_interval_ms {
        config.price_poll_interval = ms(interval);
        config.alert_poll_interval = ms(interval);
    }
    if let Some(interval) = toml.poll.price_poll_interval_ms {
        config.price_poll_interval = ms(interval);
    }
    if let Some(interval) = toml.poll.alert_poll_interval_ms {
        config.alert_poll_interval = ms(interval);
    }
    if let Some(batch) = toml.poll.poll_batch_size {
        config.poll_batch_size = batch;
    }
    if let Some(timeout) = toml.poll.pull_timeout_ms {
        config.pull_timeout = ms(timeout);
    }

    if let Some(timeout) = toml.health.stale_timeout_ms {
        config.stale_timeout = ms(timeout);
    }
    if let Some(timeout) = toml.health.price_stale_timeout_ms {
        config.price_stale_timeout = Some(ms(timeout));
    }
    if let Some(timeout) = toml.health.alert_stale_timeout_ms {
        config.alert_stale_timeout = Some(ms(timeout));
    }

    Ok(())
}

/// Apply environment overrides, reading variables through `lookup`
///
/// Environment variables:
/// - `LIVESYNC_PUSH_URL`, `LIVESYNC_ALERT_URL`, `LIVESYNC_PULL_URL`
/// - `LIVESYNC_MAX_PUSH_CONNECTIONS`
/// - `LIVESYNC_POLL_INTERVAL` (both kinds), `LIVESYNC_PRICE_POLL_INTERVAL`,
///   `LIVESYNC_ALERT_POLL_INTERVAL`
/// - `LIVESYNC_POLL_BATCH_SIZE`
/// - `LIVESYNC_STALE_TIMEOUT`
/// - `LIVESYNC_RECONNECT_DELAY`, `LIVESYNC_BACKOFF`
/// - `LIVESYNC_CONNECT_TIMEOUT`
///
/// Unparseable numbers are ignored with a warning.
fn apply_env_config(
    config: &mut LiveSyncConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    fn number<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
        let parsed = value.trim().parse().ok();
        if parsed.is_none() {
            tracing::warn!(key, value, "Ignoring unparseable environment value");
        }
        parsed
    }

    let mut touched = false;
    let millis = |key: &str, target: &mut Duration| {
        if let Some(ms) = lookup(key).and_then(|v| number::<u64>(key, &v)) {
            *target = Duration::from_millis(ms);
            true
        } else {
            false
        }
    };

    touched |= millis("LIVESYNC_STALE_TIMEOUT", &mut config.stale_timeout);
    touched |= millis("LIVESYNC_RECONNECT_DELAY", &mut config.reconnect_delay);
    touched |= millis("LIVESYNC_CONNECT_TIMEOUT", &mut config.connect_timeout);
    let mut poll_all = Duration::ZERO;
    if millis("LIVESYNC_POLL_INTERVAL", &mut poll_all) {
        config.price_poll_interval = poll_all;
        config.alert_poll_interval = poll_all;
        touched = true;
    }
    touched |= millis("LIVESYNC_PRICE_POLL_INTERVAL", &mut config.price_poll_interval);
    touched |= millis("LIVESYNC_ALERT_POLL_INTERVAL", &mut config.alert_poll_interval);

    if let Some(url) = lookup("LIVESYNC_PUSH_URL") {
        config.push_url = url;
        touched = true;
    }
    if let Some(url) = lookup("LIVESYNC_ALERT_URL") {
        config.alert_url = url;
        touched = true;
    }
    if let Some(url) = lookup("LIVESYNC_PULL_URL") {
        config.pull_base_url = url;
        touched = true;
    }
    if let Some(cap) = lookup("LIVESYNC_MAX_PUSH_CONNECTIONS")
        .and_then(|v| number::<usize>("LIVESYNC_MAX_PUSH_CONNECTIONS", &v))
    {
        config.max_push_connections = cap;
        touched = true;
    }
    if let Some(batch) = lookup("LIVESYNC_POLL_BATCH_SIZE")
        .and_then(|v| number::<usize>("LIVESYNC_POLL_BATCH_SIZE", &v))
    {
        config.poll_batch_size = batch;
        touched = true;
    }
    if let Some(policy) = lookup("LIVESYNC_BACKOFF") {
        config.backoff = parse_backoff(&policy)?;
        touched = true;
    }

    if touched {
        config.source = ConfigSource::Env;
    }
    Ok(())
}
