//! Error Taxonomy
//!
//! - [`TransportError`]: push channel dropped or never opened. Recovered by
//!   the reconnect path.
//! - [`ProtocolError`]: malformed or unexpected frame. Logged and dropped.
//! - [`AuthError`]: credentials rejected. Fatal for the channel, surfaced.
//! - [`PullError`]: one poll request failed. Logged, siblings unaffected.
//! - [`SyncError`]: what actually reaches a consumer.
//!
//! Running out of push slots is not an error: such topics are admitted
//! pull-only.

use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;

/// Errors raised by a push transport
#[derive(Debug)]
pub enum TransportError {
    /// Connecting to the push endpoint failed
    ConnectionFailed(String),
    /// Connecting took longer than the configured timeout
    ConnectTimeout,
    /// The peer closed the connection
    ConnectionClosed,
    /// Writing a frame failed
    SendFailed(String),
    /// Reading a frame failed
    ReceiveFailed(String),
    /// The endpoint rejected our credentials during the handshake
    AuthenticationFailed(String),
    /// IO error from the underlying socket
    IoError(std::io::Error),
}

impl TransportError {
    /// Whether this failure must not be retried
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthenticationFailed(_))
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {msg}"),
            Self::ConnectTimeout => write!(f, "Connect timed out"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::SendFailed(msg) => write!(f, "Send failed: {msg}"),
            Self::ReceiveFailed(msg) => write!(f, "Receive failed: {msg}"),
            Self::AuthenticationFailed(msg) => write!(f, "Authentication failed: {msg}"),
            Self::IoError(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err)
    }
}

/// A push frame that could not be understood
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Frame is not valid JSON
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// Frame is JSON but a required field is missing or mistyped
    #[error("frame missing field `{0}`")]
    MissingField(&'static str),
    /// Frame type is not one we handle
    #[error("unexpected frame type `{0}`")]
    UnexpectedType(String),
}

/// Credentials rejected by the backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("authentication rejected on {channel}: {reason}")]
pub struct AuthError {
    /// Channel the rejection happened on
    pub channel: String,
    /// Reason given by the server or transport
    pub reason: String,
}

/// A single failed poll request
#[derive(Debug, Error)]
pub enum PullError {
    /// Request could not be sent or the body could not be read
    #[error("pull request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// Server answered with a non-success status
    #[error("pull endpoint returned HTTP {0}")]
    Status(u16),
    /// Body did not have the expected shape
    #[error("pull response could not be decoded: {0}")]
    Decode(String),
    /// Request exceeded the pull timeout
    #[error("pull request timed out")]
    Timeout,
    /// Endpoint has nothing for this topic yet
    #[error("no data available")]
    Empty,
    /// Topic cannot be pulled by this source
    #[error("topic cannot be pulled: {0}")]
    Unsupported(String),
}

/// Errors surfaced to consumers of the live-sync service
#[derive(Debug, Error)]
pub enum SyncError {
    /// Push credentials were rejected
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// Configuration could not be loaded or is invalid
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A topic id was empty or otherwise unusable
    #[error("invalid topic: {0}")]
    InvalidTopic(String),
    /// The session was already detached
    #[error("session is closed")]
    SessionClosed,
    /// Releasing session resources did not complete cleanly
    #[error("teardown failed: {0}")]
    Teardown(String),
    /// A client could not be constructed
    #[error("failed to build client: {0}")]
    Client(String),
}
