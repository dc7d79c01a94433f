//! Push Transport Traits
//!
//! Two traits separate the channel logic from the socket:
//! - `PushConnector`: opens links (one per connect attempt)
//! - `PushLink`: one open, bidirectional text-frame link
//!
//! The WebSocket connector is the production implementation; the in-memory
//! connector drives the same channel logic in tests.

use std::fmt;

use async_trait::async_trait;

use crate::auth::AuthContext;
use crate::error::TransportError;

/// Parameters for one connect attempt
#[derive(Clone)]
pub struct ConnectRequest {
    /// Endpoint URL
    pub url: String,
    /// Credentials sent with the handshake
    pub auth: AuthContext,
}

impl ConnectRequest {
    /// Create a connect request
    pub fn new(url: impl Into<String>, auth: AuthContext) -> Self {
        Self {
            url: url.into(),
            auth,
        }
    }
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("url", &self.url)
            .field("auth", &self.auth)
            .finish()
    }
}

/// Opens push links
#[async_trait]
pub trait PushConnector: Send + Sync {
    /// Open a link to the endpoint
    ///
    /// Rejected credentials must be reported as
    /// [`TransportError::AuthenticationFailed`] so the channel does not retry.
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn PushLink>, TransportError>;
}

/// One open push link carrying text frames
#[async_trait]
pub trait PushLink: Send {
    /// Send a text frame
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Receive the next text frame
    ///
    /// Must be cancel-safe: dropping the future loses no frame. Returns
    /// [`TransportError::ConnectionClosed`] once the peer has gone.
    async fn recv(&mut self) -> Result<String, TransportError>;

    /// Close the link
    async fn close(&mut self) -> Result<(), TransportError>;
}
