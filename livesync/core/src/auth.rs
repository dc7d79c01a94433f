//! Authentication Context
//!
//! Credentials are handed to the service once, at construction, instead of
//! being read from ambient storage at every call site. Both the push
//! handshake and every pull request carry them.

use serde::{Deserialize, Serialize};

/// Header carrying the authenticated user's identity
pub const AUTH_USER_HEADER: &str = "X-Auth-User";

/// Credentials for the market-data backend
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AuthContext {
    /// Access token, sent verbatim as the `Authorization` header
    pub access_token: Option<String>,
    /// Authenticated user (e-mail), sent as `X-Auth-User`
    pub auth_user: Option<String>,
}

impl AuthContext {
    /// Context without credentials (public price data only)
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Context with a token and user
    pub fn new(access_token: impl Into<String>, auth_user: impl Into<String>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            auth_user: Some(auth_user.into()),
        }
    }

    /// Load credentials from the environment
    ///
    /// Environment variables:
    /// - `LIVESYNC_ACCESS_TOKEN`: access token
    /// - `LIVESYNC_AUTH_USER`: user e-mail
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            access_token: std::env::var("LIVESYNC_ACCESS_TOKEN")
                .ok()
                .filter(|v| !v.is_empty()),
            auth_user: std::env::var("LIVESYNC_AUTH_USER")
                .ok()
                .filter(|v| !v.is_empty()),
        }
    }

    /// Whether any credential is present
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some() || self.auth_user.is_some()
    }

    /// Header pairs to attach to outgoing requests
    #[must_use]
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::with_capacity(2);
        if let Some(ref token) = self.access_token {
            headers.push(("Authorization", token.clone()));
        }
        if let Some(ref user) = self.auth_user {
            headers.push((AUTH_USER_HEADER, user.clone()));
        }
        headers
    }
}

// Never print the token
impl std::fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthContext")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("auth_user", &self.auth_user)
            .finish()
    }
}
