//! Topics - Independently Tracked Live-Data Streams
//!
//! A topic is either the price of one asset symbol or one user's alert feed.
//! Topics are plain values; their runtime state lives in the
//! [`TopicRegistry`](crate::registry::TopicRegistry).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix used for alert topic ids
const ALERT_PREFIX: &str = "alert:";

/// Identifier of one live-data stream
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicId(String);

impl TopicId {
    /// Create a topic id from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is empty (rejected on attach)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TopicId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TopicId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// What kind of data a topic carries
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicKind {
    /// Price and change rate of an asset symbol
    Price,
    /// Triggered target-price alerts for a user
    Alert,
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Price => write!(f, "price"),
            Self::Alert => write!(f, "alert"),
        }
    }
}

/// How a topic receives its data, decided once at admission
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionMode {
    /// Holds a push slot within the connection budget
    Push,
    /// Admitted beyond the budget; served by polling only
    Pull,
    /// Not admitted
    #[default]
    None,
}

/// Market an asset symbol belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    /// Six-digit domestic stock code
    Domestic,
    /// Ticker of a foreign stock
    Overseas,
    /// Quote-base crypto pair such as `KRW-BTC`
    Crypto,
}

impl AssetClass {
    /// Classify a symbol the way the exchange lists it
    #[must_use]
    pub fn classify(symbol: &str) -> Self {
        if symbol.len() == 6 && symbol.bytes().all(|b| b.is_ascii_digit()) {
            Self::Domestic
        } else if symbol.contains('-') {
            Self::Crypto
        } else {
            Self::Overseas
        }
    }
}

/// One live-data stream a consumer is interested in
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic {
    /// Stream identifier
    pub id: TopicId,
    /// Kind of data carried
    pub kind: TopicKind,
    /// User whose alert feed this is (alert topics only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl Topic {
    /// Price topic for an asset symbol
    pub fn price(symbol: impl Into<String>) -> Self {
        Self {
            id: TopicId::new(symbol),
            kind: TopicKind::Price,
            user: None,
        }
    }

    /// Alert feed topic for a user
    pub fn alerts(user: impl Into<String>) -> Self {
        let user = user.into();
        Self {
            id: TopicId::new(format!("{ALERT_PREFIX}{user}")),
            kind: TopicKind::Alert,
            user: Some(user),
        }
    }

    /// Asset class for price topics
    #[must_use]
    pub fn asset_class(&self) -> Option<AssetClass> {
        match self.kind {
            TopicKind::Price => Some(AssetClass::classify(self.id.as_str())),
            TopicKind::Alert => None,
        }
    }

    /// The user owning an alert topic
    ///
    /// Falls back to the id suffix when the topic was built by hand.
    #[must_use]
    pub fn alert_user(&self) -> Option<&str> {
        if self.kind != TopicKind::Alert {
            return None;
        }
        self.user
            .as_deref()
            .or_else(|| self.id.as_str().strip_prefix(ALERT_PREFIX))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}
