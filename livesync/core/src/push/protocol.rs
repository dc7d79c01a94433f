//! Push Wire Protocol
//!
//! Client frames are JSON objects carrying both `topic` and `symbol` so either
//! server dialect can read them:
//!
//! ```text
//! {"type":"subscribe","topic":"005930","symbol":"005930"}
//! {"type":"unsubscribe","topic":"005930","symbol":"005930"}
//! ```
//!
//! Server frames on the shared price channel:
//!
//! ```text
//! {"type":"update","topic":"005930","payload":{"price":70100,"changeRate":0.4},"timestamp":1700000000000}
//! {"type":"price_update","symbol":"005930","price":70100,"changeRate":0.4,"timestamp":"2024-03-01T09:00:00"}
//! {"status":"success","message":"subscribed"}
//! {"status":"error","message":"unknown symbol"}
//! ```
//!
//! Alert channels carry bare alert objects, one per frame.

use serde::Serialize;
use serde_json::Value;

use crate::error::ProtocolError;
use crate::sample::{parse_timestamp, AlertPayload, PricePayload};
use crate::topic::TopicId;

/// Frame sent from client to server
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientFrame {
    /// Start receiving updates for a topic
    Subscribe(TopicId),
    /// Stop receiving updates for a topic
    Unsubscribe(TopicId),
}

#[derive(Serialize)]
struct ControlFrame<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    topic: &'a str,
    symbol: &'a str,
}

impl ClientFrame {
    /// Topic the frame refers to
    #[must_use]
    pub fn topic(&self) -> &TopicId {
        match self {
            Self::Subscribe(t) | Self::Unsubscribe(t) => t,
        }
    }

    /// Encode as a JSON text frame
    #[must_use]
    pub fn encode(&self) -> String {
        let (kind, topic) = match self {
            Self::Subscribe(t) => ("subscribe", t),
            Self::Unsubscribe(t) => ("unsubscribe", t),
        };
        let frame = ControlFrame {
            kind,
            topic: topic.as_str(),
            symbol: topic.as_str(),
        };
        // Serializing a struct of string slices cannot fail
        serde_json::to_string(&frame).unwrap_or_default()
    }
}

/// Outcome carried by an acknowledgement frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckStatus {
    /// Request accepted
    Success,
    /// Request refused
    Error,
}

/// Frame received from the server on the shared channel
#[derive(Clone, Debug, PartialEq)]
pub enum ServerFrame {
    /// Price update for a topic
    Update {
        /// Topic the update belongs to
        topic: TopicId,
        /// Update body
        payload: PricePayload,
        /// Server ordering token, if any
        seq: Option<u64>,
    },
    /// Acknowledgement of a control frame
    Ack {
        /// Accepted or refused
        status: AckStatus,
        /// Human-readable message
        message: String,
        /// Topic named by the ack, if any
        topic: Option<TopicId>,
    },
    /// Keep-alive or informational frame
    Ignored,
}

impl ServerFrame {
    /// Parse a text frame from the shared price channel
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] for non-JSON text, unknown frame types, or
    /// frames missing required fields.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let Value::Object(ref obj) = value else {
            return Err(ProtocolError::Malformed("frame is not an object".into()));
        };

        if let Some(status) = obj.get("status").and_then(Value::as_str) {
            let status = match status.to_ascii_lowercase().as_str() {
                "success" | "ok" => AckStatus::Success,
                "error" | "fail" | "failure" => AckStatus::Error,
                other => return Err(ProtocolError::UnexpectedType(format!("status:{other}"))),
            };
            return Ok(Self::Ack {
                status,
                message: obj
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                topic: topic_field(&value),
            });
        }

        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingField("type"))?;
        match kind {
            "update" => {
                let topic = topic_field(&value).ok_or(ProtocolError::MissingField("topic"))?;
                let body = obj.get("payload").ok_or(ProtocolError::MissingField("payload"))?;
                Ok(Self::Update {
                    topic,
                    payload: decode_price(body)?,
                    seq: ordering_token(&value),
                })
            }
            "price_update" => {
                let topic = topic_field(&value).ok_or(ProtocolError::MissingField("symbol"))?;
                Ok(Self::Update {
                    topic,
                    payload: decode_price(&value)?,
                    seq: ordering_token(&value),
                })
            }
            "ping" | "pong" | "heartbeat" | "welcome" | "info" => Ok(Self::Ignored),
            other => Err(ProtocolError::UnexpectedType(other.to_string())),
        }
    }
}

/// Parse a frame from a dedicated alert channel
///
/// # Errors
///
/// Returns [`ProtocolError`] for non-JSON text or objects without a symbol.
pub fn parse_alert(text: &str) -> Result<(AlertPayload, Option<u64>), ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    decode_alert(&value)
}

/// `topic` or `symbol`, whichever the frame carries
fn topic_field(value: &Value) -> Option<TopicId> {
    value
        .get("topic")
        .or_else(|| value.get("symbol"))
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(TopicId::new)
}

/// `seq` when present, otherwise `timestamp`
pub(crate) fn ordering_token(value: &Value) -> Option<u64> {
    value
        .get("seq")
        .and_then(parse_timestamp)
        .or_else(|| value.get("timestamp").and_then(parse_timestamp))
}

/// Number or numeric string
fn lenient_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').parse().ok(),
        _ => None,
    }
}

/// Decode a price body (`{price, changeRate}`)
pub(crate) fn decode_price(value: &Value) -> Result<PricePayload, ProtocolError> {
    let price = value
        .get("price")
        .and_then(lenient_f64)
        .ok_or(ProtocolError::MissingField("price"))?;
    Ok(PricePayload {
        price,
        change_rate: value.get("changeRate").and_then(lenient_f64),
    })
}

/// Decode an alert object, returning it with its ordering token
pub(crate) fn decode_alert(value: &Value) -> Result<(AlertPayload, Option<u64>), ProtocolError> {
    if !value.is_object() {
        return Err(ProtocolError::Malformed("alert is not an object".into()));
    }
    if value.get("symbol").and_then(Value::as_str).is_none() {
        return Err(ProtocolError::MissingField("symbol"));
    }
    let alert: AlertPayload = serde_json::from_value(value.clone())
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let token = ordering_token(value).or_else(|| {
        value
            .get("triggeredAt")
            .or_else(|| value.get("createdAt"))
            .and_then(parse_timestamp)
    });
    Ok((alert, token))
}
