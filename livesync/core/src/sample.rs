//! Samples - Single Updates for a Topic
//!
//! A [`Sample`] is one update from either delivery path. Samples are ordered
//! per topic by an [`OrderingToken`]: the server-assigned sequence (or epoch
//! timestamp) when present, otherwise the monotonic receipt time.

use std::cmp::Ordering;
use std::time::Instant;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::topic::TopicId;

/// Price update for an asset symbol
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricePayload {
    /// Last traded price
    pub price: f64,
    /// Change rate against the previous close, in percent
    #[serde(default)]
    pub change_rate: Option<f64>,
}

/// Direction of a target-price alert
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertCondition {
    /// Fires when the price rises to or above the target
    Above,
    /// Fires when the price falls to or below the target
    Below,
}

/// A triggered target-price alert
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPayload {
    /// Server-side alert id
    #[serde(default)]
    pub id: Option<i64>,
    /// Symbol the alert was set on
    pub symbol: String,
    /// Target price the user configured
    #[serde(default)]
    pub target_price: Option<f64>,
    /// Price at which the alert fired
    #[serde(default)]
    pub triggered_price: Option<f64>,
    /// Alert direction
    #[serde(default)]
    pub condition: Option<AlertCondition>,
    /// Free-form message from the server
    #[serde(default)]
    pub message: Option<String>,
}

/// Body of a sample
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Payload {
    /// Price topic update
    Price(PricePayload),
    /// Alert topic update
    Alert(AlertPayload),
}

/// Which delivery path produced a sample
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleOrigin {
    /// Persistent push channel
    Push,
    /// Fallback poll
    Pull,
}

/// Ordering token used for monotonic acceptance
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderingToken {
    /// Server-assigned sequence or epoch-millisecond timestamp
    Seq(u64),
    /// Local monotonic receipt time
    Observed(Instant),
}

/// One update for a topic
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// Topic this sample belongs to
    pub topic: TopicId,
    /// Update body
    pub payload: Payload,
    /// Monotonic receipt time
    pub observed_at: Instant,
    /// Optional server ordering token
    pub source_seq: Option<u64>,
    /// Delivery path
    pub origin: SampleOrigin,
}

impl Sample {
    /// Create a sample observed now
    #[must_use]
    pub fn new(
        topic: TopicId,
        payload: Payload,
        source_seq: Option<u64>,
        origin: SampleOrigin,
    ) -> Self {
        Self {
            topic,
            payload,
            observed_at: Instant::now(),
            source_seq,
            origin,
        }
    }

    /// Ordering token of this sample
    #[must_use]
    pub fn token(&self) -> OrderingToken {
        match self.source_seq {
            Some(seq) => OrderingToken::Seq(seq),
            None => OrderingToken::Observed(self.observed_at),
        }
    }

    /// Compare ordering against another sample of the same topic
    ///
    /// Server tokens are compared when both samples carry one; otherwise the
    /// receipt times decide.
    #[must_use]
    pub fn order_against(&self, other: &Sample) -> Ordering {
        match (self.token(), other.token()) {
            (OrderingToken::Seq(a), OrderingToken::Seq(b)) => a.cmp(&b),
            _ => self.observed_at.cmp(&other.observed_at),
        }
    }

    /// Whether this sample is strictly older than `current`
    #[must_use]
    pub fn is_older_than(&self, current: &Sample) -> bool {
        self.order_against(current) == Ordering::Less
    }

    /// Price body, if this is a price sample
    #[must_use]
    pub fn price(&self) -> Option<&PricePayload> {
        match &self.payload {
            Payload::Price(p) => Some(p),
            Payload::Alert(_) => None,
        }
    }

    /// Alert body, if this is an alert sample
    #[must_use]
    pub fn alert(&self) -> Option<&AlertPayload> {
        match &self.payload {
            Payload::Alert(a) => Some(a),
            Payload::Price(_) => None,
        }
    }
}

/// Parse a wire timestamp into an epoch-millisecond ordering token
///
/// Accepts integer sequences/epoch values, numeric strings, RFC 3339 strings
/// and naive `YYYY-MM-DDTHH:MM:SS[.fff]` strings (taken as UTC).
#[must_use]
pub fn parse_timestamp(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        serde_json::Value::String(s) => {
            let s = s.trim();
            if let Ok(n) = s.parse::<u64>() {
                return Some(n);
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return u64::try_from(dt.timestamp_millis()).ok();
            }
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
                .and_then(|dt: DateTime<Utc>| u64::try_from(dt.timestamp_millis()).ok())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn price_sample(seq: Option<u64>) -> Sample {
        Sample::new(
            TopicId::new("AAPL"),
            Payload::Price(PricePayload {
                price: 100.0,
                change_rate: Some(0.5),
            }),
            seq,
            SampleOrigin::Push,
        )
    }

    #[test]
    fn test_sequence_ordering() {
        let newer = price_sample(Some(5));
        let older = price_sample(Some(3));
        assert!(older.is_older_than(&newer));
        assert!(!newer.is_older_than(&older));
        // Equal tokens are not older
        assert!(!price_sample(Some(5)).is_older_than(&newer));
    }

    #[test]
    fn test_observed_time_fallback() {
        let first = price_sample(None);
        let mut second = price_sample(None);
        second.observed_at = first.observed_at + Duration::from_millis(5);
        assert!(first.is_older_than(&second));

        // Mixed: only one side carries a sequence, receipt time decides
        let mut seq_sample = price_sample(Some(1_000));
        seq_sample.observed_at = first.observed_at + Duration::from_millis(10);
        assert!(first.is_older_than(&seq_sample));
    }

    #[test]
    fn test_token() {
        assert_eq!(price_sample(Some(7)).token(), OrderingToken::Seq(7));
        assert!(matches!(price_sample(None).token(), OrderingToken::Observed(_)));
    }

    #[test]
    fn test_parse_timestamp_variants() {
        assert_eq!(parse_timestamp(&serde_json::json!(1_700_000_000_000u64)), Some(1_700_000_000_000));
        assert_eq!(parse_timestamp(&serde_json::json!("42")), Some(42));
        assert_eq!(
            parse_timestamp(&serde_json::json!("1970-01-01T00:00:01Z")),
            Some(1_000)
        );
        assert_eq!(
            parse_timestamp(&serde_json::json!("1970-01-01T00:00:02.500")),
            Some(2_500)
        );
        assert_eq!(parse_timestamp(&serde_json::json!("yesterday")), None);
        assert_eq!(parse_timestamp(&serde_json::json!(null)), None);
    }

    #[test]
    fn test_alert_payload_wire_shape() {
        let alert: AlertPayload = serde_json::from_value(serde_json::json!({
            "id": 12,
            "symbol": "005930",
            "targetPrice": 70000.0,
            "triggeredPrice": 70100.0,
            "condition": "ABOVE"
        }))
        .unwrap();
        assert_eq!(alert.id, Some(12));
        assert_eq!(alert.condition, Some(AlertCondition::Above));
        assert!(alert.message.is_none());
    }
}
