//! Pull Sources
//!
//! One request per topic per poll. [`HttpPullSource`] talks to the portal's
//! REST API; [`ScriptedPullSource`] answers from a table for tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::auth::{AuthContext, AUTH_USER_HEADER};
use crate::error::PullError;
use crate::push::protocol::{decode_alert, decode_price, ordering_token};
use crate::sample::{Payload, PricePayload, Sample, SampleOrigin};
use crate::topic::{Topic, TopicId, TopicKind};

/// Fetches the current value of a topic
#[async_trait]
pub trait PullSource: Send + Sync {
    /// Fetch one sample for the topic
    ///
    /// The returned sample must carry [`SampleOrigin::Pull`].
    async fn fetch(&self, topic: &Topic) -> Result<Sample, PullError>;
}

/// REST pull source
///
/// - price: `GET {base}/asset/{symbol}`
/// - alerts: `GET {base}/alert` with `X-Auth-User` set to the feed's user;
///   the newest alert in the list becomes the sample
#[derive(Clone)]
pub struct HttpPullSource {
    base_url: String,
    auth: AuthContext,
    http_client: reqwest::Client,
}

impl HttpPullSource {
    /// Create a source with a per-request timeout
    ///
    /// # Errors
    ///
    /// Returns [`PullError::Request`] if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        auth: AuthContext,
        timeout: Duration,
    ) -> Result<Self, PullError> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
            http_client,
        })
    }

    fn price_url(&self, symbol: &str) -> String {
        format!("{}/asset/{symbol}", self.base_url)
    }

    fn alert_url(&self) -> String {
        format!("{}/alert", self.base_url)
    }

    async fn get_json(&self, url: &str, user: Option<&str>) -> Result<Value, PullError> {
        let mut request = self.http_client.get(url);
        for (name, value) in self.auth.headers() {
            if user.is_some() && name == AUTH_USER_HEADER {
                continue;
            }
            request = request.header(name, value);
        }
        if let Some(user) = user {
            request = request.header(AUTH_USER_HEADER, user);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                PullError::Timeout
            } else {
                PullError::Request(e)
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(PullError::Status(status.as_u16()));
        }
        response.json::<Value>().await.map_err(|e| {
            if e.is_timeout() {
                PullError::Timeout
            } else {
                PullError::Decode(e.to_string())
            }
        })
    }

    async fn fetch_price(&self, topic: &Topic) -> Result<Sample, PullError> {
        let body = self.get_json(&self.price_url(topic.id.as_str()), None).await?;
        price_sample(&topic.id, &body)
    }

    async fn fetch_alerts(&self, topic: &Topic) -> Result<Sample, PullError> {
        let user = topic
            .alert_user()
            .ok_or_else(|| PullError::Unsupported(format!("{} has no user", topic.id)))?;
        let body = self.get_json(&self.alert_url(), Some(user)).await?;
        newest_alert_sample(&topic.id, &body)
    }
}

impl std::fmt::Debug for HttpPullSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPullSource")
            .field("base_url", &self.base_url)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PullSource for HttpPullSource {
    async fn fetch(&self, topic: &Topic) -> Result<Sample, PullError> {
        match topic.kind {
            TopicKind::Price => self.fetch_price(topic).await,
            TopicKind::Alert => self.fetch_alerts(topic).await,
        }
    }
}

fn price_sample(topic: &TopicId, body: &Value) -> Result<Sample, PullError> {
    let payload = decode_price(body).map_err(|e| PullError::Decode(e.to_string()))?;
    Ok(Sample::new(
        topic.clone(),
        Payload::Price(payload),
        ordering_token(body),
        SampleOrigin::Pull,
    ))
}

/// Pick the newest alert of a list, by ordering token then id
fn newest_alert_sample(topic: &TopicId, body: &Value) -> Result<Sample, PullError> {
    let items = match body {
        Value::Array(items) => items.as_slice(),
        Value::Object(_) => std::slice::from_ref(body),
        _ => return Err(PullError::Decode("expected a list of alerts".into())),
    };

    let mut newest = None;
    for item in items {
        let (alert, token) = decode_alert(item).map_err(|e| PullError::Decode(e.to_string()))?;
        let key = (token, alert.id);
        let replace = newest
            .as_ref()
            .map_or(true, |(best_key, _, _)| key > *best_key);
        if replace {
            newest = Some((key, alert, token));
        }
    }

    let (_, alert, token) = newest.ok_or(PullError::Empty)?;
    Ok(Sample::new(
        topic.clone(),
        Payload::Alert(alert),
        token,
        SampleOrigin::Pull,
    ))
}

/// Pull source answering from a table
///
/// Topics without an entry fail with [`PullError::Empty`].
#[derive(Debug, Default)]
pub struct ScriptedPullSource {
    responses: DashMap<TopicId, Result<(Payload, Option<u64>), u16>>,
    calls: DashMap<TopicId, u64>,
    total: AtomicU64,
}

impl ScriptedPullSource {
    /// Create an empty source
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer pulls for a topic with this payload and ordering token
    pub fn set_response(&self, topic: impl Into<TopicId>, payload: Payload, seq: Option<u64>) {
        self.responses.insert(topic.into(), Ok((payload, seq)));
    }

    /// Answer pulls for a price topic
    pub fn set_price(&self, topic: impl Into<TopicId>, price: f64, seq: u64) {
        let payload = Payload::Price(PricePayload {
            price,
            change_rate: None,
        });
        self.set_response(topic, payload, Some(seq));
    }

    /// Fail pulls for a topic with HTTP 503
    pub fn fail(&self, topic: impl Into<TopicId>) {
        self.responses.insert(topic.into(), Err(503));
    }

    /// Pulls made for one topic
    #[must_use]
    pub fn calls(&self, topic: &TopicId) -> u64 {
        self.calls.get(topic).map_or(0, |n| *n)
    }

    /// Pulls made overall
    #[must_use]
    pub fn total_calls(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PullSource for ScriptedPullSource {
    async fn fetch(&self, topic: &Topic) -> Result<Sample, PullError> {
        self.total.fetch_add(1, Ordering::SeqCst);
        *self.calls.entry(topic.id.clone()).or_insert(0) += 1;

        let response = self.responses.get(&topic.id).map(|r| r.value().clone());
        match response {
            Some(Ok((payload, seq))) => Ok(Sample::new(
                topic.id.clone(),
                payload,
                seq,
                SampleOrigin::Pull,
            )),
            Some(Err(status)) => Err(PullError::Status(status)),
            None => Err(PullError::Empty),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one HTTP response and hand back the raw request
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            request
        });
        (base, server)
    }

    #[tokio::test]
    async fn test_http_price_pull() {
        let (base, server) = serve_once("200 OK", r#"{"price":"70,100","changeRate":1.5,"timestamp":42}"#).await;
        let source = HttpPullSource::new(
            base,
            AuthContext::new("Bearer abc", "me@example.com"),
            Duration::from_secs(2),
        )
        .unwrap();

        let result = source.fetch(&Topic::price("005930")).await;
        let request = server.await.unwrap().to_lowercase();
        assert!(request.starts_with("get /asset/005930 "));
        assert!(request.contains("authorization: bearer abc"));
        assert!(request.contains("x-auth-user: me@example.com"));

        // "70,100" is not a number; the body is rejected as undecodable
        assert!(matches!(result, Err(PullError::Decode(_))));
    }

    #[tokio::test]
    async fn test_http_price_pull_decodes() {
        let (base, _server) = serve_once("200 OK", r#"{"price":70100,"changeRate":"1.5","timestamp":42}"#).await;
        let source = HttpPullSource::new(base, AuthContext::anonymous(), Duration::from_secs(2)).unwrap();

        let sample = source.fetch(&Topic::price("005930")).await.unwrap();
        assert_eq!(sample.origin, SampleOrigin::Pull);
        assert_eq!(sample.source_seq, Some(42));
        assert_eq!(sample.price().unwrap().price, 70100.0);
        assert_eq!(sample.price().unwrap().change_rate, Some(1.5));
    }

    #[tokio::test]
    async fn test_http_status_error() {
        let (base, _server) = serve_once("503 Service Unavailable", "{}").await;
        let source = HttpPullSource::new(base, AuthContext::anonymous(), Duration::from_secs(2)).unwrap();
        let result = source.fetch(&Topic::price("AAPL")).await;
        assert!(matches!(result, Err(PullError::Status(503))));
    }

    #[tokio::test]
    async fn test_http_alert_pull_uses_feed_user() {
        let (base, server) = serve_once(
            "200 OK",
            r#"[{"id":1,"symbol":"A","createdAt":"2024-01-01T00:00:00"},{"id":2,"symbol":"B","createdAt":"2024-01-02T00:00:00"}]"#,
        )
        .await;
        let source = HttpPullSource::new(
            base,
            AuthContext::new("t", "someone-else@example.com"),
            Duration::from_secs(2),
        )
        .unwrap();

        let sample = source.fetch(&Topic::alerts("me@example.com")).await.unwrap();
        let request = server.await.unwrap().to_lowercase();
        assert!(request.starts_with("get /alert "));
        assert!(request.contains("x-auth-user: me@example.com"));
        assert!(!request.contains("someone-else"));
        assert_eq!(sample.alert().unwrap().symbol, "B");
    }

    #[test]
    fn test_newest_alert_breaks_ties_by_id() {
        let body: Value = serde_json::from_str(
            r#"[{"id":3,"symbol":"A","timestamp":5},{"id":9,"symbol":"B","timestamp":5},{"id":4,"symbol":"C","timestamp":1}]"#,
        )
        .unwrap();
        let sample = newest_alert_sample(&TopicId::new("alert:me"), &body).unwrap();
        assert_eq!(sample.alert().unwrap().symbol, "B");
        assert_eq!(sample.source_seq, Some(5));
    }

    #[test]
    fn test_empty_alert_list() {
        let body: Value = serde_json::from_str("[]").unwrap();
        assert!(matches!(
            newest_alert_sample(&TopicId::new("alert:me"), &body),
            Err(PullError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_scripted_source() {
        let source = ScriptedPullSource::new();
        let topic = Topic::price("A");
        assert!(matches!(source.fetch(&topic).await, Err(PullError::Empty)));

        source.set_price("A", 10.0, 3);
        let sample = source.fetch(&topic).await.unwrap();
        assert_eq!(sample.source_seq, Some(3));

        source.fail("A");
        assert!(matches!(source.fetch(&topic).await, Err(PullError::Status(503))));
        assert_eq!(source.calls(&topic.id), 3);
        assert_eq!(source.total_calls(), 3);
    }
}
