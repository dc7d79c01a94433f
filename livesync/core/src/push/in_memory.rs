//! In-Memory Push Connector
//!
//! Drives the push channels without a network. Every successful connect
//! hands an [`InMemoryPeer`] to whoever holds the connector, which can then
//! read the client's control frames and script the server side.
//!
//! # Example
//!
//! ```ignore
//! let connector = InMemoryConnector::new();
//! connector.set_auto_ack(true);
//! let sync = LiveSync::new(config, auth, Arc::new(connector.clone()), pull_source)?;
//! let session = sync.attach(vec![Topic::price("005930")]).await?;
//!
//! let peer = connector.next_peer().await.unwrap();
//! peer.send_price("005930", 70_100.0, 1);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::protocol::ClientFrame;
use super::transport::{ConnectRequest, PushConnector, PushLink};
use crate::error::TransportError;

#[derive(Debug)]
enum Inbound {
    Frame(String),
    Close,
}

#[derive(Debug, Default)]
struct ConnectorState {
    reject_auth: AtomicBool,
    refuse: AtomicBool,
    fail_next: AtomicUsize,
    auto_ack: AtomicBool,
    connects: AtomicU64,
    requests: Mutex<Vec<String>>,
}

/// Connector producing in-process links
#[derive(Clone)]
pub struct InMemoryConnector {
    state: Arc<ConnectorState>,
    peer_tx: mpsc::UnboundedSender<InMemoryPeer>,
    peer_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<InMemoryPeer>>>,
}

impl Default for InMemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryConnector {
    /// Create a connector accepting every connect
    #[must_use]
    pub fn new() -> Self {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(ConnectorState::default()),
            peer_tx,
            peer_rx: Arc::new(tokio::sync::Mutex::new(peer_rx)),
        }
    }

    /// Reject every connect with an authentication failure
    pub fn set_reject_auth(&self, reject: bool) {
        self.state.reject_auth.store(reject, Ordering::SeqCst);
    }

    /// Refuse every connect with a connection failure
    pub fn set_refuse(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Fail the next `count` connects with a connection failure
    pub fn fail_next(&self, count: usize) {
        self.state.fail_next.store(count, Ordering::SeqCst);
    }

    /// Acknowledge subscribe frames automatically
    pub fn set_auto_ack(&self, auto_ack: bool) {
        self.state.auto_ack.store(auto_ack, Ordering::SeqCst);
    }

    /// Number of connect attempts so far
    #[must_use]
    pub fn connect_count(&self) -> u64 {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// URLs of every connect attempt, in order
    #[must_use]
    pub fn requested_urls(&self) -> Vec<String> {
        self.state.requests.lock().clone()
    }

    /// Wait for the next accepted connection
    ///
    /// Returns `None` only if the connector has been dropped everywhere else.
    pub async fn next_peer(&self) -> Option<InMemoryPeer> {
        self.peer_rx.lock().await.recv().await
    }

    /// Take an already-accepted connection without waiting
    pub fn try_next_peer(&self) -> Option<InMemoryPeer> {
        self.peer_rx.try_lock().ok()?.try_recv().ok()
    }
}

impl std::fmt::Debug for InMemoryConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryConnector")
            .field("connects", &self.connect_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PushConnector for InMemoryConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn PushLink>, TransportError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        self.state.requests.lock().push(request.url.clone());

        if self.state.reject_auth.load(Ordering::SeqCst) {
            return Err(TransportError::AuthenticationFailed(
                "handshake rejected with HTTP 401".into(),
            ));
        }
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed("connection refused".into()));
        }
        let fail = self
            .state
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(TransportError::ConnectionFailed("scripted failure".into()));
        }

        let (to_client, from_server) = mpsc::unbounded_channel();
        let (to_server, from_client) = mpsc::unbounded_channel();
        let peer = InMemoryPeer {
            request: request.clone(),
            to_client: to_client.clone(),
            from_client,
        };
        self.peer_tx
            .send(peer)
            .map_err(|_| TransportError::ConnectionFailed("connector shut down".into()))?;

        Ok(Box::new(InMemoryLink {
            inbound: from_server,
            loopback: to_client,
            outbound: Some(to_server),
            auto_ack: Arc::clone(&self.state),
        }))
    }
}

/// Client side of an in-memory link
struct InMemoryLink {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    loopback: mpsc::UnboundedSender<Inbound>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    auto_ack: Arc<ConnectorState>,
}

#[async_trait]
impl PushLink for InMemoryLink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        let outbound = self.outbound.as_ref().ok_or(TransportError::ConnectionClosed)?;
        let is_subscribe = self.auto_ack.auto_ack.load(Ordering::SeqCst)
            && serde_json::from_str::<serde_json::Value>(&text)
                .is_ok_and(|v| v.get("type").and_then(|t| t.as_str()) == Some("subscribe"));

        outbound
            .send(text)
            .map_err(|_| TransportError::SendFailed("peer gone".into()))?;

        if is_subscribe {
            let _ = self.loopback.send(Inbound::Frame(
                r#"{"status":"success","message":"subscribed"}"#.to_string(),
            ));
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<String, TransportError> {
        match self.inbound.recv().await {
            Some(Inbound::Frame(text)) => Ok(text),
            Some(Inbound::Close) | None => Err(TransportError::ConnectionClosed),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.outbound = None;
        Ok(())
    }
}

/// Server side of an in-memory link
///
/// Dropping the peer closes the connection from the server side.
#[derive(Debug)]
pub struct InMemoryPeer {
    request: ConnectRequest,
    to_client: mpsc::UnboundedSender<Inbound>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl InMemoryPeer {
    /// The URL the client connected to
    #[must_use]
    pub fn url(&self) -> &str {
        &self.request.url
    }

    /// The connect request, including credentials
    #[must_use]
    pub fn request(&self) -> &ConnectRequest {
        &self.request
    }

    /// Send a raw text frame to the client
    ///
    /// Returns false if the client side is gone.
    pub fn send(&self, text: impl Into<String>) -> bool {
        self.to_client.send(Inbound::Frame(text.into())).is_ok()
    }

    /// Send a price update in the generic dialect
    pub fn send_price(&self, topic: &str, price: f64, seq: u64) -> bool {
        self.send(
            serde_json::json!({
                "type": "update",
                "topic": topic,
                "payload": { "price": price, "changeRate": 0.0 },
                "timestamp": seq,
            })
            .to_string(),
        )
    }

    /// Acknowledge the oldest outstanding control frame
    pub fn ack(&self) -> bool {
        self.send(r#"{"status":"success","message":"subscribed"}"#)
    }

    /// Refuse the oldest outstanding control frame
    pub fn ack_error(&self, message: &str) -> bool {
        self.send(serde_json::json!({ "status": "error", "message": message }).to_string())
    }

    /// Wait for the next frame the client sent
    ///
    /// Returns `None` once the client closed the link.
    pub async fn recv_frame(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Take a frame the client already sent
    pub fn try_recv_frame(&mut self) -> Option<String> {
        self.from_client.try_recv().ok()
    }

    /// Wait for the next control frame, skipping anything unparseable
    pub async fn recv_control(&mut self) -> Option<ClientFrame> {
        while let Some(text) = self.recv_frame().await {
            let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
                continue;
            };
            let topic = value
                .get("topic")
                .and_then(|t| t.as_str())
                .map(crate::topic::TopicId::new);
            match (value.get("type").and_then(|t| t.as_str()), topic) {
                (Some("subscribe"), Some(t)) => return Some(ClientFrame::Subscribe(t)),
                (Some("unsubscribe"), Some(t)) => return Some(ClientFrame::Unsubscribe(t)),
                _ => {}
            }
        }
        None
    }

    /// Wait until the client closes the link, discarding frames
    pub async fn closed(&mut self) {
        while self.from_client.recv().await.is_some() {}
    }

    /// Drop the connection from the server side
    pub fn disconnect(self) {
        drop(self);
    }
}

impl Drop for InMemoryPeer {
    fn drop(&mut self) {
        let _ = self.to_client.send(Inbound::Close);
    }
}
