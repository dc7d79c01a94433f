//! WebSocket Push Connector
//!
//! `tokio-tungstenite` client. Credentials from the [`ConnectRequest`] are
//! sent as handshake headers; a 401/403 handshake response is reported as
//! an authentication failure.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::transport::{ConnectRequest, PushConnector, PushLink};
use crate::error::TransportError;

/// Connector opening WebSocket links
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a connector
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PushConnector for WebSocketConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn PushLink>, TransportError> {
        let mut ws_request = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConnectionFailed(format!("invalid request: {e}")))?;

        for (name, value) in request.auth.headers() {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::ConnectionFailed(format!("invalid header {name}: {e}")))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| TransportError::ConnectionFailed(format!("invalid {name} header: {e}")))?;
            ws_request.headers_mut().insert(header, value);
        }

        match tokio_tungstenite::connect_async(ws_request).await {
            Ok((stream, _response)) => {
                tracing::debug!(url = %request.url, "WebSocket connected");
                Ok(Box::new(WebSocketLink { stream }))
            }
            Err(WsError::Http(response)) => {
                let status = response.status().as_u16();
                match status {
                    401 | 403 => Err(TransportError::AuthenticationFailed(format!(
                        "handshake rejected with HTTP {status}"
                    ))),
                    code => Err(TransportError::ConnectionFailed(format!(
                        "handshake rejected with HTTP {code}"
                    ))),
                }
            }
            Err(WsError::Io(e)) => Err(TransportError::IoError(e)),
            Err(e) => Err(TransportError::ConnectionFailed(e.to_string())),
        }
    }
}

/// Open WebSocket link
pub struct WebSocketLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushLink for WebSocketLink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&mut self) -> Result<String, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return Ok(text),
                    Err(_) => {
                        tracing::debug!("Dropping non-UTF-8 binary frame");
                    }
                },
                Some(Ok(Message::Ping(payload))) => {
                    let _ = self.stream.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(?frame, "WebSocket closed by peer");
                    return Err(TransportError::ConnectionClosed);
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    return Err(TransportError::ConnectionClosed);
                }
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::SendFailed(e.to_string())),
        }
    }
}
