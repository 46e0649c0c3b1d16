//! WebSocket transport built on `tokio-tungstenite`.
//!
//! Text and binary WebSocket messages map one-to-one onto [`Frame`]s.
//! WebSocket-level ping/pong is handled by tungstenite and never surfaces;
//! the Pulsewire keepalive runs on top as protocol control frames.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use crate::error::PulsewireError;
use crate::transport::{Connector, Frame, Transport};

/// Underlying WebSocket stream type.
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Default time allowed for the TCP + WebSocket handshake.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A [`Transport`] backed by a WebSocket connection.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) is cancel-safe: dropping its future never loses
/// a message.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
}

impl WebSocketTransport {
    /// Open a WebSocket connection to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`PulsewireError::Io`] when the connection cannot be
    /// established. The I/O error kind is preserved when there is one.
    pub async fn connect(url: &str) -> Result<Self, PulsewireError> {
        tracing::debug!(url = %url, "connecting to WebSocket endpoint");

        let (stream, _response) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            let kind = match &e {
                tokio_tungstenite::tungstenite::Error::Io(io) => io.kind(),
                _ => std::io::ErrorKind::Other,
            };
            PulsewireError::Io(std::io::Error::new(kind, e))
        })?;

        tracing::info!(url = %url, "WebSocket connection established");
        Ok(Self::from_stream(stream))
    }

    /// Like [`connect`](Self::connect), failing with
    /// [`PulsewireError::Timeout`] once `timeout` elapses.
    pub async fn connect_with_timeout(url: &str, timeout: Duration) -> Result<Self, PulsewireError> {
        tokio::time::timeout(timeout, Self::connect(url))
            .await
            .map_err(|_| PulsewireError::Timeout)?
    }

    /// Wrap an already-established stream (custom TLS, proxies, headers).
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, frame: Frame) -> Result<(), PulsewireError> {
        if self.closed {
            return Err(PulsewireError::TransportClosed);
        }
        let message = match frame {
            Frame::Text(text) => WsMessage::Text(text.into()),
            Frame::Binary(bytes) => WsMessage::Binary(bytes.into()),
        };
        self.stream
            .send(message)
            .await
            .map_err(|e| PulsewireError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Frame, PulsewireError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(PulsewireError::TransportReceive(e.to_string()))),
            };

            match message {
                WsMessage::Text(text) => return Some(Ok(Frame::Text(text.to_string()))),
                WsMessage::Binary(bytes) => return Some(Ok(Frame::Binary(bytes.to_vec()))),
                WsMessage::Close(frame) => {
                    tracing::debug!(?frame, "received WebSocket close frame");
                    return None;
                }
                // tungstenite queues the pong reply itself.
                WsMessage::Ping(_) | WsMessage::Pong(_) => {}
                WsMessage::Frame(_) => {
                    tracing::debug!("received raw WebSocket frame, skipping");
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), PulsewireError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| PulsewireError::TransportSend(e.to_string()))
    }
}

/// A [`Connector`] that opens [`WebSocketTransport`]s.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Create a connector with the default 10 second handshake timeout.
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Set the handshake timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, PulsewireError> {
        let transport = WebSocketTransport::connect_with_timeout(url, self.connect_timeout).await?;
        Ok(Box::new(transport))
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Start a local WebSocket server that runs `handler` on the first
    /// accepted connection. Returns the URL to connect to.
    async fn start_mock_server<F, Fut>(handler: F) -> String
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });

        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn invalid_url_is_an_io_error() {
        let err = WebSocketTransport::connect("not-a-valid-url").await.unwrap_err();
        assert!(matches!(err, PulsewireError::Io(_)));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn receives_text_and_binary_frames() {
        let url = start_mock_server(|mut ws| async move {
            ws.send(WsMessage::Text(r#"{"event":"a"}"#.into())).await.unwrap();
            ws.send(WsMessage::Binary(vec![1, 0, 0, 0].into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        assert_eq!(
            transport.recv().await.unwrap().unwrap(),
            Frame::Text(r#"{"event":"a"}"#.to_string())
        );
        assert_eq!(
            transport.recv().await.unwrap().unwrap(),
            Frame::Binary(vec![1, 0, 0, 0])
        );
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn binary_frames_are_sent_as_binary() {
        let url = start_mock_server(|mut ws| async move {
            if let Some(Ok(WsMessage::Binary(bytes))) = ws.next().await {
                ws.send(WsMessage::Text(format!("{}", bytes.len()).into()))
                    .await
                    .unwrap();
            }
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport.send(Frame::Binary(vec![7; 12])).await.unwrap();
        assert_eq!(
            transport.recv().await.unwrap().unwrap(),
            Frame::Text("12".to_string())
        );
    }

    #[tokio::test]
    async fn send_after_close_is_rejected() {
        let url =
            start_mock_server(|mut ws| async move { while let Some(Ok(_)) = ws.next().await {} })
                .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        let err = transport.send(Frame::Text("late".into())).await.unwrap_err();
        assert!(matches!(err, PulsewireError::TransportClosed));
    }

    #[tokio::test]
    async fn connector_honours_timeout() {
        let connector = WebSocketConnector::new().with_connect_timeout(Duration::from_millis(50));
        let result = connector.connect("ws://192.0.2.1:1").await;
        assert!(matches!(result, Err(PulsewireError::Timeout)));
    }
}
