//! Transport abstraction for the Pulsewire duplex connection.
//!
//! A [`Transport`] moves whole [`Frame`]s between the client and the service.
//! A [`Connector`] opens a new transport for a URL; the session uses it for
//! the first connect and for every reconnection attempt, so custom transports
//! plug in by implementing both traits.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use pulsewire_client::error::PulsewireError;
//! use pulsewire_client::transport::{Connector, Frame, Transport};
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, frame: Frame) -> Result<(), PulsewireError> {
//!         todo!()
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<Frame, PulsewireError>> {
//!         todo!()
//!     }
//!
//!     async fn close(&mut self) -> Result<(), PulsewireError> {
//!         todo!()
//!     }
//! }
//!
//! struct MyConnector;
//!
//! #[async_trait]
//! impl Connector for MyConnector {
//!     async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, PulsewireError> {
//!         Ok(Box::new(MyTransport { /* ... */ }))
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::PulsewireError;

/// One complete frame on the duplex connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text frame (JSON).
    Text(String),
    /// Binary frame (length-prefixed protocol frame, or JSON bytes).
    Binary(Vec<u8>),
}

/// A bidirectional frame transport.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) **MUST** be cancel-safe because the session
/// awaits it inside `tokio::select!`. Channel-based implementations are
/// naturally cancel-safe.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send one frame.
    ///
    /// # Errors
    ///
    /// Returns [`PulsewireError::TransportSend`] or
    /// [`PulsewireError::TransportClosed`] when the frame cannot be written.
    async fn send(&mut self, frame: Frame) -> Result<(), PulsewireError>;

    /// Receive the next frame.
    ///
    /// Returns `Some(Ok(frame))` for a frame, `Some(Err(e))` on a transport
    /// error and `None` when the peer closed the connection cleanly.
    async fn recv(&mut self) -> Option<Result<Frame, PulsewireError>>;

    /// Close the connection. Must release resources even if the close
    /// handshake fails.
    async fn close(&mut self) -> Result<(), PulsewireError>;
}

/// Opens transports. Held by the session for its whole lifetime.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a transport to `url`.
    ///
    /// # Errors
    ///
    /// Retriable errors ([`PulsewireError::is_retriable`]) send the session
    /// through the backoff path; any other error moves it to `failed`.
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, PulsewireError>;
}
