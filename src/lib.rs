//! # Pulsewire Client
//!
//! Async Rust SDK for the Pulsewire hosted publish/subscribe service.
//!
//! The subscriber side keeps a single duplex connection alive, multiplexes
//! named channels over it and tracks presence membership. The publisher side
//! signs calls to the HTTP control API and channel authorizations.
//!
//! ## Features
//!
//! - **Transport-agnostic**: implement [`Transport`] and [`Connector`] for any backend
//! - **WebSocket built-in**: the default `transport-websocket` feature provides
//!   [`transports::WebSocketConnector`]
//! - **Event-driven**: receive typed [`ClientEvent`]s on a channel and bind
//!   per-channel handlers
//! - **Self-healing**: reconnects with bounded exponential backoff and
//!   re-authorizes private channels on every new connection
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pulsewire_client::{ClientConfig, ClientEvent, PulsewireClient};
//!
//! let config = ClientConfig::new("pk_live_abc123")
//!     .with_auth_endpoint("https://example.com/pulsewire/auth");
//! let (client, mut events) = PulsewireClient::start_websocket(config)?;
//!
//! client.subscribe("news")?.bind("headline", |msg| println!("{}", msg.data))?;
//! client.connect()?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

pub mod auth;
pub mod backoff;
pub mod channel;
pub mod client;
pub mod codec;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod error_codes;
pub mod event;
pub mod protocol;
pub mod publisher;
pub mod signature;
pub mod transport;
pub mod transports;
pub mod validation;
pub mod webhook;

// Re-export primary types for ergonomic imports.
pub use auth::{AuthRequest, AuthorizationResult, ChannelAuthorizer, HttpChannelAuthorizer};
pub use backoff::ReconnectionPolicy;
pub use channel::{ChannelInfo, ChannelKind, Member, PresenceInfo, SubscriptionStatus};
pub use client::{ChannelHandle, ClientConfig, PulsewireClient};
pub use codec::OutboundEncoding;
pub use connection::ConnectionState;
pub use error::{PulsewireError, Result};
pub use error_codes::ErrorCode;
pub use event::ClientEvent;
pub use protocol::{Credential, Message};
pub use publisher::{Publisher, PublisherConfig};
pub use transport::{Connector, Frame, Transport};
pub use webhook::Webhook;
