//! Built-in [`Transport`](crate::Transport) implementations, behind feature
//! gates:
//!
//! | Feature                   | Transport / connector                             |
//! |---------------------------|---------------------------------------------------|
//! | `transport-websocket`     | [`WebSocketTransport`], [`WebSocketConnector`]    |
//! | `transport-websocket-tls` | adds `wss://` support to the WebSocket transport  |

#[cfg(feature = "transport-websocket")]
pub mod websocket;

#[cfg(feature = "transport-websocket")]
pub use websocket::{WebSocketConnector, WebSocketTransport};
