//! Events emitted by the background session to the application.

use std::time::Duration;

use crate::channel::Member;
use crate::connection::{ConnectionState, StateChange};
use crate::protocol::Message;

/// Everything the session reports on the event receiver returned by
/// [`PulsewireClient::start`](crate::PulsewireClient::start).
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The connection state changed. Always delivered, even when the event
    /// channel is full.
    StateChanged {
        previous: ConnectionState,
        current: ConnectionState,
    },

    /// The service assigned a connection id.
    ConnectionEstablished { socket_id: String },

    /// A reconnection attempt has been scheduled. `attempt` is 1-based.
    ReconnectScheduled { attempt: u32, delay: Duration },

    /// The service confirmed a channel subscription.
    SubscriptionSucceeded { channel: String },

    /// Authorization or the service rejected a channel subscription.
    SubscriptionError { channel: String, error: String },

    /// A member joined a presence channel.
    MemberAdded { channel: String, member: Member },

    /// A member left a presence channel.
    MemberRemoved { channel: String, member: Member },

    /// An application event, with or without a channel.
    Message(Message),

    /// An inbound frame was dropped because it could not be decoded.
    DecodeError { error: String },

    /// The service (or the session) reported an error.
    Error { code: Option<u16>, message: String },
}

impl From<StateChange> for ClientEvent {
    fn from(change: StateChange) -> Self {
        Self::StateChanged {
            previous: change.previous,
            current: change.current,
        }
    }
}

impl ClientEvent {
    /// The new state, for `StateChanged` events.
    pub fn state(&self) -> Option<ConnectionState> {
        match self {
            Self::StateChanged { current, .. } => Some(*current),
            _ => None,
        }
    }
}
