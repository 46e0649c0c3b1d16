//! Connection lifecycle states and the allowed transitions between them.

use std::fmt;

/// Lifecycle state of a client's duplex connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Not connected and not trying to. Initial state.
    #[default]
    Disconnected,
    /// A connection attempt (discovery, transport open, handshake) is running.
    Connecting,
    /// The service handshake completed; channels may subscribe.
    Connected,
    /// The last attempt failed; another one is scheduled.
    Unavailable,
    /// Terminal until `force_reconnect()` or `disconnect()`.
    Failed,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Staying in the same state is never a transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting | Failed)
                | (Connecting, Connected | Unavailable | Failed | Disconnected)
                | (Connected, Disconnected | Connecting | Failed)
                | (Unavailable, Connecting | Failed | Disconnected)
                | (Failed, Connecting | Disconnected)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Unavailable => "unavailable",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completed state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
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
    use super::ConnectionState::*;
    use super::*;

    const ALL: [ConnectionState; 5] = [Disconnected, Connecting, Connected, Unavailable, Failed];

    #[test]
    fn initial_state_is_disconnected() {
        assert_eq!(ConnectionState::default(), Disconnected);
    }

    #[test]
    fn self_transitions_are_rejected() {
        for state in ALL {
            assert!(!state.can_transition_to(state), "{state} -> {state}");
        }
    }

    #[test]
    fn every_state_can_be_disconnected() {
        for state in ALL.into_iter().filter(|s| *s != Disconnected) {
            assert!(state.can_transition_to(Disconnected), "{state} -> disconnected");
        }
    }

    #[test]
    fn connected_is_only_reached_from_connecting() {
        for state in ALL {
            assert_eq!(state.can_transition_to(Connected), state == Connecting, "{state}");
        }
    }

    #[test]
    fn unavailable_is_only_reached_from_connecting() {
        for state in ALL {
            assert_eq!(state.can_transition_to(Unavailable), state == Connecting, "{state}");
        }
    }

    #[test]
    fn failed_leaves_only_through_connecting_or_disconnect() {
        let exits: Vec<_> = ALL.into_iter().filter(|s| Failed.can_transition_to(*s)).collect();
        assert_eq!(exits, vec![Connecting, Disconnected]);
    }

    #[test]
    fn display_uses_lowercase_names() {
        assert_eq!(Unavailable.to_string(), "unavailable");
    }
}
