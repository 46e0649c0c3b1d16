//! Service error codes carried by `<ns>:error` frames.
//!
//! Codes are grouped in ranges that decide how the session reacts:
//!
//! | Range     | Reaction                                   |
//! |-----------|--------------------------------------------|
//! | 4000–4099 | fatal: close, state `failed`, no retry     |
//! | 4100–4199 | close and reconnect with backoff           |
//! | 4200–4299 | close and reconnect immediately            |
//! | 4300–4399 | informational, connection stays up         |

use std::fmt;

/// How the session reacts to an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectStrategy {
    Fatal,
    Backoff,
    Immediate,
    Informational,
}

impl ReconnectStrategy {
    /// Strategy for a code from an `<ns>:error` frame. Frames without a code,
    /// or with a code outside the known ranges, are informational.
    pub fn for_code(code: Option<u16>) -> Self {
        match code {
            Some(4000..=4099) => Self::Fatal,
            Some(4100..=4199) => Self::Backoff,
            Some(4200..=4299) => Self::Immediate,
            _ => Self::Informational,
        }
    }
}

/// Error codes documented by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Fatal
    SslRequired,
    ApplicationNotFound,
    ApplicationDisabled,
    ConnectionQuotaExceeded,
    PathNotFound,
    InvalidProtocolVersion,
    Unauthorized,

    // Reconnect with backoff
    OverCapacity,

    // Reconnect immediately
    GenericReconnect,
    PongNotReceived,
    ClosedAfterInactivity,

    // Informational
    ClientEventRejected,
}

impl ErrorCode {
    /// Look up a numeric code.
    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            4000 => Self::SslRequired,
            4001 => Self::ApplicationNotFound,
            4003 => Self::ApplicationDisabled,
            4004 => Self::ConnectionQuotaExceeded,
            4005 => Self::PathNotFound,
            4006 => Self::InvalidProtocolVersion,
            4009 => Self::Unauthorized,
            4100 => Self::OverCapacity,
            4200 => Self::GenericReconnect,
            4201 => Self::PongNotReceived,
            4202 => Self::ClosedAfterInactivity,
            4301 => Self::ClientEventRejected,
            _ => return None,
        })
    }

    /// Numeric wire code.
    pub fn code(self) -> u16 {
        match self {
            Self::SslRequired => 4000,
            Self::ApplicationNotFound => 4001,
            Self::ApplicationDisabled => 4003,
            Self::ConnectionQuotaExceeded => 4004,
            Self::PathNotFound => 4005,
            Self::InvalidProtocolVersion => 4006,
            Self::Unauthorized => 4009,
            Self::OverCapacity => 4100,
            Self::GenericReconnect => 4200,
            Self::PongNotReceived => 4201,
            Self::ClosedAfterInactivity => 4202,
            Self::ClientEventRejected => 4301,
        }
    }

    pub fn strategy(self) -> ReconnectStrategy {
        ReconnectStrategy::for_code(Some(self.code()))
    }

    /// Returns a human-readable description of this error code.
    pub fn description(self) -> &'static str {
        match self {
            Self::SslRequired => "The application only accepts encrypted (wss) connections.",
            Self::ApplicationNotFound => {
                "No application matches the supplied key. Verify the key is correct."
            }
            Self::ApplicationDisabled => {
                "The application has been disabled. Contact the administrator for assistance."
            }
            Self::ConnectionQuotaExceeded => {
                "The application has reached its connection quota."
            }
            Self::PathNotFound => "The connection path was not recognized by the service.",
            Self::InvalidProtocolVersion => {
                "The client speaks a protocol version the service does not support. Please upgrade."
            }
            Self::Unauthorized => "The connection was rejected because the credential is not valid.",
            Self::OverCapacity => {
                "The service is over capacity. The client will retry with backoff."
            }
            Self::GenericReconnect => "The service asked the client to reconnect.",
            Self::PongNotReceived => {
                "The service did not receive a pong in time and closed the connection."
            }
            Self::ClosedAfterInactivity => "The connection was closed after a period of inactivity.",
            Self::ClientEventRejected => {
                "A client event was rejected, typically because of rate limiting."
            }
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
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

    #[test]
    fn ranges_map_to_strategies() {
        assert_eq!(ReconnectStrategy::for_code(Some(4000)), ReconnectStrategy::Fatal);
        assert_eq!(ReconnectStrategy::for_code(Some(4099)), ReconnectStrategy::Fatal);
        assert_eq!(ReconnectStrategy::for_code(Some(4100)), ReconnectStrategy::Backoff);
        assert_eq!(ReconnectStrategy::for_code(Some(4250)), ReconnectStrategy::Immediate);
        assert_eq!(ReconnectStrategy::for_code(Some(4301)), ReconnectStrategy::Informational);
        assert_eq!(ReconnectStrategy::for_code(None), ReconnectStrategy::Informational);
        assert_eq!(ReconnectStrategy::for_code(Some(1006)), ReconnectStrategy::Informational);
    }

    #[test]
    fn known_codes_round_trip() {
        for code in [4000, 4001, 4003, 4004, 4005, 4006, 4009, 4100, 4200, 4201, 4202, 4301] {
            assert_eq!(ErrorCode::from_code(code).unwrap().code(), code);
        }
        assert_eq!(ErrorCode::from_code(4002), None);
    }

    #[test]
    fn strategy_follows_range() {
        assert_eq!(ErrorCode::Unauthorized.strategy(), ReconnectStrategy::Fatal);
        assert_eq!(ErrorCode::PongNotReceived.strategy(), ReconnectStrategy::Immediate);
    }

    #[test]
    fn every_code_has_a_description() {
        for code in 4000..4400 {
            if let Some(known) = ErrorCode::from_code(code) {
                assert!(!known.description().is_empty());
            }
        }
    }
}
