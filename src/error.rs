//! Error types for the Pulsewire client and publisher.

use thiserror::Error;

use crate::validation::ValidationError;

/// Errors that can occur when using the Pulsewire SDK.
#[derive(Debug, Error)]
pub enum PulsewireError {
    /// Failed to send a frame through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a frame from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed unexpectedly.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize or deserialize a protocol structure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The background session task has exited; the handle can no longer be used.
    #[error("client has shut down")]
    ClientClosed,

    /// The credential string cannot be used for this operation.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// Input was rejected before any network call was made.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Discovery did not produce a usable endpoint after all retries.
    #[error("discovery failed after {attempts} attempts: {reason}")]
    Discovery {
        /// Number of discovery requests made.
        attempts: u32,
        /// Last failure observed.
        reason: String,
    },

    /// The channel authorization exchange failed.
    #[error("authorization failed for {channel}: {reason}")]
    Authorization {
        /// Channel the authorization was requested for.
        channel: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An HTTP request could not be completed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// An HTTP endpoint answered with a non-success status.
    #[error("HTTP status {status}: {body}")]
    HttpStatus {
        /// Response status code.
        status: u16,
        /// Response body (possibly truncated by the server).
        body: String,
    },

    /// A URL could not be parsed or built.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// A webhook failed key or signature checks.
    #[error("invalid webhook: {0}")]
    InvalidWebhook(String),

    /// A signature could not be computed.
    #[error("signing error: {0}")]
    Signing(String),

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PulsewireError {
    /// Returns `true` for transient failures that a retry with backoff may fix.
    ///
    /// Transport-level failures, timeouts, HTTP transport failures and 5xx
    /// responses are retriable. Validation, credential, discovery and
    /// URL errors are not.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::TransportSend(_)
            | Self::TransportReceive(_)
            | Self::TransportClosed
            | Self::Timeout
            | Self::Io(_) => true,
            Self::Http(e) => !e.is_builder() && !e.is_decode(),
            Self::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// A specialized [`Result`] type for Pulsewire operations.
pub type Result<T> = std::result::Result<T, PulsewireError>;

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
    fn transport_errors_are_retriable() {
        assert!(PulsewireError::TransportClosed.is_retriable());
        assert!(PulsewireError::TransportReceive("reset".into()).is_retriable());
        assert!(PulsewireError::Timeout.is_retriable());
        assert!(PulsewireError::Io(std::io::Error::other("refused")).is_retriable());
    }

    #[test]
    fn server_side_status_codes_split_on_500() {
        let bad_gateway = PulsewireError::HttpStatus {
            status: 502,
            body: String::new(),
        };
        let forbidden = PulsewireError::HttpStatus {
            status: 403,
            body: String::new(),
        };
        assert!(bad_gateway.is_retriable());
        assert!(!forbidden.is_retriable());
    }

    #[test]
    fn terminal_errors_are_not_retriable() {
        assert!(!PulsewireError::InvalidCredential("ct_x".into()).is_retriable());
        assert!(!PulsewireError::Discovery {
            attempts: 3,
            reason: "no token".into()
        }
        .is_retriable());
        assert!(!PulsewireError::Validation(ValidationError::MissingUserId).is_retriable());
    }

    #[test]
    fn display_includes_context() {
        let err = PulsewireError::Authorization {
            channel: "private-orders".into(),
            reason: "HTTP 403".into(),
        };
        assert_eq!(
            err.to_string(),
            "authorization failed for private-orders: HTTP 403"
        );
    }
}
