//! Synchronous input validation shared by the subscriber and publisher sides.
//!
//! Every check here runs before any network or crypto work so that invalid
//! input is rejected immediately and never retried.

use thiserror::Error;

/// Maximum length of a channel name, in bytes.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 200;

/// Maximum length of an event name, in bytes.
pub const MAX_EVENT_NAME_LENGTH: usize = 200;

/// Maximum serialized size of a single event's data, in bytes.
pub const MAX_EVENT_DATA_SIZE: usize = 10 * 1024;

/// Maximum number of channels a single trigger may target.
pub const MAX_TRIGGER_CHANNELS: usize = 100;

/// Maximum number of events in one batch trigger.
pub const MAX_BATCH_SIZE: usize = 10;

/// Input rejected by a validator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Channel name is empty, too long, or contains characters outside
    /// `[A-Za-z0-9_\-=@,.;]`.
    #[error("invalid channel name: {0:?}")]
    InvalidChannelName(String),

    /// Connection id does not have the `<digits>.<digits>` shape.
    #[error("invalid socket id: {0:?}")]
    InvalidSocketId(String),

    /// Event name is empty or longer than [`MAX_EVENT_NAME_LENGTH`].
    #[error("invalid event name: {0:?}")]
    InvalidEventName(String),

    /// Presence authorization requires `user_data.user_id`.
    #[error("presence channel data must contain a string or numeric user_id")]
    MissingUserId,

    /// Serialized event data exceeds [`MAX_EVENT_DATA_SIZE`].
    #[error("event data is {size} bytes, limit is {limit}")]
    PayloadTooLarge {
        /// Serialized size.
        size: usize,
        /// Allowed maximum.
        limit: usize,
    },

    /// A trigger targets no channels or more than [`MAX_TRIGGER_CHANNELS`].
    #[error("trigger must target between 1 and {limit} channels, got {count}")]
    ChannelCount {
        /// Number of channels supplied.
        count: usize,
        /// Allowed maximum.
        limit: usize,
    },

    /// A batch is empty or larger than [`MAX_BATCH_SIZE`].
    #[error("batch must contain between 1 and {limit} events, got {count}")]
    BatchSize {
        /// Number of events supplied.
        count: usize,
        /// Allowed maximum.
        limit: usize,
    },

    /// The operation is only valid on presence channels.
    #[error("{0:?} is not a presence channel")]
    NotPresenceChannel(String),

    /// User id used in an API path is empty or contains path separators.
    #[error("invalid user id: {0:?}")]
    InvalidUserId(String),
}

fn is_channel_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '=' | '@' | ',' | '.' | ';')
}

/// Validate a channel name against the allowed charset and length.
pub fn validate_channel_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() || name.len() > MAX_CHANNEL_NAME_LENGTH || !name.chars().all(is_channel_char)
    {
        return Err(ValidationError::InvalidChannelName(name.to_string()));
    }
    Ok(())
}

/// Validate that a connection id looks like `1234.5678`.
pub fn validate_socket_id(socket_id: &str) -> Result<(), ValidationError> {
    let valid = match socket_id.split_once('.') {
        Some((left, right)) => {
            !left.is_empty()
                && !right.is_empty()
                && left.bytes().all(|b| b.is_ascii_digit())
                && right.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidSocketId(socket_id.to_string()))
    }
}

/// Validate an event name's length.
pub fn validate_event_name(event: &str) -> Result<(), ValidationError> {
    if event.is_empty() || event.len() > MAX_EVENT_NAME_LENGTH {
        return Err(ValidationError::InvalidEventName(event.to_string()));
    }
    Ok(())
}

/// Validate the size of serialized event data.
pub fn validate_payload_size(serialized: &str) -> Result<(), ValidationError> {
    if serialized.len() > MAX_EVENT_DATA_SIZE {
        return Err(ValidationError::PayloadTooLarge {
            size: serialized.len(),
            limit: MAX_EVENT_DATA_SIZE,
        });
    }
    Ok(())
}

/// Validate a user id before it is placed in a request path.
pub fn validate_user_id(user_id: &str) -> Result<(), ValidationError> {
    if user_id.is_empty() || user_id.contains(['/', '?', '#']) {
        return Err(ValidationError::InvalidUserId(user_id.to_string()));
    }
    Ok(())
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
    fn accepts_every_allowed_channel_character() {
        assert!(validate_channel_name("private-orders_v2=a@b,c.d;e").is_ok());
        assert!(validate_channel_name("presence-room-42").is_ok());
    }

    #[test]
    fn rejects_bad_channel_names() {
        for name in ["", "has space", "slash/name", "emoji-😀", "colon:name"] {
            assert_eq!(
                validate_channel_name(name),
                Err(ValidationError::InvalidChannelName(name.to_string())),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn channel_name_length_boundary() {
        let max = "a".repeat(MAX_CHANNEL_NAME_LENGTH);
        let over = "a".repeat(MAX_CHANNEL_NAME_LENGTH + 1);
        assert!(validate_channel_name(&max).is_ok());
        assert!(validate_channel_name(&over).is_err());
    }

    #[test]
    fn socket_id_shape() {
        assert!(validate_socket_id("123.456").is_ok());
        for bad in ["", "123", ".456", "123.", "12a.456", "1.2.3", "123:456"] {
            assert!(validate_socket_id(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn event_name_limits() {
        assert!(validate_event_name("order-created").is_ok());
        assert!(validate_event_name("").is_err());
        assert!(validate_event_name(&"e".repeat(MAX_EVENT_NAME_LENGTH + 1)).is_err());
    }

    #[test]
    fn payload_size_limit() {
        assert!(validate_payload_size(&"x".repeat(MAX_EVENT_DATA_SIZE)).is_ok());
        let err = validate_payload_size(&"x".repeat(MAX_EVENT_DATA_SIZE + 1)).unwrap_err();
        assert_eq!(
            err,
            ValidationError::PayloadTooLarge {
                size: MAX_EVENT_DATA_SIZE + 1,
                limit: MAX_EVENT_DATA_SIZE
            }
        );
    }

    #[test]
    fn user_id_cannot_escape_path() {
        assert!(validate_user_id("user-1").is_ok());
        assert!(validate_user_id("").is_err());
        assert!(validate_user_id("../admin").is_err());
    }
}
