//! HMAC-SHA256 signing for channel authorization, webhooks and the publish
//! API.
//!
//! All verification goes through [`Mac::verify_slice`], which compares in
//! constant time.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::auth::AuthorizationResult;
use crate::channel::ChannelKind;
use crate::error::{PulsewireError, Result};
use crate::protocol::id_from_value;
use crate::validation::{validate_channel_name, validate_socket_id, ValidationError};

type HmacSha256 = Hmac<Sha256>;

fn mac(secret: &str) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| PulsewireError::Signing(format!("HMAC key error: {e}")))
}

/// Hex-encoded HMAC-SHA256 of `message` under `secret`.
pub fn sign(secret: &str, message: &[u8]) -> Result<String> {
    let mut mac = mac(secret)?;
    mac.update(message);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Check a hex signature in constant time. Malformed hex never matches.
pub fn verify(secret: &str, message: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = mac(secret) else {
        return false;
    };
    mac.update(message);
    mac.verify_slice(&expected).is_ok()
}

/// Hex SHA-256 digest, used for the `body_sha256` request parameter.
pub fn sha256_hex(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// `socket_id:channel[:channel_data]`.
pub fn channel_signing_string(socket_id: &str, channel: &str, channel_data: Option<&str>) -> String {
    match channel_data {
        Some(data) => format!("{socket_id}:{channel}:{data}"),
        None => format!("{socket_id}:{channel}"),
    }
}

/// Produce the authorization string a subscriber needs to join a private or
/// presence channel.
///
/// Inputs are validated before any signing. Presence channels require
/// `user_data.user_id` (string or number); the serialized user data is
/// signed and returned as `channel_data`.
///
/// # Example
///
/// ```
/// use pulsewire_client::signature::{authorize_channel, verify_channel_auth};
///
/// let result = authorize_channel("secret", "123.456", "private-orders", None).unwrap();
/// assert!(result.auth.starts_with("123.456:"));
/// assert!(verify_channel_auth("secret", "123.456", "private-orders", None, &result.auth));
/// ```
pub fn authorize_channel(
    secret: &str,
    socket_id: &str,
    channel: &str,
    user_data: Option<&Value>,
) -> Result<AuthorizationResult> {
    validate_channel_name(channel)?;
    validate_socket_id(socket_id)?;

    let channel_data = if ChannelKind::from_name(channel) == ChannelKind::Presence {
        let data = user_data.ok_or(ValidationError::MissingUserId)?;
        data.get("user_id")
            .and_then(id_from_value)
            .ok_or(ValidationError::MissingUserId)?;
        Some(data.to_string())
    } else {
        None
    };

    let signature = sign(
        secret,
        channel_signing_string(socket_id, channel, channel_data.as_deref()).as_bytes(),
    )?;
    Ok(AuthorizationResult {
        auth: format!("{socket_id}:{signature}"),
        channel_data,
    })
}

/// Verify an authorization string produced by [`authorize_channel`].
pub fn verify_channel_auth(
    secret: &str,
    socket_id: &str,
    channel: &str,
    channel_data: Option<&str>,
    auth: &str,
) -> bool {
    let Some(signature) = auth
        .strip_prefix(socket_id)
        .and_then(|rest| rest.strip_prefix(':'))
    else {
        return false;
    };
    verify(
        secret,
        channel_signing_string(socket_id, channel, channel_data).as_bytes(),
        signature,
    )
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
    use serde_json::json;

    const SECRET: &str = "7ad3773142a6692b25b8";

    #[test]
    fn sign_is_hex_hmac_sha256() {
        // RFC 4231 test case 2.
        let sig = sign("Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn private_channel_auth_round_trips() {
        let result = authorize_channel(SECRET, "1234.1234", "private-foobar", None).unwrap();
        assert_eq!(result.channel_data, None);
        assert!(verify_channel_auth(
            SECRET,
            "1234.1234",
            "private-foobar",
            None,
            &result.auth
        ));
        assert!(!verify_channel_auth(
            SECRET,
            "1234.1235",
            "private-foobar",
            None,
            &result.auth
        ));
    }

    #[test]
    fn presence_auth_signs_channel_data() {
        let user = json!({"user_id": 10, "user_info": {"name": "Mr. Channel"}});
        let result = authorize_channel(SECRET, "1234.1234", "presence-foobar", Some(&user)).unwrap();
        let data = result.channel_data.clone().unwrap();
        assert_eq!(serde_json::from_str::<Value>(&data).unwrap(), user);
        assert!(verify_channel_auth(
            SECRET,
            "1234.1234",
            "presence-foobar",
            Some(&data),
            &result.auth
        ));
        assert!(!verify_channel_auth(
            SECRET,
            "1234.1234",
            "presence-foobar",
            Some(r#"{"user_id":11}"#),
            &result.auth
        ));
        assert!(!verify_channel_auth(
            SECRET,
            "1234.1234",
            "presence-foobar",
            None,
            &result.auth
        ));
    }

    #[test]
    fn any_single_bit_flip_is_rejected() {
        let result = authorize_channel(SECRET, "1.2", "private-a", None).unwrap();
        let signature = result.auth.strip_prefix("1.2:").unwrap();
        let mut bytes = hex::decode(signature).unwrap();
        for i in 0..bytes.len() * 8 {
            bytes[i / 8] ^= 1 << (i % 8);
            let mutated = format!("1.2:{}", hex::encode(&bytes));
            assert!(!verify_channel_auth(SECRET, "1.2", "private-a", None, &mutated), "bit {i}");
            bytes[i / 8] ^= 1 << (i % 8);
        }
        assert!(verify_channel_auth(
            SECRET,
            "1.2",
            "private-a",
            None,
            &format!("1.2:{}", hex::encode(&bytes))
        ));
    }

    #[test]
    fn validation_runs_before_signing() {
        let err = authorize_channel(SECRET, "bad", "private-a", None).unwrap_err();
        assert!(matches!(
            err,
            PulsewireError::Validation(ValidationError::InvalidSocketId(_))
        ));
        let err = authorize_channel(SECRET, "1.2", "private a", None).unwrap_err();
        assert!(matches!(
            err,
            PulsewireError::Validation(ValidationError::InvalidChannelName(_))
        ));
        let err = authorize_channel(SECRET, "1.2", "presence-a", Some(&json!({"name": "x"})))
            .unwrap_err();
        assert!(matches!(
            err,
            PulsewireError::Validation(ValidationError::MissingUserId)
        ));
        let err = authorize_channel(SECRET, "1.2", "presence-a", None).unwrap_err();
        assert!(matches!(
            err,
            PulsewireError::Validation(ValidationError::MissingUserId)
        ));
    }

    #[test]
    fn malformed_signature_hex_never_verifies() {
        assert!(!verify(SECRET, b"body", "zz"));
        assert!(!verify(SECRET, b"body", ""));
    }

    #[test]
    fn sha256_of_empty_body() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
