//! Request signatures for elba → connector calls.
//!
//! elba signs the raw request body with HMAC-SHA256 using the shared webhook
//! secret and sends the hex digest in `X-Elba-Signature`, optionally prefixed
//! with `sha256=`.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;


type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-elba-signature";

/// Checks the signature header against `body`.
pub fn verify_signature(secret: &str, headers: &HeaderMap, body: &[u8]) -> Result<(), SignatureError> {
    let expected = extract_signature(headers)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidKey)?;
    mac.update(body);
    // verify_slice compares in constant time
    mac.verify_slice(&expected)
        .map_err(|_| SignatureError::Mismatch)
}

/// Hex HMAC-SHA256 of `body`, as elba sends it.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidKey)?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Extract the decoded digest from the signature header
fn extract_signature(headers: &HeaderMap) -> Result<Vec<u8>, SignatureError> {
    let value = headers
        .get(SIGNATURE_HEADER)
        .ok_or(SignatureError::Missing)?
        .to_str()
        .map_err(|_| SignatureError::InvalidFormat)?
        .trim();

    let digest = value.strip_prefix("sha256=").unwrap_or(value);
    if digest.is_empty() {
        return Err(SignatureError::Missing);
    }

    hex::decode(digest).map_err(|_| SignatureError::InvalidFormat)
}

/// Signature verification errors
#[derive(Debug, PartialEq, Clone)]
pub enum SignatureError {
    /// Signature header not present or empty
    Missing,
    /// Not a hex digest
    InvalidFormat,
    /// Digest does not match the body
    Mismatch,
    /// The configured secret cannot key an HMAC
    InvalidKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "Request signature not provided"),
            SignatureError::InvalidFormat => write!(f, "Invalid request signature format"),
            SignatureError::Mismatch => write!(f, "Request signature does not match"),
            SignatureError::InvalidKey => write!(f, "Webhook secret is not usable"),
        }
    }
}

impl std::error::Error for SignatureError {}
