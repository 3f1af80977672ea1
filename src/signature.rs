//! HMAC-SHA256 signing and verification of webhook payloads.
//!
//! Outbound deliveries carry `X-Webhook-Signature: hex(HMAC_SHA256(secret, body))`.
//! Receivers recompute the digest over the raw body with their copy of the endpoint
//! secret and compare. Inbound provider schemes build on the same primitives with a
//! provider-specific signed message (see [`crate::inbound`]).
//!
//! # Examples
//!
//! ```rust
//! use hookwork::signature::{sign, verify};
//!
//! let secret = "whsec_3f9a";
//! let body = br#"{"order_id":"ord_42"}"#;
//!
//! let signature = sign(body, secret);
//! assert!(verify(body, &signature, secret));
//! assert!(!verify(b"tampered", &signature, secret));
//! ```

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Prefix of generated endpoint secrets.
pub const SECRET_PREFIX: &str = "whsec_";

/// Raw HMAC-SHA256 digest of `payload` keyed with `secret`.
pub fn digest(payload: &[u8], secret: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, new_from_slice cannot fail
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC can take key of any size"),
    };
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// `hex(HMAC_SHA256(secret, payload))`.
pub fn sign(payload: &[u8], secret: &str) -> String {
    hex::encode(digest(payload, secret.as_bytes()))
}

/// Verify a hex-encoded HMAC-SHA256 signature in constant time.
///
/// Returns `false` for signatures that are not valid hex.
pub fn verify(payload: &[u8], signature: &str, secret: &str) -> bool {
    verify_bytes(payload, signature, secret.as_bytes())
}

/// Like [`verify`] but with a raw key.
pub fn verify_bytes(payload: &[u8], signature: &str, secret: &[u8]) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

/// Generate a fresh endpoint secret: `whsec_` followed by 32 random bytes in hex.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    format!("{}{}", SECRET_PREFIX, hex::encode(bytes))
}
