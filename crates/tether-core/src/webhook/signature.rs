//! Signature verification for inbound deliveries.
//!
//! Provides:
//! - `verify_delivery()` -- checks a delivery against a subscription's scheme
//! - `verify_hmac_sha256()` -- constant-time HMAC-SHA256 check, `sha256=` prefix tolerated
//! - `verify_bearer_token()` -- constant-time shared-token comparison
//! - `generate_secret()` / `generate_binding_key()` -- random tokens for new subscriptions
//!
//! A scheme that requires a secret fails closed when none is configured.

use aes_gcm::aead::OsRng;
use aes_gcm::aead::rand_core::RngCore;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tether_types::delivery::Delivery;
use tether_types::subscription::SignatureScheme;

type HmacSha256 = Hmac<Sha256>;

/// Random bytes in a generated secret (hex-encoded to twice that).
const SECRET_BYTES: usize = 32;

/// Random bytes in a binding key.
const BINDING_KEY_BYTES: usize = 16;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    /// The credential header is absent.
    #[error("missing credential header: {0}")]
    MissingCredential(String),

    /// The credential was present but did not verify.
    #[error("signature verification failed")]
    Mismatch,

    /// The scheme requires a secret and the subscription has none.
    #[error("no secret configured for authenticated subscription")]
    NoSecret,

    #[error("invalid HMAC key: {0}")]
    InvalidKey(String),
}

impl SignatureError {
    /// Whether the caller presented no credential at all.
    pub fn is_missing(&self) -> bool {
        matches!(self, SignatureError::MissingCredential(_))
    }
}

// ---------------------------------------------------------------------------
// Delivery verification
// ---------------------------------------------------------------------------

/// Verify a delivery against the subscription's scheme and secret.
///
/// Pure and side-effect free; runs before any body parsing.
pub fn verify_delivery(
    delivery: &Delivery,
    scheme: &SignatureScheme,
    secret: Option<&str>,
) -> Result<(), SignatureError> {
    match scheme {
        SignatureScheme::HmacSha256 { header } => {
            let secret = secret.ok_or(SignatureError::NoSecret)?;
            let signature = delivery
                .header(header)
                .ok_or_else(|| SignatureError::MissingCredential(header.clone()))?;
            verify_hmac_sha256(secret.as_bytes(), &delivery.body, signature)
        }
        SignatureScheme::BearerToken { header } => {
            let secret = secret.ok_or(SignatureError::NoSecret)?;
            let token = delivery
                .header(header)
                .ok_or_else(|| SignatureError::MissingCredential(header.clone()))?;
            verify_bearer_token(secret, token)
        }
        SignatureScheme::None => Ok(()),
    }
}

/// Verify a hex HMAC-SHA256 signature over `body`. Accepts a `sha256=` prefix.
pub fn verify_hmac_sha256(secret: &[u8], body: &[u8], signature: &str) -> Result<(), SignatureError> {
    let hex_sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    let expected = hex_decode(hex_sig).ok_or(SignatureError::Mismatch)?;

    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
    mac.update(body);
    mac.verify_slice(&expected).map_err(|_| SignatureError::Mismatch)
}

/// Compare a presented token (optionally `Bearer `-prefixed) to the secret.
pub fn verify_bearer_token(expected: &str, provided: &str) -> Result<(), SignatureError> {
    let token = provided.strip_prefix("Bearer ").unwrap_or(provided);
    if constant_time_eq(expected.as_bytes(), token.as_bytes()) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Hex-encoded HMAC-SHA256 of `body`, as a sender would compute it.
pub fn compute_hmac_sha256_hex(secret: &[u8], body: &[u8]) -> Result<String, SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
    mac.update(body);
    Ok(hex_encode(&mac.finalize().into_bytes()))
}

/// Fresh random secret, hex-encoded.
pub fn generate_secret() -> String {
    random_hex(SECRET_BYTES)
}

/// Fresh unguessable routing token for a callback URL.
pub fn generate_binding_key() -> String {
    random_hex(BINDING_KEY_BYTES)
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// XOR-accumulating comparison; running time depends only on length.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
