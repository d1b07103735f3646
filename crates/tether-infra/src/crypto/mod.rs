//! Cryptographic operations for Tether.
//!
//! - `vault`: AES-256-GCM encryption for subscription secrets at rest

pub mod vault;

pub use vault::{VaultCrypto, VaultError};
