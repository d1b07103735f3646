//! AES-256-GCM vault encryption for subscription secrets at rest.
//!
//! The 32-byte master key lives in a key file (hex, 64 chars), generated on
//! first use with owner-only permissions.
//!
//! Encrypted format: `base64(nonce (12 bytes) || ciphertext)`
//!
//! SECURITY: Error types never contain plaintext or key material.

use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

/// Nonce size for AES-256-GCM (96 bits / 12 bytes).
const NONCE_SIZE: usize = 12;

const KEY_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("invalid ciphertext: too short")]
    CiphertextTooShort,

    #[error("invalid ciphertext encoding")]
    InvalidEncoding,

    #[error("key file error: {0}")]
    KeyFile(String),
}

/// AES-256-GCM encryption for secrets at rest.
///
/// Each encryption call generates a random 12-byte nonce, prepended to the ciphertext.
pub struct VaultCrypto {
    cipher: Aes256Gcm,
}

impl VaultCrypto {
    /// Create a new VaultCrypto from a raw 32-byte key.
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
        }
    }

    /// Load the master key from `path`, generating and writing a fresh one
    /// if the file does not exist.
    pub async fn from_key_file(path: &Path) -> Result<Self, VaultError> {
        match tokio::fs::read_to_string(path).await {
            Ok(hex_key) => {
                let bytes = hex_decode(hex_key.trim())
                    .ok_or_else(|| VaultError::KeyFile("corrupted key file".to_string()))?;
                let key: [u8; KEY_SIZE] = bytes
                    .try_into()
                    .map_err(|_| VaultError::KeyFile("invalid key length".to_string()))?;
                Ok(Self::new(&key))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let key = rand_bytes();
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| VaultError::KeyFile(e.to_string()))?;
                }
                tokio::fs::write(path, hex_encode(&key))
                    .await
                    .map_err(|e| VaultError::KeyFile(e.to_string()))?;
                restrict_permissions(path).await?;
                tracing::info!(path = %path.display(), "generated vault key");
                Ok(Self::new(&key))
            }
            Err(e) => Err(VaultError::KeyFile(e.to_string())),
        }
    }

    /// Encrypt plaintext. Returns `nonce (12 bytes) || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| VaultError::EncryptionFailed)?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt data produced by `encrypt()`.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, VaultError> {
        if data.len() < NONCE_SIZE {
            return Err(VaultError::CiphertextTooShort);
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| VaultError::DecryptionFailed)
    }

    /// Encrypt a secret for a TEXT column.
    pub fn encrypt_string(&self, plaintext: &str) -> Result<String, VaultError> {
        Ok(STANDARD.encode(self.encrypt(plaintext.as_bytes())?))
    }

    /// Reverse of [`VaultCrypto::encrypt_string`].
    pub fn decrypt_string(&self, encoded: &str) -> Result<String, VaultError> {
        let data = STANDARD
            .decode(encoded)
            .map_err(|_| VaultError::InvalidEncoding)?;
        String::from_utf8(self.decrypt(&data)?).map_err(|_| VaultError::DecryptionFailed)
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<(), VaultError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(|e| VaultError::KeyFile(e.to_string()))
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<(), VaultError> {
    Ok(())
}

/// Generate 32 random bytes using the OS CSPRNG.
fn rand_bytes() -> [u8; KEY_SIZE] {
    use aes_gcm::aead::rand_core::RngCore;
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 || !s.is_ascii() {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
