//! Token vault: AEAD encryption for credentials at rest.
//!
//! Stored shape is `base64(nonce ‖ ciphertext ‖ tag)` with a fresh random
//! 96-bit nonce per message, so two encryptions of the same plaintext never
//! collide. Decryption authenticates the tag and fails on any tampering.
//! Plaintext credentials exist only in process memory.

use base64::Engine;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

/// AEAD nonce length in bytes.
const NONCE_LEN: usize = 12;

/// AEAD authentication tag length in bytes.
const TAG_LEN: usize = 16;

/// Minimum decoded length of a vault ciphertext (nonce + tag, empty payload).
const MIN_CIPHERTEXT_LEN: usize = NONCE_LEN + TAG_LEN;

/// Known plaintext prefixes of provider credentials and settings values.
/// Anything starting with one of these is stored unencrypted legacy data,
/// not vault output.
const PLAINTEXT_PREFIXES: &[&str] = &[
    "ghp_",
    "github_pat_",
    "gho_",
    "ghu_",
    "ghs_",
    "ghr_",
    "xoxb-",
    "xoxp-",
    "xoxe-",
    "xoxa-",
    "https://",
    "http://",
];

/// Vault errors.
#[derive(Error, Debug)]
pub enum VaultError {
    /// Key is not base64 or not 32 bytes.
    #[error("encryption key must be base64 of exactly 32 bytes")]
    InvalidKey,
    /// Ciphertext failed authentication (tampered or wrong key).
    #[error("ciphertext failed authentication")]
    Tampered,
    /// Ciphertext is not base64 or too short to contain nonce and tag.
    #[error("malformed ciphertext")]
    Malformed,
}

/// AEAD vault over a single 256-bit key.
///
/// Key rotation is out of scope; operators re-encrypt via the store's
/// migration helper.
#[derive(Clone)]
pub struct TokenVault {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for TokenVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVault").finish_non_exhaustive()
    }
}

impl TokenVault {
    /// Creates a vault from a base64-encoded 32-byte key. Fails closed on a
    /// missing or wrong-length key.
    pub fn new(key_b64: &SecretString) -> Result<Self, VaultError> {
        let key_bytes = base64::engine::general_purpose::STANDARD
            .decode(key_b64.expose_secret())
            .map_err(|_| VaultError::InvalidKey)?;
        if key_bytes.len() != 32 {
            return Err(VaultError::InvalidKey);
        }
        Ok(Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key_bytes)),
        })
    }

    /// Encrypts a plaintext. Empty input round-trips as empty.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Tampered)?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(combined))
    }

    /// Decrypts a vault ciphertext. Empty input round-trips as empty.
    pub fn decrypt(&self, encrypted: &str) -> Result<String, VaultError> {
        if encrypted.is_empty() {
            return Ok(String::new());
        }

        let combined = base64::engine::general_purpose::STANDARD
            .decode(encrypted)
            .map_err(|_| VaultError::Malformed)?;
        if combined.len() < MIN_CIPHERTEXT_LEN {
            return Err(VaultError::Malformed);
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| VaultError::Tampered)?;

        String::from_utf8(plaintext).map_err(|_| VaultError::Tampered)
    }

    /// Decrypts, mapping any failure to `None`. Read paths use this so a
    /// tampered row degrades to a missing credential instead of a hard error.
    pub fn decrypt_opt(&self, encrypted: &str) -> Option<String> {
        if encrypted.is_empty() {
            return None;
        }
        self.decrypt(encrypted).ok()
    }
}

/// Heuristic: does this stored value look like vault output (as opposed to a
/// legacy plaintext credential)?
///
/// Known provider-token prefixes and URLs are plaintext. Otherwise the value
/// must be valid base64 decoding to at least nonce + tag bytes.
pub fn looks_encrypted(value: &str) -> bool {
    if value.is_empty() {
        return false;
    }

    if PLAINTEXT_PREFIXES.iter().any(|p| value.starts_with(p)) {
        return false;
    }

    match base64::engine::general_purpose::STANDARD.decode(value) {
        Ok(decoded) => decoded.len() >= MIN_CIPHERTEXT_LEN,
        Err(_) => false,
    }
}
