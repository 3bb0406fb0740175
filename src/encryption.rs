//! Session message encryption.
//!
//! Every call to [`MessageEncryption::encrypt`] draws a fresh 192-bit nonce
//! from the CSPRNG, so nonce reuse under one key is negligible even for very
//! long sessions. Values are serialized to JSON before encryption and parsed
//! back into a typed value after authentication succeeds; a ciphertext that
//! fails either step is rejected as a whole.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::identity::SharedSecret;

/// XChaCha20-Poly1305 nonce length
pub const NONCE_LEN: usize = 24;
/// Symmetric key length
pub const KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed: ciphertext, nonce or key mismatch")]
    Decrypt,

    #[error("invalid nonce: {0}")]
    InvalidNonce(String),

    #[error("invalid ciphertext encoding: {0}")]
    InvalidCiphertext(String),

    #[error("failed to serialize plaintext: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("decrypted payload does not match the expected schema: {0}")]
    Schema(#[source] serde_json::Error),
}

/// Capability: authenticated encryption with caller-supplied nonces.
pub trait AeadCipher: Send + Sync {
    fn seal(&self, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError>;
    fn open(&self, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError>;
}

/// XChaCha20-Poly1305 keyed with a session secret.
pub struct XChaChaCipher {
    cipher: XChaCha20Poly1305,
}

impl XChaChaCipher {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }
}

impl AeadCipher for XChaChaCipher {
    fn seal(&self, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        self.cipher
            .encrypt(XNonce::from_slice(nonce), plaintext)
            .map_err(|_| EncryptionError::Encrypt)
    }

    fn open(&self, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| EncryptionError::Decrypt)
    }
}

/// Nonce and ciphertext, both lowercase hex as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub nonce: String,
    pub ciphertext: String,
}

/// Per-connection encryption session.
///
/// Owned by exactly one connection; never shared between peers.
pub struct MessageEncryption {
    cipher: Box<dyn AeadCipher>,
}

impl MessageEncryption {
    /// Session keyed directly by an agreed shared secret.
    pub fn new(secret: &SharedSecret) -> Self {
        Self::with_cipher(Box::new(XChaChaCipher::new(secret.expose_secret())))
    }

    pub fn with_cipher(cipher: Box<dyn AeadCipher>) -> Self {
        Self { cipher }
    }

    /// Encrypt raw bytes under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedPayload, EncryptionError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let ciphertext = self.cipher.seal(&nonce, plaintext)?;
        Ok(EncryptedPayload {
            nonce: hex::encode(nonce),
            ciphertext: hex::encode(ciphertext),
        })
    }

    /// Decrypt hex-encoded ciphertext with its hex-encoded nonce.
    pub fn decrypt(&self, ciphertext: &str, nonce: &str) -> Result<Vec<u8>, EncryptionError> {
        let nonce = decode_nonce(nonce)?;
        let ciphertext =
            hex::decode(ciphertext).map_err(|e| EncryptionError::InvalidCiphertext(e.to_string()))?;
        self.cipher.open(&nonce, &ciphertext)
    }

    /// Serialize to JSON, then encrypt.
    pub fn encrypt_object<T: Serialize>(&self, value: &T) -> Result<EncryptedPayload, EncryptionError> {
        let plaintext = zeroize::Zeroizing::new(
            serde_json::to_vec(value).map_err(EncryptionError::Serialize)?,
        );
        self.encrypt(&plaintext)
    }

    /// Decrypt, then parse into `T`. Nothing is returned unless both the
    /// authentication tag and the schema check pass.
    pub fn decrypt_to_object<T: DeserializeOwned>(
        &self,
        ciphertext: &str,
        nonce: &str,
    ) -> Result<T, EncryptionError> {
        let plaintext = zeroize::Zeroizing::new(self.decrypt(ciphertext, nonce)?);
        serde_json::from_slice(&plaintext).map_err(EncryptionError::Schema)
    }
}

impl std::fmt::Debug for MessageEncryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MessageEncryption([REDACTED])")
    }
}

fn decode_nonce(nonce: &str) -> Result<[u8; NONCE_LEN], EncryptionError> {
    let bytes = hex::decode(nonce).map_err(|e| EncryptionError::InvalidNonce(e.to_string()))?;
    bytes.as_slice().try_into().map_err(|_| {
        EncryptionError::InvalidNonce(format!("expected {} bytes, got {}", NONCE_LEN, bytes.len()))
    })
}
