//! Peer identity: a long-term Ed25519 key used both for signing and, through
//! its Montgomery form, for X25519 key agreement.
//!
//! The fingerprint is the first 16 bytes of BLAKE2b-512 over the 32-byte
//! public key, hex encoded. It is what the keystore revokes and what
//! handlers see as the sender of a message.

use blake2::{Blake2b512, Digest};
use ed25519_dalek::{Signature, Signer as _, SigningKey, VerifyingKey};
use rand::RngCore;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::security::SecretBytes;

/// Ed25519 public key length in bytes
pub const PUBLIC_KEY_LEN: usize = 32;
/// Ed25519 signature length in bytes
pub const SIGNATURE_LEN: usize = 64;
/// Number of hash bytes kept in a fingerprint
pub const FINGERPRINT_BYTES: usize = 16;

const SESSION_KDF_DOMAIN: &[u8] = b"secure-mesh-session-v1:";

/// Error types for identity and signature operations
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid signature format: {0}")]
    InvalidSignature(String),

    #[error("signature verification failed")]
    VerificationFailed,

    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),

    #[error("key agreement produced a non-contributory shared secret")]
    WeakKeyAgreement,
}

/// Capability: produce signatures attributable to a fingerprint.
pub trait Signer {
    fn public_key(&self) -> &PeerPublicKey;
    fn fingerprint(&self) -> &str;
    fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN];
}

/// Capability: agree on a symmetric secret with another peer's public key.
pub trait KeyAgreement {
    fn derive_shared_secret(&self, other: &PeerPublicKey) -> Result<SharedSecret, IdentityError>;
}

/// 32-byte symmetric secret agreed between two peers.
pub type SharedSecret = SecretBytes<32>;

/// Compute the fingerprint of raw public key bytes.
pub fn fingerprint_of(public_key: &[u8]) -> String {
    let mut hasher = Blake2b512::new();
    hasher.update(public_key);
    let digest = hasher.finalize();
    hex::encode(&digest[..FINGERPRINT_BYTES])
}

/// A peer's public identity key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PeerPublicKey(VerifyingKey);

impl PeerPublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        let raw: [u8; PUBLIC_KEY_LEN] = bytes.try_into().map_err(|_| {
            IdentityError::InvalidPublicKey(format!(
                "expected {} bytes, got {}",
                PUBLIC_KEY_LEN,
                bytes.len()
            ))
        })?;
        VerifyingKey::from_bytes(&raw)
            .map(Self)
            .map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))
    }

    /// Parse the lowercase-hex wire form.
    pub fn from_hex(encoded: &str) -> Result<Self, IdentityError> {
        let bytes =
            hex::decode(encoded).map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.0.to_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    pub fn fingerprint(&self) -> String {
        fingerprint_of(self.0.as_bytes())
    }

    /// Verify a strict Ed25519 signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), IdentityError> {
        let signature = Signature::from_slice(signature)
            .map_err(|e| IdentityError::InvalidSignature(e.to_string()))?;
        self.0
            .verify_strict(message, &signature)
            .map_err(|_| IdentityError::VerificationFailed)
    }

    /// Verify a hex-encoded signature, as carried on the wire.
    pub fn verify_hex(&self, message: &[u8], signature_hex: &str) -> Result<(), IdentityError> {
        let signature = hex::decode(signature_hex)
            .map_err(|e| IdentityError::InvalidSignature(e.to_string()))?;
        self.verify(message, &signature)
    }

    fn to_x25519(self) -> X25519PublicKey {
        X25519PublicKey::from(self.0.to_montgomery().to_bytes())
    }
}

impl std::fmt::Debug for PeerPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerPublicKey({})", self.to_hex())
    }
}

/// The local host's long-term identity.
///
/// Immutable once created. Share it with `Arc`; it is never cloned so the
/// private key exists in exactly one place per process.
pub struct PeerIdentity {
    signing_key: SigningKey,
    agreement_secret: StaticSecret,
    public_key: PeerPublicKey,
    fingerprint: String,
}

impl PeerIdentity {
    /// Generate a fresh identity from the thread-local CSPRNG.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        let identity = Self::from_signing_key(SigningKey::from_bytes(&seed));
        seed.zeroize();
        identity
    }

    /// Restore an identity from its 32-byte Ed25519 seed.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        let mut seed: [u8; 32] = bytes.try_into().map_err(|_| {
            IdentityError::InvalidSecretKey(format!("expected 32 bytes, got {}", bytes.len()))
        })?;
        let identity = Self::from_signing_key(SigningKey::from_bytes(&seed));
        seed.zeroize();
        Ok(identity)
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let agreement_secret = StaticSecret::from(signing_key.to_scalar_bytes());
        let public_key = PeerPublicKey(signing_key.verifying_key());
        let fingerprint = public_key.fingerprint();
        Self {
            signing_key,
            agreement_secret,
            public_key,
            fingerprint,
        }
    }

    /// Export the seed for persistence.
    ///
    /// # Security Warning
    /// Only the keystore should call this.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    pub fn public_key_hex(&self) -> String {
        self.public_key.to_hex()
    }

    /// Sign and hex encode, for wire fields.
    pub fn sign_hex(&self, message: &[u8]) -> String {
        hex::encode(Signer::sign(self, message))
    }
}

impl Signer for PeerIdentity {
    fn public_key(&self) -> &PeerPublicKey {
        &self.public_key
    }

    fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl KeyAgreement for PeerIdentity {
    /// Static-static X25519 followed by BLAKE2b over the DH output and both
    /// public keys in sorted order, so both ends derive the same key.
    fn derive_shared_secret(&self, other: &PeerPublicKey) -> Result<SharedSecret, IdentityError> {
        let dh = self.agreement_secret.diffie_hellman(&other.to_x25519());
        if !dh.was_contributory() {
            return Err(IdentityError::WeakKeyAgreement);
        }

        let ours = self.public_key.to_bytes();
        let theirs = other.to_bytes();
        let (lo, hi) = if ours <= theirs {
            (ours, theirs)
        } else {
            (theirs, ours)
        };

        let mut hasher = Blake2b512::new();
        hasher.update(SESSION_KDF_DOMAIN);
        hasher.update(dh.as_bytes());
        hasher.update(lo);
        hasher.update(hi);
        let mut digest = hasher.finalize();

        let secret = SharedSecret::from_slice(&digest[..32])
            .ok_or(IdentityError::WeakKeyAgreement)?;
        digest.as_mut_slice().zeroize();
        Ok(secret)
    }
}

impl std::fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print private key material
        f.debug_struct("PeerIdentity")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}
