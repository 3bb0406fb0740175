/// Error types for the secure mesh library
use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::encryption::EncryptionError;
use crate::identity::IdentityError;
use crate::keystore::KeystoreError;
use crate::tls::TlsError;
use crate::transport::{FrameError, TransportError};

/// Any error the crate can produce.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Keystore(#[from] KeystoreError),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, MeshError>;
