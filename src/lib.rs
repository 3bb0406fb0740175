//! Secure mesh transport
//!
//! Peer-to-peer messaging between hosts that discover each other on a LAN or
//! a tunnel network, with no central server. Each host owns a long-term
//! Ed25519 identity; connections prove possession of it with a
//! challenge-response handshake and then exchange signed or encrypted
//! envelopes.
//!
//! ## Key Components
//!
//! - **Identity**: Ed25519 keypair, its X25519 form for key agreement, and a
//!   short fingerprint
//! - **Keystore**: persisted identity and revocation list
//! - **Encryption**: XChaCha20-Poly1305 session encryption
//! - **Auth**: challenge-response handshake and envelope signatures
//! - **TLS**: optional self-signed transport encryption
//! - **Transport**: client and server connection objects
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use secure_mesh::{
//!     Host, Keystore, MeshSecurityConfig, SecureTransportClient, SecureTransportServer,
//!     TransportMessage,
//! };
//!
//! # async fn run() -> secure_mesh::Result<()> {
//! let keystore = Arc::new(Keystore::open("/tmp/mesh-a")?);
//! let identity = Arc::new(keystore.load_or_create_identity()?);
//! let config = Arc::new(MeshSecurityConfig::default());
//!
//! let server = SecureTransportServer::new(9876, config.clone(), Some(identity.clone()))?
//!     .with_keystore(keystore.clone());
//! server.start().await?;
//!
//! let client = SecureTransportClient::new(
//!     Host::new("peer", "127.0.0.1", 9876),
//!     config,
//!     Some(identity),
//! )?;
//! client.connect().await?;
//! client
//!     .send(TransportMessage::new("ping", serde_json::json!("x")))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod encryption;
pub mod error;
pub mod host;
pub mod identity;
pub mod keystore;
pub mod security;
pub mod tls;
pub mod transport;
pub mod utils;

pub use auth::{AuthChallenge, AuthChallengeResponse, AuthError, AuthManager, VerifiedPeer};
pub use config::{
    ConfigError, EncryptionMode, MeshSecurityConfig, SecurityPreset, TlsMode, TransportOptions,
    TransportSecurity,
};
pub use encryption::{EncryptedPayload, EncryptionError, MessageEncryption};
pub use error::{MeshError, Result};
pub use host::{Host, HostStatus};
pub use identity::{IdentityError, KeyAgreement, PeerIdentity, PeerPublicKey, Signer};
pub use keystore::{Keystore, KeystoreError, RevocationEntry};
pub use tls::{CertificateInfo, TlsError, TlsManager};
pub use transport::{
    ConnectionId, ConnectionState, InboundMessage, PeerSummary, SecureTransportClient,
    SecureTransportServer, Subscription, TransportError, TransportMessage,
};
