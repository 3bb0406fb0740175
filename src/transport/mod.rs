//! Secure transport: framed JSON over TCP, optionally inside TLS, with a
//! challenge-response handshake and per-connection session encryption.
//!
//! ```text
//!   client                                         server
//!   ──────                                         ──────
//!   TCP connect ─────────────────────────────────▶ accept
//!   [TLS handshake] ◀──────────────────────────▶ [TLS accept]
//!               ◀──────────── auth:challenge ──── issue
//!   sign ─────── auth:response ─────────────────▶ verify, check revocation
//!               ◀──────────── auth:success ────── register client
//!   derive session                                 derive session
//!   envelopes ◀──────────────────────────────────▶ envelopes
//! ```

pub mod client;
pub mod codec;
pub mod framing;
pub mod messages;
pub mod server;
pub mod subscribers;

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::encryption::EncryptionError;
use crate::identity::IdentityError;
use crate::tls::TlsError;

pub use client::{ConnectionState, SecureTransportClient};
pub use codec::{DropReason, WireCodec};
pub use framing::{
    read_frame, read_frame_limited, write_frame, FrameError, MAX_FRAME_SIZE,
    MAX_HANDSHAKE_FRAME_SIZE,
};
pub use messages::{AuthFrame, EncryptedEnvelope, Frame, SignedEnvelope, TransportMessage};
pub use server::{PeerSummary, SecureTransportServer};
pub use subscribers::{HandlerRegistry, Subscription};

/// Process-unique id of one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    pub fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What subscribers receive.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message: TransportMessage,
    pub connection: ConnectionId,
    /// Verified sender, absent only for plain envelopes
    pub sender_fingerprint: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("connection is not authenticated")]
    NotAuthenticated,

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("authentication rejected by peer: {0}")]
    AuthRejected(String),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("handshake protocol error: {0}")]
    Handshake(String),

    #[error("gave up after {attempts} connection attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    #[error("message type '{0}' is reserved for the handshake")]
    ReservedType(String),

    #[error("server is already running")]
    AlreadyStarted,

    #[error("invalid TLS server name '{0}'")]
    InvalidServerName(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl TransportError {
    /// Errors that another attempt cannot fix: the peer has judged us, or
    /// our own setup is wrong.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            TransportError::AuthRejected(_)
                | TransportError::Auth(_)
                | TransportError::Identity(_)
                | TransportError::Tls(_)
                | TransportError::Config(_)
                | TransportError::InvalidServerName(_)
        )
    }
}

/// Read the next frame and require it to belong to the handshake.
pub(crate) async fn read_auth_frame<R>(reader: &mut R) -> Result<AuthFrame, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let bytes = read_frame_limited(reader, MAX_HANDSHAKE_FRAME_SIZE)
        .await?
        .ok_or_else(|| TransportError::Handshake("connection closed during handshake".into()))?;
    match Frame::decode(&bytes)? {
        Frame::Auth(frame) => Ok(frame),
        other => Err(TransportError::Handshake(format!(
            "unexpected {} frame during handshake",
            other.kind()
        ))),
    }
}

pub(crate) async fn write_auth_frame<W>(writer: &mut W, frame: AuthFrame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_frame(writer, &Frame::Auth(frame).encode()?).await?;
    Ok(())
}

/// Any byte stream the transport can run over: plain TCP or a TLS session.
pub(crate) trait MeshStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> MeshStream for T {}

pub(crate) type BoxedStream = Box<dyn MeshStream>;
