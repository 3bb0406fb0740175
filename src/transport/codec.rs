//! Per-connection choice of wire form, and the inbound acceptance rules.

use std::sync::Arc;

use super::messages::{EncryptedEnvelope, Frame, TransportMessage};
use crate::auth::{sign_envelope, verify_envelope, AuthError, VerifiedPeer};
use crate::config::{EncryptionMode, MeshSecurityConfig};
use crate::encryption::{EncryptionError, MessageEncryption};
use crate::identity::{IdentityError, KeyAgreement, PeerIdentity, Signer};
use crate::security::constant_time_eq_str;

/// Why an inbound envelope was not delivered.
#[derive(Debug, thiserror::Error)]
pub enum DropReason {
    #[error("handshake frame after the handshake")]
    UnexpectedAuth,

    #[error("unencrypted envelope while encryption is required")]
    EncryptionRequired,

    #[error("unsigned envelope on an authenticated connection")]
    SignatureRequired,

    #[error("encrypted envelope but no session is established")]
    NoSession,

    #[error("sender {claimed} is not the authenticated peer")]
    SenderMismatch { claimed: String },

    #[error("signature check failed: {0}")]
    BadSignature(#[from] AuthError),

    #[error("decryption failed: {0}")]
    Decrypt(#[from] EncryptionError),
}

/// Encodes outbound and vets inbound application messages for one
/// connection.
#[derive(Debug)]
pub struct WireCodec {
    identity: Option<Arc<PeerIdentity>>,
    encryption: EncryptionMode,
    require_auth: bool,
    peer: Option<VerifiedPeer>,
    session: Option<MessageEncryption>,
}

impl WireCodec {
    pub fn new(identity: Option<Arc<PeerIdentity>>, config: &MeshSecurityConfig) -> Self {
        Self {
            identity,
            encryption: config.encryption(),
            require_auth: config.require_auth(),
            peer: None,
            session: None,
        }
    }

    /// Record the authenticated remote peer and, unless encryption is off,
    /// derive the session from its key.
    pub fn establish(&mut self, peer: VerifiedPeer) -> Result<(), IdentityError> {
        if self.encryption != EncryptionMode::None {
            if let Some(identity) = &self.identity {
                let secret = identity.derive_shared_secret(&peer.public_key)?;
                self.session = Some(MessageEncryption::new(&secret));
            }
        }
        self.peer = Some(peer);
        Ok(())
    }

    pub fn peer(&self) -> Option<&VerifiedPeer> {
        self.peer.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.peer.is_some()
    }

    pub fn is_encrypted(&self) -> bool {
        self.session.is_some()
    }

    /// Encrypted when a session exists and encryption is required, signed
    /// when we have an identity, plain otherwise.
    pub fn encode(&self, message: TransportMessage) -> Result<Frame, super::TransportError> {
        if let (Some(session), EncryptionMode::Required) = (&self.session, self.encryption) {
            let sealed = session.encrypt_object(&message)?;
            return Ok(Frame::Encrypted(EncryptedEnvelope {
                id: message.id,
                sender_fingerprint: self.local_fingerprint(),
                nonce: sealed.nonce,
                ciphertext: sealed.ciphertext,
                timestamp: message.timestamp,
            }));
        }

        match &self.identity {
            Some(identity) => Ok(Frame::Signed(sign_envelope(identity.as_ref(), message)?)),
            None => Ok(Frame::Plain(message)),
        }
    }

    /// Accept or drop an inbound frame. Returns the message and the sender's
    /// fingerprint when one is known.
    pub fn decode(&self, frame: Frame) -> Result<(TransportMessage, Option<String>), DropReason> {
        match frame {
            Frame::Auth(_) => Err(DropReason::UnexpectedAuth),
            Frame::Encrypted(envelope) => {
                let session = self.session.as_ref().ok_or(DropReason::NoSession)?;
                self.check_sender(&envelope.sender_fingerprint)?;
                let message: TransportMessage =
                    session.decrypt_to_object(&envelope.ciphertext, &envelope.nonce)?;
                Ok((message, self.peer_fingerprint(envelope.sender_fingerprint)))
            }
            Frame::Signed(envelope) => {
                if self.encryption == EncryptionMode::Required {
                    return Err(DropReason::EncryptionRequired);
                }
                let sender = verify_envelope(&envelope)?;
                self.check_sender(&sender)?;
                Ok((envelope.message, Some(sender)))
            }
            Frame::Plain(message) => {
                if self.encryption == EncryptionMode::Required {
                    return Err(DropReason::EncryptionRequired);
                }
                if self.require_auth {
                    return Err(DropReason::SignatureRequired);
                }
                Ok((message, None))
            }
        }
    }

    fn check_sender(&self, claimed: &str) -> Result<(), DropReason> {
        match &self.peer {
            Some(peer) if !constant_time_eq_str(&peer.fingerprint, &claimed.to_ascii_lowercase()) => {
                Err(DropReason::SenderMismatch {
                    claimed: claimed.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    fn peer_fingerprint(&self, fallback: String) -> Option<String> {
        Some(
            self.peer
                .as_ref()
                .map(|peer| peer.fingerprint.clone())
                .unwrap_or(fallback),
        )
    }

    fn local_fingerprint(&self) -> String {
        self.identity
            .as_ref()
            .map(|identity| identity.fingerprint().to_string())
            .unwrap_or_default()
    }
}
