//! Challenge-response authentication.
//!
//! ```text
//! server                                   client
//!   | -- auth:challenge {challenge, ts} ----> |
//!   |                                         |  sign(challenge)
//!   | <-- auth:response {challenge, sig,  --- |
//!   |       publicKey, fingerprint, ts}       |
//!   |  check age, binding, fingerprint,       |
//!   |  signature, revocation                  |
//!   | -- auth:success | auth:failed --------> |
//! ```
//!
//! A challenge is bound to the connection it was issued on: the server only
//! ever verifies a response against the challenge it holds for that socket,
//! so a response captured elsewhere cannot be replayed.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::TransportOptions;
use crate::identity::{PeerIdentity, PeerPublicKey, Signer};
use crate::keystore::Keystore;
use crate::security::constant_time_eq_str;
use crate::transport::messages::{envelope_signing_bytes, SignedEnvelope, TransportMessage};
use crate::utils::{millis_apart, now_millis, random_hex};

/// Random bytes in a challenge nonce
pub const CHALLENGE_BYTES: usize = 32;
/// Random bytes in an envelope nonce
pub const ENVELOPE_NONCE_BYTES: usize = 16;

const SERVER_PROOF_DOMAIN: &[u8] = b"secure-mesh-server-proof-v1:";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("challenge response expired ({age_ms} ms old)")]
    Expired { age_ms: u64 },

    #[error("challenge response is timestamped in the future")]
    FromFuture,

    #[error("response does not answer the challenge issued on this connection")]
    ChallengeMismatch,

    #[error("fingerprint does not match public key")]
    FingerprintMismatch,

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("peer {0} is revoked")]
    Revoked(String),

    #[error("challenge timestamp is implausible ({skew_ms} ms from local clock)")]
    ImplausibleChallenge { skew_ms: u64 },

    #[error("malformed challenge")]
    MalformedChallenge,

    #[error("handshake already completed")]
    AlreadyCompleted,

    #[error("handshake abandoned: {0}")]
    Abandoned(String),

    #[error("failed to encode signed data: {0}")]
    Encoding(String),
}

/// Issued by the server, one per connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthChallenge {
    pub challenge: String,
    pub timestamp: u64,
}

/// The client's signed answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthChallengeResponse {
    pub challenge: String,
    pub signature: String,
    pub public_key: String,
    pub fingerprint: String,
    pub timestamp: u64,
}

/// A peer that has proven possession of its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPeer {
    pub fingerprint: String,
    pub public_key: PeerPublicKey,
}

/// Server-side handshake state for one connection.
#[derive(Debug, Clone)]
pub enum HandshakeState {
    AwaitingResponse(AuthChallenge),
    Verified(VerifiedPeer),
    Rejected(AuthError),
}

impl HandshakeState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, HandshakeState::AwaitingResponse(_))
    }
}

/// Issues, answers and verifies challenges for one local identity.
#[derive(Debug, Clone)]
pub struct AuthManager {
    identity: Arc<PeerIdentity>,
    keystore: Option<Arc<Keystore>>,
    handshake_timeout: Duration,
    max_clock_skew: Duration,
}

impl AuthManager {
    pub fn new(identity: Arc<PeerIdentity>, options: &TransportOptions) -> Self {
        Self {
            identity,
            keystore: None,
            handshake_timeout: options.handshake_timeout,
            max_clock_skew: options.max_clock_skew,
        }
    }

    /// Consult this keystore's revocation list during verification.
    pub fn with_keystore(mut self, keystore: Arc<Keystore>) -> Self {
        self.keystore = Some(keystore);
        self
    }

    pub fn identity(&self) -> &Arc<PeerIdentity> {
        &self.identity
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    pub fn create_challenge(&self) -> AuthChallenge {
        AuthChallenge {
            challenge: random_hex(CHALLENGE_BYTES),
            timestamp: now_millis(),
        }
    }

    /// Begin the server side of a handshake.
    pub fn begin(&self) -> ServerHandshake<'_> {
        ServerHandshake {
            manager: self,
            state: HandshakeState::AwaitingResponse(self.create_challenge()),
        }
    }

    /// Verify `response` against the challenge issued on this connection.
    pub fn verify_challenge_response(
        &self,
        issued: &AuthChallenge,
        response: &AuthChallengeResponse,
    ) -> Result<VerifiedPeer, AuthError> {
        let now = now_millis();
        let timeout_ms = self.handshake_timeout.as_millis() as u64;

        if response.timestamp > now.saturating_add(self.max_clock_skew.as_millis() as u64) {
            return Err(AuthError::FromFuture);
        }
        let age_ms = now.saturating_sub(response.timestamp);
        if age_ms > timeout_ms {
            return Err(AuthError::Expired { age_ms });
        }
        let issued_age_ms = now.saturating_sub(issued.timestamp);
        if issued_age_ms > timeout_ms {
            return Err(AuthError::Expired {
                age_ms: issued_age_ms,
            });
        }

        if !constant_time_eq_str(&response.challenge, &issued.challenge) {
            return Err(AuthError::ChallengeMismatch);
        }

        let public_key = PeerPublicKey::from_hex(&response.public_key)
            .map_err(|e| AuthError::InvalidPublicKey(e.to_string()))?;
        let fingerprint = public_key.fingerprint();
        if !constant_time_eq_str(&fingerprint, &response.fingerprint.to_ascii_lowercase()) {
            return Err(AuthError::FingerprintMismatch);
        }

        public_key
            .verify_hex(issued.challenge.as_bytes(), &response.signature)
            .map_err(|_| AuthError::InvalidSignature)?;

        if let Some(keystore) = &self.keystore {
            if keystore.is_revoked(&fingerprint) {
                return Err(AuthError::Revoked(fingerprint));
            }
        }

        Ok(VerifiedPeer {
            fingerprint,
            public_key,
        })
    }

    /// Client side: sign a server's challenge.
    pub fn respond_to_challenge(
        &self,
        challenge: &AuthChallenge,
    ) -> Result<AuthChallengeResponse, AuthError> {
        let now = now_millis();
        let skew = millis_apart(now, challenge.timestamp);
        if skew > self.handshake_timeout + self.max_clock_skew {
            return Err(AuthError::ImplausibleChallenge {
                skew_ms: skew.as_millis() as u64,
            });
        }

        // Only ever sign a well-formed nonce, never arbitrary peer-chosen bytes.
        let well_formed = challenge.challenge.len() == CHALLENGE_BYTES * 2
            && challenge.challenge.bytes().all(|b| b.is_ascii_hexdigit());
        if !well_formed {
            return Err(AuthError::MalformedChallenge);
        }

        Ok(AuthChallengeResponse {
            challenge: challenge.challenge.clone(),
            signature: self.identity.sign_hex(challenge.challenge.as_bytes()),
            public_key: self.identity.public_key_hex(),
            fingerprint: self.identity.fingerprint().to_string(),
            timestamp: now,
        })
    }
}

/// One connection's handshake, from issued challenge to a terminal state.
pub struct ServerHandshake<'a> {
    manager: &'a AuthManager,
    state: HandshakeState,
}

impl ServerHandshake<'_> {
    /// The challenge to send, while still awaiting a response.
    pub fn challenge(&self) -> Option<&AuthChallenge> {
        match &self.state {
            HandshakeState::AwaitingResponse(challenge) => Some(challenge),
            _ => None,
        }
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    /// Consume the one response this connection is allowed.
    pub fn complete(&mut self, response: &AuthChallengeResponse) -> Result<VerifiedPeer, AuthError> {
        let HandshakeState::AwaitingResponse(issued) = &self.state else {
            return Err(AuthError::AlreadyCompleted);
        };

        let result = self.manager.verify_challenge_response(issued, response);
        self.state = match &result {
            Ok(peer) => HandshakeState::Verified(peer.clone()),
            Err(e) => HandshakeState::Rejected(e.clone()),
        };
        result
    }

    /// Mark the handshake rejected without a verified response, e.g. on
    /// timeout or an unexpected frame.
    pub fn reject(&mut self, error: AuthError) {
        if !self.state.is_terminal() {
            self.state = HandshakeState::Rejected(error);
        }
    }
}

fn server_proof_bytes(challenge: &AuthChallenge, client_fingerprint: &str) -> Vec<u8> {
    let mut bytes = SERVER_PROOF_DOMAIN.to_vec();
    bytes.extend_from_slice(challenge.challenge.as_bytes());
    bytes.push(b':');
    bytes.extend_from_slice(client_fingerprint.as_bytes());
    bytes
}

impl AuthManager {
    /// Server side: sign the finished exchange so the client can check the
    /// advertised server key.
    pub fn prove_identity(&self, challenge: &AuthChallenge, client_fingerprint: &str) -> String {
        self.identity
            .sign_hex(&server_proof_bytes(challenge, client_fingerprint))
    }

    /// Client side: check an `auth:success` frame.
    pub fn verify_server(
        &self,
        challenge: &AuthChallenge,
        server_public_key: &str,
        server_fingerprint: &str,
        proof: &str,
    ) -> Result<VerifiedPeer, AuthError> {
        let public_key = PeerPublicKey::from_hex(server_public_key)
            .map_err(|e| AuthError::InvalidPublicKey(e.to_string()))?;
        let fingerprint = public_key.fingerprint();
        if !constant_time_eq_str(&fingerprint, &server_fingerprint.to_ascii_lowercase()) {
            return Err(AuthError::FingerprintMismatch);
        }

        public_key
            .verify_hex(
                &server_proof_bytes(challenge, self.identity.fingerprint()),
                proof,
            )
            .map_err(|_| AuthError::InvalidSignature)?;

        if let Some(keystore) = &self.keystore {
            if keystore.is_revoked(&fingerprint) {
                return Err(AuthError::Revoked(fingerprint));
            }
        }

        Ok(VerifiedPeer {
            fingerprint,
            public_key,
        })
    }
}

/// Sign `message` under a fresh nonce.
pub fn sign_envelope<S: Signer + ?Sized>(
    signer: &S,
    message: TransportMessage,
) -> Result<SignedEnvelope, AuthError> {
    let nonce = random_hex(ENVELOPE_NONCE_BYTES);
    let bytes =
        envelope_signing_bytes(&message, &nonce).map_err(|e| AuthError::Encoding(e.to_string()))?;
    Ok(SignedEnvelope {
        signature: hex::encode(signer.sign(&bytes)),
        sender_fingerprint: signer.fingerprint().to_string(),
        sender_public_key: signer.public_key().to_hex(),
        nonce,
        message,
    })
}

/// Check a signed envelope and return the sender's fingerprint.
pub fn verify_envelope(envelope: &SignedEnvelope) -> Result<String, AuthError> {
    let public_key = PeerPublicKey::from_hex(&envelope.sender_public_key)
        .map_err(|e| AuthError::InvalidPublicKey(e.to_string()))?;
    let fingerprint = public_key.fingerprint();
    if !constant_time_eq_str(
        &fingerprint,
        &envelope.sender_fingerprint.to_ascii_lowercase(),
    ) {
        return Err(AuthError::FingerprintMismatch);
    }

    let bytes = envelope_signing_bytes(&envelope.message, &envelope.nonce)
        .map_err(|e| AuthError::Encoding(e.to_string()))?;
    public_key
        .verify_hex(&bytes, &envelope.signature)
        .map_err(|_| AuthError::InvalidSignature)?;
    Ok(fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> AuthManager {
        AuthManager::new(
            Arc::new(PeerIdentity::generate()),
            &TransportOptions::default(),
        )
    }

    fn flip_hex_bit(encoded: &str, index: usize) -> String {
        let mut raw = hex::decode(encoded).unwrap();
        raw[index] ^= 0x01;
        hex::encode(raw)
    }

    #[test]
    fn test_handshake_round_trip() {
        let server = manager();
        let client = manager();

        let challenge = server.create_challenge();
        let response = client.respond_to_challenge(&challenge).unwrap();
        let peer = server.verify_challenge_response(&challenge, &response).unwrap();

        assert_eq!(peer.fingerprint, client.identity().fingerprint());
        assert_eq!(&peer.public_key, client.identity().public_key());
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let server = manager();
        let client = manager();
        let challenge = server.create_challenge();
        let response = client.respond_to_challenge(&challenge).unwrap();

        for index in [0, 17, 63] {
            let mut forged = response.clone();
            forged.signature = flip_hex_bit(&response.signature, index);
            assert!(server.verify_challenge_response(&challenge, &forged).is_err());
        }
    }

    #[test]
    fn test_tampered_public_key_rejected() {
        let server = manager();
        let client = manager();
        let challenge = server.create_challenge();
        let response = client.respond_to_challenge(&challenge).unwrap();

        for index in [0, 9, 31] {
            let mut forged = response.clone();
            forged.public_key = flip_hex_bit(&response.public_key, index);
            assert!(server.verify_challenge_response(&challenge, &forged).is_err());
        }

        // Swapping in another valid key with a matching fingerprint still
        // fails on the signature.
        let other = PeerIdentity::generate();
        let mut forged = response.clone();
        forged.public_key = other.public_key_hex();
        forged.fingerprint = other.fingerprint().to_string();
        assert_eq!(
            server.verify_challenge_response(&challenge, &forged),
            Err(AuthError::InvalidSignature)
        );
    }

    #[test]
    fn test_fingerprint_mismatch_rejected() {
        let server = manager();
        let client = manager();
        let challenge = server.create_challenge();
        let mut response = client.respond_to_challenge(&challenge).unwrap();
        response.fingerprint = "00".repeat(16);

        assert_eq!(
            server.verify_challenge_response(&challenge, &response),
            Err(AuthError::FingerprintMismatch)
        );
    }

    #[test]
    fn test_replayed_response_rejected() {
        let server = manager();
        let client = manager();

        let first = server.create_challenge();
        let response = client.respond_to_challenge(&first).unwrap();
        assert!(server.verify_challenge_response(&first, &response).is_ok());

        let second = server.create_challenge();
        assert_eq!(
            server.verify_challenge_response(&second, &response),
            Err(AuthError::ChallengeMismatch)
        );

        // Rewriting the challenge field does not help without a new signature.
        let mut rewritten = response.clone();
        rewritten.challenge = second.challenge.clone();
        assert_eq!(
            server.verify_challenge_response(&second, &rewritten),
            Err(AuthError::InvalidSignature)
        );
    }

    #[test]
    fn test_expired_response_rejected() {
        let server = manager();
        let client = manager();
        let challenge = server.create_challenge();
        let mut response = client.respond_to_challenge(&challenge).unwrap();
        response.timestamp -= 60_000;

        assert!(matches!(
            server.verify_challenge_response(&challenge, &response),
            Err(AuthError::Expired { .. })
        ));
    }

    #[test]
    fn test_revoked_peer_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let keystore = Arc::new(Keystore::open(dir.path()).unwrap());
        let server = manager().with_keystore(keystore.clone());
        let client = manager();

        keystore
            .revoke(client.identity().fingerprint(), None)
            .unwrap();

        let challenge = server.create_challenge();
        let response = client.respond_to_challenge(&challenge).unwrap();
        assert_eq!(
            server.verify_challenge_response(&challenge, &response),
            Err(AuthError::Revoked(client.identity().fingerprint().to_string()))
        );
    }

    #[test]
    fn test_client_refuses_stale_or_malformed_challenge() {
        let client = manager();

        let stale = AuthChallenge {
            challenge: random_hex(CHALLENGE_BYTES),
            timestamp: now_millis() - 3_600_000,
        };
        assert!(matches!(
            client.respond_to_challenge(&stale),
            Err(AuthError::ImplausibleChallenge { .. })
        ));

        let future = AuthChallenge {
            challenge: random_hex(CHALLENGE_BYTES),
            timestamp: now_millis() + 3_600_000,
        };
        assert!(client.respond_to_challenge(&future).is_err());

        let arbitrary = AuthChallenge {
            challenge: "please sign this".to_string(),
            timestamp: now_millis(),
        };
        assert_eq!(
            client.respond_to_challenge(&arbitrary),
            Err(AuthError::MalformedChallenge)
        );
    }

    #[test]
    fn test_server_handshake_is_single_use() {
        let server = manager();
        let client = manager();

        let mut handshake = server.begin();
        let challenge = handshake.challenge().cloned().unwrap();
        let response = client.respond_to_challenge(&challenge).unwrap();

        assert!(handshake.complete(&response).is_ok());
        assert!(matches!(handshake.state(), HandshakeState::Verified(_)));
        assert!(handshake.challenge().is_none());
        assert_eq!(
            handshake.complete(&response),
            Err(AuthError::AlreadyCompleted)
        );
    }

    #[test]
    fn test_rejected_handshake_is_terminal() {
        let server = manager();
        let mut handshake = server.begin();
        handshake.reject(AuthError::Abandoned("handshake timed out".into()));
        assert!(matches!(
            handshake.state(),
            HandshakeState::Rejected(AuthError::Abandoned(_))
        ));
        // A second rejection does not overwrite the first.
        handshake.reject(AuthError::InvalidSignature);
        assert!(matches!(
            handshake.state(),
            HandshakeState::Rejected(AuthError::Abandoned(_))
        ));

        let client = manager();
        let challenge = server.create_challenge();
        let response = client.respond_to_challenge(&challenge).unwrap();
        assert_eq!(
            handshake.complete(&response),
            Err(AuthError::AlreadyCompleted)
        );
    }

    #[test]
    fn test_server_proof_binds_challenge_and_client() {
        let server = manager();
        let client = manager();
        let challenge = server.create_challenge();

        let proof = server.prove_identity(&challenge, client.identity().fingerprint());
        let peer = client
            .verify_server(
                &challenge,
                &server.identity().public_key_hex(),
                server.identity().fingerprint(),
                &proof,
            )
            .unwrap();
        assert_eq!(peer.fingerprint, server.identity().fingerprint());

        // A proof made for another client does not transfer.
        let other = manager();
        assert_eq!(
            other.verify_server(
                &challenge,
                &server.identity().public_key_hex(),
                server.identity().fingerprint(),
                &proof,
            ),
            Err(AuthError::InvalidSignature)
        );

        // An impostor advertising its own key cannot reuse the proof.
        let impostor = manager();
        assert!(client
            .verify_server(
                &challenge,
                &impostor.identity().public_key_hex(),
                impostor.identity().fingerprint(),
                &proof,
            )
            .is_err());
    }

    #[test]
    fn test_envelope_sign_and_verify() {
        let identity = PeerIdentity::generate();
        let message = TransportMessage::new("ping", serde_json::json!({"n": 1}));
        let envelope = sign_envelope(&identity, message).unwrap();

        assert_eq!(verify_envelope(&envelope).unwrap(), identity.fingerprint());

        let mut tampered = envelope.clone();
        tampered.message.payload = serde_json::json!({"n": 2});
        assert_eq!(verify_envelope(&tampered), Err(AuthError::InvalidSignature));

        let mut renonced = envelope.clone();
        renonced.nonce = random_hex(ENVELOPE_NONCE_BYTES);
        assert_eq!(verify_envelope(&renonced), Err(AuthError::InvalidSignature));

        let other = PeerIdentity::generate();
        let mut reattributed = envelope;
        reattributed.sender_fingerprint = other.fingerprint().to_string();
        assert_eq!(
            verify_envelope(&reattributed),
            Err(AuthError::FingerprintMismatch)
        );
    }
}
