//! Wire frames.
//!
//! Every frame is one JSON object. Handshake frames carry a `type` in the
//! reserved `auth:` namespace; application envelopes come in three forms:
//!
//! | form      | distinguishing fields                         |
//! |-----------|-----------------------------------------------|
//! | plain     | `type`, no `signature`                        |
//! | signed    | `signature`, `senderFingerprint`, `nonce`     |
//! | encrypted | `ciphertext`, `nonce`, no `type`              |

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::framing::FrameError;
use crate::auth::{AuthChallenge, AuthChallengeResponse};
use crate::utils::{now_millis, random_hex};

/// Message types starting with this prefix belong to the handshake.
pub const AUTH_TYPE_PREFIX: &str = "auth:";

const ENVELOPE_SIGNING_DOMAIN: &[u8] = b"secure-mesh-envelope-v1:";

/// An application message. The payload is opaque to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportMessage {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub timestamp: u64,
}

impl TransportMessage {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: String::new(),
            kind: kind.into(),
            from: String::new(),
            to: None,
            payload,
            timestamp: 0,
        }
    }

    pub fn to(mut self, recipient: impl Into<String>) -> Self {
        self.to = Some(recipient.into());
        self
    }

    /// Assign an id and timestamp where the caller left them empty.
    pub fn fill_defaults(&mut self) {
        if self.id.is_empty() {
            self.id = random_hex(16);
        }
        if self.timestamp == 0 {
            self.timestamp = now_millis();
        }
    }

    pub fn is_reserved(&self) -> bool {
        self.kind.starts_with(AUTH_TYPE_PREFIX)
    }
}

/// A message signed by its sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedEnvelope {
    #[serde(flatten)]
    pub message: TransportMessage,
    pub signature: String,
    pub sender_fingerprint: String,
    pub sender_public_key: String,
    pub nonce: String,
}

/// A message sealed under the connection's session key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    pub id: String,
    pub sender_fingerprint: String,
    pub nonce: String,
    pub ciphertext: String,
    pub timestamp: u64,
}

/// Handshake frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AuthFrame {
    #[serde(rename = "auth:challenge")]
    Challenge(AuthChallenge),

    #[serde(rename = "auth:response")]
    Response(AuthChallengeResponse),

    /// `proof` is the server's signature over the challenge and the client's
    /// fingerprint, so the client knows the advertised key is really held.
    #[serde(rename = "auth:success", rename_all = "camelCase")]
    Success {
        server_fingerprint: String,
        server_public_key: String,
        proof: String,
    },

    #[serde(rename = "auth:failed")]
    Failed { error: String },
}

impl AuthFrame {
    pub fn type_name(&self) -> &'static str {
        match self {
            AuthFrame::Challenge(_) => "auth:challenge",
            AuthFrame::Response(_) => "auth:response",
            AuthFrame::Success { .. } => "auth:success",
            AuthFrame::Failed { .. } => "auth:failed",
        }
    }
}

/// Any decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Auth(AuthFrame),
    Plain(TransportMessage),
    Signed(SignedEnvelope),
    Encrypted(EncryptedEnvelope),
}

impl Frame {
    pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let object = value
            .as_object()
            .ok_or_else(|| FrameError::Malformed("frame is not a JSON object".into()))?;

        let is_auth = object
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|t| t.starts_with(AUTH_TYPE_PREFIX));
        let has = |key: &str| object.contains_key(key);

        let frame = if is_auth {
            Frame::Auth(serde_json::from_value(value)?)
        } else if has("ciphertext") {
            Frame::Encrypted(serde_json::from_value(value)?)
        } else if has("signature") {
            Frame::Signed(serde_json::from_value(value)?)
        } else if has("type") {
            Frame::Plain(serde_json::from_value(value)?)
        } else {
            return Err(FrameError::Malformed(
                "frame has neither a type nor a ciphertext".into(),
            ));
        };
        Ok(frame)
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let bytes = match self {
            Frame::Auth(frame) => serde_json::to_vec(frame)?,
            Frame::Plain(message) => serde_json::to_vec(message)?,
            Frame::Signed(envelope) => serde_json::to_vec(envelope)?,
            Frame::Encrypted(envelope) => serde_json::to_vec(envelope)?,
        };
        Ok(bytes)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Auth(_) => "auth",
            Frame::Plain(_) => "plain",
            Frame::Signed(_) => "signed",
            Frame::Encrypted(_) => "encrypted",
        }
    }
}

/// Bytes covered by an envelope signature.
///
/// `payload` objects re-serialize with sorted keys, so sender and receiver
/// produce identical bytes from the same logical message.
pub fn envelope_signing_bytes(
    message: &TransportMessage,
    nonce: &str,
) -> Result<Vec<u8>, serde_json::Error> {
    #[derive(Serialize)]
    struct Signed<'a> {
        message: &'a TransportMessage,
        nonce: &'a str,
    }

    let mut bytes = ENVELOPE_SIGNING_DOMAIN.to_vec();
    serde_json::to_writer(&mut bytes, &Signed { message, nonce })?;
    Ok(bytes)
}
