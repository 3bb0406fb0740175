//! Mesh security configuration and transport tuning.
//!
//! `MeshSecurityConfig` mirrors the JSON shape other mesh tools exchange:
//!
//! ```json
//! { "transport": { "tls": "self-signed", "requireAuth": true, "encryption": "required" } }
//! ```
//!
//! Validation happens at construction so an impossible combination is
//! reported before the first connection attempt.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration errors, always raised before any socket is opened.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("encryption '{0}' requires requireAuth=true: session keys are only agreed during the handshake")]
    EncryptionWithoutAuth(EncryptionMode),

    #[error("tls=custom requires both certPath and keyPath")]
    MissingCustomCertificate,

    #[error("invalid transport option: {0}")]
    InvalidOption(String),

    #[error("requireAuth=true needs a local peer identity")]
    MissingIdentity,

    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Transport-level TLS mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TlsMode {
    #[default]
    None,
    SelfSigned,
    Custom,
}

/// Application-level message encryption policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    None,
    Optional,
    #[default]
    Required,
}

impl std::fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EncryptionMode::None => "none",
            EncryptionMode::Optional => "optional",
            EncryptionMode::Required => "required",
        };
        f.write_str(s)
    }
}

/// The `transport` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportSecurity {
    #[serde(default)]
    pub tls: TlsMode,
    #[serde(default = "default_true")]
    pub require_auth: bool,
    #[serde(default)]
    pub encryption: EncryptionMode,
    /// PEM certificate used when `tls = custom`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_path: Option<PathBuf>,
    /// PEM private key used when `tls = custom`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

impl Default for TransportSecurity {
    fn default() -> Self {
        SecurityPreset::Secure.transport()
    }
}

/// Named security presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityPreset {
    /// No authentication, plain envelopes. Local experiments only.
    Development,
    /// Authenticated handshake, signed envelopes.
    Signed,
    /// Authenticated and encrypted envelopes.
    Secure,
    /// `Secure` plus a self-signed TLS wrapper.
    Strict,
}

impl SecurityPreset {
    fn transport(self) -> TransportSecurity {
        let (tls, require_auth, encryption) = match self {
            SecurityPreset::Development => (TlsMode::None, false, EncryptionMode::None),
            SecurityPreset::Signed => (TlsMode::None, true, EncryptionMode::None),
            SecurityPreset::Secure => (TlsMode::None, true, EncryptionMode::Required),
            SecurityPreset::Strict => (TlsMode::SelfSigned, true, EncryptionMode::Required),
        };
        TransportSecurity {
            tls,
            require_auth,
            encryption,
            cert_path: None,
            key_path: None,
        }
    }
}

impl std::str::FromStr for SecurityPreset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(SecurityPreset::Development),
            "signed" => Ok(SecurityPreset::Signed),
            "secure" => Ok(SecurityPreset::Secure),
            "strict" => Ok(SecurityPreset::Strict),
            other => Err(ConfigError::InvalidOption(format!(
                "unknown security preset '{}'",
                other
            ))),
        }
    }
}

/// Security configuration shared read-only by every client and server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MeshSecurityConfig {
    #[serde(default)]
    pub transport: TransportSecurity,
}

impl MeshSecurityConfig {
    /// Build and validate.
    pub fn new(transport: TransportSecurity) -> Result<Self, ConfigError> {
        let config = Self { transport };
        config.validate()?;
        Ok(config)
    }

    pub fn preset(preset: SecurityPreset) -> Self {
        Self {
            transport: preset.transport(),
        }
    }

    /// Load a JSON config file and validate it.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.transport;
        if t.encryption != EncryptionMode::None && !t.require_auth {
            return Err(ConfigError::EncryptionWithoutAuth(t.encryption));
        }
        if t.tls == TlsMode::Custom && (t.cert_path.is_none() || t.key_path.is_none()) {
            return Err(ConfigError::MissingCustomCertificate);
        }
        Ok(())
    }

    pub fn tls(&self) -> TlsMode {
        self.transport.tls
    }

    pub fn require_auth(&self) -> bool {
        self.transport.require_auth
    }

    pub fn encryption(&self) -> EncryptionMode {
        self.transport.encryption
    }
}

/// Timeouts and reconnect policy for one transport instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// Bound on TCP (and TLS) connection establishment
    pub connect_timeout: Duration,
    /// Bound on the full challenge/response exchange
    pub handshake_timeout: Duration,
    /// Extra tolerance for peer clocks when judging timestamps
    pub max_clock_skew: Duration,
    pub reconnect: bool,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    /// Multiply the interval by this factor after each failed attempt (1 = fixed)
    pub reconnect_backoff: u32,
    pub max_reconnect_interval: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            max_clock_skew: Duration::from_secs(30),
            reconnect: true,
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_attempts: 10,
            reconnect_backoff: 1,
            max_reconnect_interval: Duration::from_secs(60),
        }
    }
}

impl TransportOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidOption(
                "connect_timeout must be non-zero".into(),
            ));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::InvalidOption(
                "handshake_timeout must be non-zero".into(),
            ));
        }
        if self.reconnect && self.reconnect_interval.is_zero() {
            return Err(ConfigError::InvalidOption(
                "reconnect_interval must be non-zero when reconnect is enabled".into(),
            ));
        }
        if self.reconnect_backoff == 0 {
            return Err(ConfigError::InvalidOption(
                "reconnect_backoff must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = self
            .reconnect_backoff
            .saturating_pow(attempt.saturating_sub(1));
        self.reconnect_interval
            .saturating_mul(factor)
            .min(self.max_reconnect_interval.max(self.reconnect_interval))
    }
}
