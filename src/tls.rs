//! TLS material for the transport.
//!
//! Certificates are self-signed and keyed by host id. Clients accept any
//! server certificate: TLS here only hides traffic from passive observers,
//! peer trust is established by the challenge-response handshake that runs
//! inside the tunnel.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::utils::sanitize_file_component;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("TLS file error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("no certificate found in {0}")]
    NoCertificate(String),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("invalid PEM in {what}: {source}")]
    Pem {
        what: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS configuration error: {0}")]
    Rustls(#[from] rustls::Error),
}

impl TlsError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        TlsError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// PEM certificate and private key.
#[derive(Clone)]
pub struct CertificateInfo {
    pub cert: String,
    pub key: String,
}

impl CertificateInfo {
    /// Parse the certificate chain and key into DER for rustls.
    pub fn to_der(
        &self,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsError> {
        let certs = rustls_pemfile::certs(&mut self.cert.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| TlsError::Pem {
                what: "certificate".into(),
                source,
            })?;
        if certs.is_empty() {
            return Err(TlsError::NoCertificate("certificate PEM".into()));
        }

        let key = rustls_pemfile::private_key(&mut self.key.as_bytes())
            .map_err(|source| TlsError::Pem {
                what: "private key".into(),
                source,
            })?
            .ok_or_else(|| TlsError::NoPrivateKey("key PEM".into()))?;

        Ok((certs, key))
    }
}

impl std::fmt::Debug for CertificateInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateInfo")
            .field("cert_len", &self.cert.len())
            .finish_non_exhaustive()
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Loads or generates per-host certificates under one directory.
#[derive(Debug, Clone)]
pub struct TlsManager {
    dir: PathBuf,
}

impl TlsManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn paths(&self, host_id: &str) -> (PathBuf, PathBuf) {
        let stem = sanitize_file_component(host_id);
        (
            self.dir.join(format!("{stem}.crt")),
            self.dir.join(format!("{stem}.key")),
        )
    }

    /// Return the stored certificate for `host_id`, generating one on first use.
    pub fn load_or_create_certificate(
        &self,
        host_id: &str,
        common_name: &str,
    ) -> Result<CertificateInfo, TlsError> {
        let (cert_path, key_path) = self.paths(host_id);
        if cert_path.exists() && key_path.exists() {
            debug!(host_id, path = %cert_path.display(), "Reusing stored certificate");
            return self.load_custom(&cert_path, &key_path);
        }

        std::fs::create_dir_all(&self.dir).map_err(|e| TlsError::io(&self.dir, e))?;

        let mut params = rcgen::CertificateParams::new(vec![
            "localhost".to_string(),
            common_name.to_string(),
        ])?;
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, common_name);
        let key_pair = rcgen::KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;

        let info = CertificateInfo {
            cert: cert.pem(),
            key: key_pair.serialize_pem(),
        };

        std::fs::write(&cert_path, &info.cert).map_err(|e| TlsError::io(&cert_path, e))?;
        write_key(&key_path, &info.key)?;

        info!(host_id, common_name, path = %cert_path.display(), "Generated self-signed certificate");
        Ok(info)
    }

    /// Load an operator-provided certificate and key.
    pub fn load_custom(
        &self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<CertificateInfo, TlsError> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();
        let info = CertificateInfo {
            cert: std::fs::read_to_string(cert_path).map_err(|e| TlsError::io(cert_path, e))?,
            key: std::fs::read_to_string(key_path).map_err(|e| TlsError::io(key_path, e))?,
        };

        // Fail here rather than at the first accept.
        let (certs, _) = info.to_der().map_err(|e| match e {
            TlsError::NoCertificate(_) => TlsError::NoCertificate(cert_path.display().to_string()),
            TlsError::NoPrivateKey(_) => TlsError::NoPrivateKey(key_path.display().to_string()),
            other => other,
        })?;
        debug!(path = %cert_path.display(), chain_len = certs.len(), "Loaded certificate");
        Ok(info)
    }

    /// Server config presenting `info`; no client certificates requested.
    pub fn server_config(&self, info: &CertificateInfo) -> Result<Arc<ServerConfig>, TlsError> {
        let (certs, key) = info.to_der()?;
        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(Arc::new(config))
    }

    /// Client config that accepts any server certificate.
    pub fn client_config() -> Result<Arc<ClientConfig>, TlsError> {
        let provider = provider();
        let config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
            .with_no_client_auth();
        Ok(Arc::new(config))
    }
}

#[cfg(unix)]
fn write_key(path: &Path, pem: &str) -> Result<(), TlsError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| TlsError::io(path, e))?;
    file.write_all(pem.as_bytes())
        .map_err(|e| TlsError::io(path, e))
}

#[cfg(not(unix))]
fn write_key(path: &Path, pem: &str) -> Result<(), TlsError> {
    std::fs::write(path, pem).map_err(|e| TlsError::io(path, e))
}

/// Skips chain validation but still checks the handshake signature against
/// the presented certificate, so the server must hold the matching key.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
