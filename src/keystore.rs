//! On-disk persistence for the local identity and the revocation list.
//!
//! Layout under the keystore directory:
//!
//! ```text
//! identity.json      { version, secretKey, publicKey, fingerprint, createdAt }
//! revocations.json   { version, revoked: [{ fingerprint, reason, revokedAt }] }
//! ```
//!
//! Unreadable key material is an error. The keystore never replaces an
//! existing identity on its own: doing so would orphan every peer that
//! already trusts the old fingerprint.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::identity::{PeerIdentity, Signer};
use crate::utils::now_millis;

const IDENTITY_FILE: &str = "identity.json";
const REVOCATIONS_FILE: &str = "revocations.json";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum KeystoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt keystore file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("failed to encode keystore data: {0}")]
    Encode(#[from] serde_json::Error),
}

impl KeystoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        KeystoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        KeystoreError::Corrupt {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
struct StoredIdentity {
    version: u32,
    secret_key: String,
    public_key: String,
    fingerprint: String,
    created_at: u64,
}

/// One revoked fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevocationEntry {
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub revoked_at: u64,
}

#[derive(Serialize, Deserialize)]
struct RevocationFile {
    version: u32,
    revoked: Vec<RevocationEntry>,
}

/// Identity and revocation store rooted at one directory.
///
/// Construct once at startup and share as `Arc<Keystore>`.
#[derive(Debug)]
pub struct Keystore {
    dir: PathBuf,
    revoked: RwLock<BTreeMap<String, RevocationEntry>>,
}

impl Keystore {
    /// Open (creating if needed) the keystore directory and load the
    /// revocation list. Only a directory created here is made private; an
    /// existing one keeps its mode.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, KeystoreError> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            fs::create_dir_all(&dir).map_err(|e| KeystoreError::io(&dir, e))?;
            restrict_permissions(&dir, 0o700)?;
        }

        let revoked = load_revocations(&dir.join(REVOCATIONS_FILE))?;
        debug!(dir = %dir.display(), revoked = revoked.len(), "opened keystore");

        Ok(Self {
            dir,
            revoked: RwLock::new(revoked),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn identity_path(&self) -> PathBuf {
        self.dir.join(IDENTITY_FILE)
    }

    fn revocations_path(&self) -> PathBuf {
        self.dir.join(REVOCATIONS_FILE)
    }

    /// Load the persisted identity, if one exists.
    pub fn load_identity(&self) -> Result<Option<PeerIdentity>, KeystoreError> {
        let path = self.identity_path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => zeroize::Zeroizing::new(raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(KeystoreError::io(&path, e)),
        };

        let stored: StoredIdentity = serde_json::from_str(&raw)
            .map_err(|e| KeystoreError::corrupt(&path, e.to_string()))?;
        if stored.version != FORMAT_VERSION {
            return Err(KeystoreError::corrupt(
                &path,
                format!("unsupported version {}", stored.version),
            ));
        }

        let seed = zeroize::Zeroizing::new(
            hex::decode(&stored.secret_key)
                .map_err(|e| KeystoreError::corrupt(&path, format!("secretKey: {}", e)))?,
        );
        let identity = PeerIdentity::from_secret_bytes(&seed)
            .map_err(|e| KeystoreError::corrupt(&path, e.to_string()))?;

        if identity.public_key_hex() != stored.public_key.to_ascii_lowercase() {
            return Err(KeystoreError::corrupt(
                &path,
                "publicKey does not match secretKey",
            ));
        }
        if identity.fingerprint() != stored.fingerprint.to_ascii_lowercase() {
            return Err(KeystoreError::corrupt(
                &path,
                "fingerprint does not match secretKey",
            ));
        }

        Ok(Some(identity))
    }

    /// Return the persisted identity, generating and saving one on first run.
    pub fn load_or_create_identity(&self) -> Result<PeerIdentity, KeystoreError> {
        if let Some(identity) = self.load_identity()? {
            info!(fingerprint = identity.fingerprint(), "loaded peer identity");
            return Ok(identity);
        }

        let identity = PeerIdentity::generate();
        self.save_identity(&identity)?;
        info!(fingerprint = identity.fingerprint(), "generated new peer identity");
        Ok(identity)
    }

    fn save_identity(&self, identity: &PeerIdentity) -> Result<(), KeystoreError> {
        let stored = StoredIdentity {
            version: FORMAT_VERSION,
            secret_key: hex::encode(identity.secret_bytes().as_slice()),
            public_key: identity.public_key_hex(),
            fingerprint: identity.fingerprint().to_string(),
            created_at: now_millis(),
        };
        let data = zeroize::Zeroizing::new(serde_json::to_vec_pretty(&stored)?);
        write_private(&self.identity_path(), &data)
    }

    /// Is this fingerprint on the local revocation list?
    pub fn is_revoked(&self, fingerprint: &str) -> bool {
        self.revoked
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&normalize(fingerprint))
    }

    /// Add a fingerprint to the revocation list. Returns `false` if it was
    /// already revoked.
    pub fn revoke(&self, fingerprint: &str, reason: Option<String>) -> Result<bool, KeystoreError> {
        let fingerprint = normalize(fingerprint);
        let mut revoked = self.revoked.write().unwrap_or_else(PoisonError::into_inner);
        if revoked.contains_key(&fingerprint) {
            return Ok(false);
        }

        revoked.insert(
            fingerprint.clone(),
            RevocationEntry {
                fingerprint: fingerprint.clone(),
                reason,
                revoked_at: now_millis(),
            },
        );
        if let Err(e) = self.persist_revocations(&revoked) {
            revoked.remove(&fingerprint);
            return Err(e);
        }

        warn!(fingerprint = %fingerprint, "revoked peer");
        Ok(true)
    }

    /// Remove a fingerprint from the revocation list. Returns `false` if it
    /// was not revoked.
    pub fn unrevoke(&self, fingerprint: &str) -> Result<bool, KeystoreError> {
        let fingerprint = normalize(fingerprint);
        let mut revoked = self.revoked.write().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = revoked.remove(&fingerprint) else {
            return Ok(false);
        };

        if let Err(e) = self.persist_revocations(&revoked) {
            revoked.insert(fingerprint, entry);
            return Err(e);
        }

        info!(fingerprint = %fingerprint, "reinstated peer");
        Ok(true)
    }

    pub fn revocations(&self) -> Vec<RevocationEntry> {
        self.revoked
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn persist_revocations(
        &self,
        revoked: &BTreeMap<String, RevocationEntry>,
    ) -> Result<(), KeystoreError> {
        let file = RevocationFile {
            version: FORMAT_VERSION,
            revoked: revoked.values().cloned().collect(),
        };
        let data = serde_json::to_vec_pretty(&file)?;
        write_private(&self.revocations_path(), &data)
    }
}

fn normalize(fingerprint: &str) -> String {
    fingerprint.trim().to_ascii_lowercase()
}

fn load_revocations(path: &Path) -> Result<BTreeMap<String, RevocationEntry>, KeystoreError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(KeystoreError::io(path, e)),
    };

    let file: RevocationFile =
        serde_json::from_str(&raw).map_err(|e| KeystoreError::corrupt(path, e.to_string()))?;
    if file.version != FORMAT_VERSION {
        return Err(KeystoreError::corrupt(
            path,
            format!("unsupported version {}", file.version),
        ));
    }

    Ok(file
        .revoked
        .into_iter()
        .map(|mut entry| {
            entry.fingerprint = normalize(&entry.fingerprint);
            (entry.fingerprint.clone(), entry)
        })
        .collect())
}

/// Write via a temporary file and rename so readers never see a torn file.
fn write_private(path: &Path, data: &[u8]) -> Result<(), KeystoreError> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data).map_err(|e| KeystoreError::io(&tmp, e))?;
    restrict_permissions(&tmp, 0o600)?;
    fs::rename(&tmp, path).map_err(|e| KeystoreError::io(path, e))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) -> Result<(), KeystoreError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| KeystoreError::io(path, e))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) -> Result<(), KeystoreError> {
    Ok(())
}
