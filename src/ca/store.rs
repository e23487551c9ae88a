//! Key store: where root and service key material lives.
//!
//! The [`KeyStore`] trait hides the storage backend from the CA so that an
//! in-memory or HSM-backed implementation can replace the filesystem without
//! touching callers.
//!
//! # File layout ([`FileKeyStore`])
//!
//! ```text
//! <ca_dir>/root_ca.key
//! <ca_dir>/root_ca.crt
//! <service_dir>/<service>/<service>.key
//! <service_dir>/<service>/<service>.crt
//! ```
//!
//! Every file is written to a temporary sibling and renamed into place, so a
//! concurrent reader sees either the old or the new content, never a torn
//! write.  Private keys are written unencrypted as PKCS#8 PEM.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::identity::validate_service_name;
use crate::{Error, Result};

const ROOT_KEY_FILE: &str = "root_ca.key";
const ROOT_CERT_FILE: &str = "root_ca.crt";

// ─────────────────────────────────────────────────────────────────────────────
// PEM material
// ─────────────────────────────────────────────────────────────────────────────

/// A certificate and its private key, both PEM-encoded.
#[derive(Clone, PartialEq, Eq)]
pub struct PemMaterial {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

impl fmt::Debug for PemMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PemMaterial")
            .field("cert_pem", &self.cert_pem)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Storage backend for root and service key material.
///
/// Implementations must be `Send + Sync`: the CA is shared between request
/// handlers and the rotation task.
pub trait KeyStore: Send + Sync {
    /// `true` when both the root key and the root certificate are present.
    fn root_exists(&self) -> bool;

    /// Load the root key and certificate.
    ///
    /// Returns [`Error::CaNotInitialized`] if either half is missing.
    fn load_root(&self) -> Result<PemMaterial>;

    /// Persist the root key and certificate, replacing any previous content.
    fn store_root(&self, material: &PemMaterial) -> Result<()>;

    /// Persist a service key and certificate, replacing any previous content.
    fn store_service(&self, service_name: &str, material: &PemMaterial) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Filesystem store
// ─────────────────────────────────────────────────────────────────────────────

/// Filesystem-backed key store.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    ca_dir: PathBuf,
    service_dir: PathBuf,
}

impl FileKeyStore {
    /// Create a store rooted at `ca_dir` (root material) and `service_dir`
    /// (one sub-directory per service).  Directories are created lazily.
    #[must_use]
    pub fn new(ca_dir: impl Into<PathBuf>, service_dir: impl Into<PathBuf>) -> Self {
        Self {
            ca_dir: ca_dir.into(),
            service_dir: service_dir.into(),
        }
    }

    /// Path of the root private key.
    #[must_use]
    pub fn root_key_path(&self) -> PathBuf {
        self.ca_dir.join(ROOT_KEY_FILE)
    }

    /// Path of the root certificate.
    #[must_use]
    pub fn root_cert_path(&self) -> PathBuf {
        self.ca_dir.join(ROOT_CERT_FILE)
    }

    /// Path of a service's certificate.
    #[must_use]
    pub fn service_cert_path(&self, service_name: &str) -> PathBuf {
        self.service_dir
            .join(service_name)
            .join(format!("{service_name}.crt"))
    }

    /// Path of a service's private key.
    #[must_use]
    pub fn service_key_path(&self, service_name: &str) -> PathBuf {
        self.service_dir
            .join(service_name)
            .join(format!("{service_name}.key"))
    }
}

impl KeyStore for FileKeyStore {
    fn root_exists(&self) -> bool {
        self.root_key_path().is_file() && self.root_cert_path().is_file()
    }

    fn load_root(&self) -> Result<PemMaterial> {
        let key_pem = read_root_file(&self.root_key_path())?;
        let cert_pem = read_root_file(&self.root_cert_path())?;
        Ok(PemMaterial { cert_pem, key_pem })
    }

    fn store_root(&self, material: &PemMaterial) -> Result<()> {
        write_atomic(&self.root_key_path(), material.key_pem.as_bytes(), true)?;
        write_atomic(&self.root_cert_path(), material.cert_pem.as_bytes(), false)?;
        debug!(dir = %self.ca_dir.display(), "Root CA material written");
        Ok(())
    }

    fn store_service(&self, service_name: &str, material: &PemMaterial) -> Result<()> {
        validate_service_name(service_name)?;
        // Key first: a reader that picks up the new certificate must find
        // the matching key already in place.
        write_atomic(
            &self.service_key_path(service_name),
            material.key_pem.as_bytes(),
            true,
        )?;
        write_atomic(
            &self.service_cert_path(service_name),
            material.cert_pem.as_bytes(),
            false,
        )?;
        debug!(service = %service_name, "Service material written");
        Ok(())
    }
}

/// Read one half of the root material, mapping absence to `CaNotInitialized`.
fn read_root_file(path: &Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::CaNotInitialized),
        Err(e) => Err(Error::CaCorrupted(format!(
            "Cannot read '{}': {e}",
            path.display()
        ))),
    }
}

/// Write `contents` to `path` via a temporary file in the same directory and
/// an atomic rename.
fn write_atomic(path: &Path, contents: &[u8], private: bool) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Internal(format!("'{}' has no parent directory", path.display())))?;
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    if private {
        restrict_permissions(tmp.as_file())?;
    }
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(file: &fs::File) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &fs::File) -> Result<()> {
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory store
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory key store, for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    root: RwLock<Option<PemMaterial>>,
    services: RwLock<HashMap<String, PemMaterial>>,
}

impl MemoryKeyStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recently stored material for `service_name`.
    #[must_use]
    pub fn service(&self, service_name: &str) -> Option<PemMaterial> {
        self.services.read().get(service_name).cloned()
    }
}

impl KeyStore for MemoryKeyStore {
    fn root_exists(&self) -> bool {
        self.root.read().is_some()
    }

    fn load_root(&self) -> Result<PemMaterial> {
        self.root.read().clone().ok_or(Error::CaNotInitialized)
    }

    fn store_root(&self, material: &PemMaterial) -> Result<()> {
        *self.root.write() = Some(material.clone());
        Ok(())
    }

    fn store_service(&self, service_name: &str, material: &PemMaterial) -> Result<()> {
        validate_service_name(service_name)?;
        self.services
            .write()
            .insert(service_name.to_owned(), material.clone());
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
