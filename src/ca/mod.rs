//! Certificate authority: root key ownership and leaf issuance.
//!
//! The CA holds no certificates in memory: every issuance re-reads the root
//! key and certificate from its [`KeyStore`], so the store is the single
//! source of truth.  Re-issuing for an existing service *is* rotation; the
//! new key and certificate replace the old ones.
//!
//! # Issued certificate profile
//!
//! | Field | Value |
//! |-------|-------|
//! | Subject | `CN=<service_name>` |
//! | Issuer | root CA subject |
//! | SAN (non-critical) | `URI:spiffe://<trust-domain>/service/<service_name>` |
//! | EKU (non-critical) | `clientAuth`, `serverAuth` |
//! | Validity | `[now, now + validity_hours]` |
//!
//! # Submodules
//!
//! - [`store`]: [`KeyStore`] trait, filesystem and in-memory backends
//! - [`server`]: axum control API
//! - [`client`]: reqwest client for the control API

pub mod client;
pub mod server;
pub mod store;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber, SignatureAlgorithm,
    string::Ia5String,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::certificate::CertificateInfo;
use crate::identity::{Identity, TrustDomain, validate_service_name};
use crate::{Error, Result};

pub use client::CaClient;
pub use store::{FileKeyStore, KeyStore, MemoryKeyStore, PemMaterial};

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

/// Signature / key algorithm for root and leaf keys.
///
/// RSA is not offered: the `ring` backend of rcgen signs with RSA but cannot
/// generate RSA keys.  ECDSA P-256 with SHA-256 stands in for 2048-bit RSA.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAlgorithm {
    /// ECDSA on P-256 with SHA-256.
    #[default]
    EcdsaP256,
    /// ECDSA on P-384 with SHA-384.
    EcdsaP384,
    /// Ed25519.
    Ed25519,
}

impl KeyAlgorithm {
    fn rcgen_alg(self) -> &'static SignatureAlgorithm {
        match self {
            Self::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            Self::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
            Self::Ed25519 => &rcgen::PKCS_ED25519,
        }
    }

    fn generate(self) -> Result<KeyPair> {
        KeyPair::generate_for(self.rcgen_alg())
            .map_err(|e| Error::Issuance(format!("Failed to generate {self:?} key: {e}")))
    }
}

/// Root subject and validity parameters.
#[derive(Debug, Clone)]
pub struct CaSettings {
    /// Trust domain embedded in every issued identity.
    pub trust_domain: TrustDomain,
    /// Key algorithm for root and leaf keys.
    pub key_algorithm: KeyAlgorithm,
    /// Root certificate validity in days.
    pub root_validity_days: u32,
    /// Leaf certificate validity in hours.
    pub cert_validity_hours: u32,
    /// Root subject country (C).
    pub country: String,
    /// Root subject organization (O).
    pub organization: String,
    /// Root subject common name (CN).
    pub common_name: String,
}

impl CaSettings {
    /// Defaults for `trust_domain`: 10-year root, 24-hour leaves,
    /// `C=US, O=Cipher, CN=Cipher Root CA`.
    #[must_use]
    pub fn new(trust_domain: TrustDomain) -> Self {
        Self {
            trust_domain,
            key_algorithm: KeyAlgorithm::default(),
            root_validity_days: 3650,
            cert_validity_hours: 24,
            country: "US".to_string(),
            organization: "Cipher".to_string(),
            common_name: "Cipher Root CA".to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Issued certificate
// ─────────────────────────────────────────────────────────────────────────────

/// A freshly issued service certificate and its key.
#[derive(Clone)]
pub struct ServiceCertificate {
    /// SPIFFE identity carried in the SAN.
    pub identity: Identity,
    /// PEM-encoded certificate.
    pub certificate_pem: String,
    /// PEM-encoded private key.
    pub private_key_pem: String,
    /// Start of the validity window.
    pub not_before: DateTime<Utc>,
    /// End of the validity window.
    pub not_after: DateTime<Utc>,
    /// Serial number, lowercase hex.
    pub serial: String,
    /// SHA-256 fingerprint of the DER certificate, lowercase hex.
    pub fingerprint: String,
}

impl fmt::Debug for ServiceCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCertificate")
            .field("identity", &self.identity)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("serial", &self.serial)
            .field("fingerprint", &self.fingerprint)
            .field("private_key_pem", &"<redacted>")
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Certificate authority
// ─────────────────────────────────────────────────────────────────────────────

/// The mesh certificate authority.
pub struct CertificateAuthority {
    settings: CaSettings,
    store: Arc<dyn KeyStore>,
    /// Serializes `initialize()` so two callers cannot both generate a root.
    init_lock: Mutex<()>,
    /// One lock per service name; concurrent issuance for the same service
    /// would otherwise interleave key and certificate writes.
    service_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CertificateAuthority {
    /// Create a CA over `store`.  Does not touch the store.
    #[must_use]
    pub fn new(settings: CaSettings, store: Arc<dyn KeyStore>) -> Self {
        Self {
            settings,
            store,
            init_lock: Mutex::new(()),
            service_locks: DashMap::new(),
        }
    }

    /// The trust domain this CA issues into.
    #[must_use]
    pub fn trust_domain(&self) -> &TrustDomain {
        &self.settings.trust_domain
    }

    /// Generate and persist the self-signed root, unless one already exists.
    ///
    /// Returns `true` when a new root was created, `false` when this was a
    /// no-op.
    pub fn initialize(&self) -> Result<bool> {
        let _guard = self.init_lock.lock();

        if self.store.root_exists() {
            info!("Root CA already exists");
            return Ok(false);
        }

        info!(algorithm = ?self.settings.key_algorithm, "Generating root CA");
        let key_pair = self.settings.key_algorithm.generate()?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CountryName, self.settings.country.as_str());
        dn.push(DnType::OrganizationName, self.settings.organization.as_str());
        dn.push(DnType::CommonName, self.settings.common_name.as_str());
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(random_serial());

        let now = Utc::now();
        params.not_before = to_offset(now)?;
        params.not_after =
            to_offset(now + TimeDelta::days(i64::from(self.settings.root_validity_days)))?;

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Issuance(format!("Root certificate generation failed: {e}")))?;

        self.store.store_root(&PemMaterial {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })?;

        info!(common_name = %self.settings.common_name, "Root CA created");
        Ok(true)
    }

    /// PEM-encoded root certificate, for distribution to validators.
    pub fn root_certificate_pem(&self) -> Result<String> {
        Ok(self.store.load_root()?.cert_pem)
    }

    /// Issue (or re-issue) the certificate for `service_name`.
    ///
    /// Generates a new key pair on every call and replaces whatever the store
    /// held for this service.
    pub fn issue_service_certificate(&self, service_name: &str) -> Result<ServiceCertificate> {
        validate_service_name(service_name)?;
        let identity = Identity::for_service(&self.settings.trust_domain, service_name)?;

        let lock = self
            .service_locks
            .entry(service_name.to_owned())
            .or_default()
            .clone();
        let _guard = lock.lock();

        let root = self.store.load_root()?;
        let ca_key = KeyPair::from_pem(&root.key_pem)
            .map_err(|e| Error::CaCorrupted(format!("Failed to parse root key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(&root.cert_pem, &ca_key)
            .map_err(|e| Error::CaCorrupted(format!("Failed to parse root certificate: {e}")))?;

        let leaf_key = self.settings.key_algorithm.generate()?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, service_name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.serial_number = Some(random_serial());

        let uri = Ia5String::try_from(identity.as_str())
            .map_err(|e| Error::Issuance(format!("Invalid URI SAN '{identity}': {e}")))?;
        params.subject_alt_names = vec![SanType::URI(uri)];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];

        let now = Utc::now();
        params.not_before = to_offset(now)?;
        params.not_after =
            to_offset(now + TimeDelta::hours(i64::from(self.settings.cert_validity_hours)))?;

        let cert = params
            .signed_by(&leaf_key, &issuer)
            .map_err(|e| Error::Issuance(format!("Leaf certificate signing failed: {e}")))?;

        let material = PemMaterial {
            cert_pem: cert.pem(),
            key_pem: leaf_key.serialize_pem(),
        };
        self.store.store_service(service_name, &material)?;

        let info = CertificateInfo::from_bytes(cert.der())?;
        info!(
            service = %service_name,
            identity = %identity,
            not_after = %info.not_after,
            fingerprint = %info.fingerprint,
            "Certificate issued"
        );

        Ok(ServiceCertificate {
            identity,
            certificate_pem: material.cert_pem,
            private_key_pem: material.key_pem,
            not_before: info.not_before,
            not_after: info.not_after,
            serial: info.serial,
            fingerprint: info.fingerprint,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Private helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Random positive 128-bit serial.
fn random_serial() -> SerialNumber {
    let mut bytes = *uuid::Uuid::new_v4().as_bytes();
    // Clear the sign bit so the DER INTEGER is positive.
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}

/// Convert to the `time` type rcgen expects, truncating to whole seconds.
fn to_offset(dt: DateTime<Utc>) -> Result<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(dt.timestamp())
        .map_err(|e| Error::Internal(format!("Date conversion error: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
