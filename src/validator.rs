//! Peer certificate validation.
//!
//! [`CertificateValidator`] authenticates a presented leaf certificate against
//! one trusted root and yields the peer's SPIFFE [`Identity`].  Validation is a
//! pure function of `(root, certificate bytes, now)`:
//!
//! 1. parse (PEM or DER)
//! 2. `not_before <= now <= not_after`, else [`Error::CertificateExpired`]
//! 3. signature under the root public key, else [`Error::SignatureInvalid`]
//! 4. first URI SAN, else [`Error::IdentityMissing`]
//!
//! The window check comes first so an expired certificate is reported as
//! expired whether or not its signature verifies.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::debug;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;

use crate::certificate::{asn1_to_utc, certificate_der, parse_der};
use crate::identity::Identity;
use crate::{Error, Result};

/// Validator bound to one immutable trusted root.
#[derive(Debug, Clone)]
pub struct CertificateValidator {
    /// DER of the trusted root; parsed on each validation since
    /// `X509Certificate` borrows its input.
    root_der: Vec<u8>,
}

impl CertificateValidator {
    /// Build a validator from a PEM or DER root certificate.
    pub fn new(root_certificate: &[u8]) -> Result<Self> {
        let root_der = certificate_der(root_certificate)?.into_owned();
        let root = parse_der(&root_der)?;
        if !root.is_ca() {
            return Err(Error::Certificate(
                "Trusted root is not a CA certificate".to_string(),
            ));
        }
        debug!(subject = %root.subject(), "Trusted root loaded");
        Ok(Self { root_der })
    }

    /// Build a validator from a root certificate file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = fs::read(path.as_ref())?;
        Self::new(&bytes)
    }

    /// Validate `certificate` at the current time.
    pub fn validate(&self, certificate: &[u8]) -> Result<Identity> {
        self.validate_at(certificate, Utc::now())
    }

    /// Validate the certificate stored at `path` at the current time.
    pub fn validate_file(&self, path: impl AsRef<Path>) -> Result<Identity> {
        let bytes = fs::read(path.as_ref())?;
        self.validate(&bytes)
    }

    /// Validate `certificate` as of `now`.
    pub fn validate_at(&self, certificate: &[u8], now: DateTime<Utc>) -> Result<Identity> {
        let der = certificate_der(certificate)?;
        let cert = parse_der(&der)?;

        check_window(&cert, now)?;

        let root = parse_der(&self.root_der)?;
        cert.verify_signature(Some(root.public_key()))
            .map_err(|e| {
                debug!(error = %e, "Signature verification failed");
                Error::SignatureInvalid
            })?;

        let identity = first_uri_san(&cert)?;
        debug!(identity = %identity, "Certificate validated");
        Ok(identity)
    }
}

/// Fail with `CertificateExpired` when `now` is outside the validity window.
fn check_window(cert: &X509Certificate<'_>, now: DateTime<Utc>) -> Result<()> {
    let validity = cert.validity();
    let not_before = asn1_to_utc(&validity.not_before)?;
    let not_after = asn1_to_utc(&validity.not_after)?;
    if now < not_before || now > not_after {
        return Err(Error::CertificateExpired {
            not_before,
            not_after,
        });
    }
    Ok(())
}

/// The first URI entry of the SAN extension, as a SPIFFE identity.
fn first_uri_san(cert: &X509Certificate<'_>) -> Result<Identity> {
    let san = cert
        .subject_alternative_name()
        .map_err(|e| Error::Certificate(format!("Malformed subject alternative name: {e}")))?
        .ok_or(Error::IdentityMissing)?;

    let uri = san
        .value
        .general_names
        .iter()
        .find_map(|name| match name {
            GeneralName::URI(uri) => Some(*uri),
            _ => None,
        })
        .ok_or(Error::IdentityMissing)?;

    Identity::parse(uri)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
