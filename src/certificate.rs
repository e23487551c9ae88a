//! Certificate decoding and validity-window arithmetic.
//!
//! Certificates travel as PEM on disk and DER on the wire; every entry point
//! here accepts either.  [`CertificateInfo`] is the parsed view the rotation
//! manager and the CA use to reason about lifetimes.  All timestamps are
//! `DateTime<Utc>`.

use std::borrow::Cow;

use chrono::{DateTime, TimeDelta, Utc};
use sha2::{Digest, Sha256};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::FromDer;
use x509_parser::time::ASN1Time;

use crate::{Error, Result};

const PEM_PREFIX: &[u8] = b"-----BEGIN";

/// Return the DER encoding of a PEM or DER certificate.
///
/// Leading whitespace before a PEM header is tolerated.
pub fn certificate_der(bytes: &[u8]) -> Result<Cow<'_, [u8]>> {
    let trimmed = bytes.trim_ascii_start();
    if !trimmed.starts_with(PEM_PREFIX) {
        return Ok(Cow::Borrowed(bytes));
    }

    let (_, pem) = parse_x509_pem(trimmed)
        .map_err(|e| Error::Certificate(format!("Failed to decode PEM: {e}")))?;
    if pem.label != "CERTIFICATE" {
        return Err(Error::Certificate(format!(
            "Expected a CERTIFICATE PEM block, found '{}'",
            pem.label
        )));
    }
    Ok(Cow::Owned(pem.contents))
}

/// Parse DER bytes into an `X509Certificate`, rejecting trailing garbage.
pub(crate) fn parse_der(der: &[u8]) -> Result<X509Certificate<'_>> {
    let (rest, cert) = X509Certificate::from_der(der)
        .map_err(|e| Error::Certificate(format!("Failed to parse certificate: {e}")))?;
    if !rest.is_empty() {
        return Err(Error::Certificate(format!(
            "{} trailing bytes after certificate",
            rest.len()
        )));
    }
    Ok(cert)
}

/// Convert an ASN.1 time to a UTC timestamp.
pub(crate) fn asn1_to_utc(time: &ASN1Time) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(time.timestamp(), 0)
        .ok_or_else(|| Error::Certificate(format!("Timestamp out of range: {time}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// CertificateInfo
// ─────────────────────────────────────────────────────────────────────────────

/// Validity and naming details of a parsed certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Start of the validity window.
    pub not_before: DateTime<Utc>,
    /// End of the validity window.
    pub not_after: DateTime<Utc>,
    /// Subject Common Name, if any.
    pub common_name: Option<String>,
    /// First URI subject alternative name, unparsed.
    pub uri_san: Option<String>,
    /// Serial number as lowercase hex.
    pub serial: String,
    /// SHA-256 over the DER encoding, lowercase hex.
    pub fingerprint: String,
}

impl CertificateInfo {
    /// Parse a PEM or DER certificate.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let der = certificate_der(bytes)?;
        let cert = parse_der(&der)?;

        let validity = cert.validity();
        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(str::to_owned);
        let uri_san = cert
            .subject_alternative_name()
            .ok()
            .flatten()
            .and_then(|san| {
                san.value.general_names.iter().find_map(|name| match name {
                    GeneralName::URI(uri) => Some((*uri).to_owned()),
                    _ => None,
                })
            });

        Ok(Self {
            not_before: asn1_to_utc(&validity.not_before)?,
            not_after: asn1_to_utc(&validity.not_after)?,
            common_name,
            uri_san,
            serial: hex::encode(cert.raw_serial()),
            fingerprint: hex::encode(Sha256::digest(&der)),
        })
    }

    /// Total lifetime: `not_after - not_before`.
    #[must_use]
    pub fn lifetime(&self) -> TimeDelta {
        self.not_after - self.not_before
    }

    /// Time left at `now`; negative once expired.
    #[must_use]
    pub fn remaining_at(&self, now: DateTime<Utc>) -> TimeDelta {
        self.not_after - now
    }

    /// `true` when `not_before <= now <= not_after`.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// `true` once less than half of the lifetime remains.
    #[must_use]
    pub fn needs_rotation_at(&self, now: DateTime<Utc>) -> bool {
        self.remaining_at(now) < self.lifetime() / 2
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
