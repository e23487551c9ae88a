//! Error types for the Cipher identity plane

use std::io;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type alias for Cipher
pub type Result<T> = std::result::Result<T, Error>;

/// Cipher errors
#[derive(Error, Debug)]
pub enum Error {
    /// Root key or certificate is missing; call `initialize()` first
    #[error("CA not initialized: root key and certificate must exist before issuance")]
    CaNotInitialized,

    /// Root key or certificate exists but cannot be parsed
    #[error("CA material corrupted: {0}")]
    CaCorrupted(String),

    /// Current time lies outside the certificate validity window
    #[error("Certificate expired or not yet valid (valid {not_before} .. {not_after})")]
    CertificateExpired {
        /// Start of the validity window
        not_before: DateTime<Utc>,
        /// End of the validity window
        not_after: DateTime<Utc>,
    },

    /// Certificate signature does not verify under the trusted root
    #[error("Certificate signature does not verify against the trusted root")]
    SignatureInvalid,

    /// Certificate carries no URI Subject Alternative Name
    #[error("Certificate has no URI subject alternative name")]
    IdentityMissing,

    /// URI is not a well-formed SPIFFE identity
    #[error("Invalid SPIFFE identity: {0}")]
    InvalidIdentity(String),

    /// Service name cannot be used in an identity or storage path
    #[error("Invalid service name: {0}")]
    InvalidServiceName(String),

    /// Certificate bytes cannot be decoded
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Key generation or signing failed
    #[error("Issuance error: {0}")]
    Issuance(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns `true` for failures that mean "this peer is not authenticated".
    ///
    /// The sidecar converts these into an audited deny; everything else is an
    /// operational fault (unreadable file, corrupt root) that is also denied
    /// but worth alerting on.
    #[must_use]
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            Self::CertificateExpired { .. }
                | Self::SignatureInvalid
                | Self::IdentityMissing
                | Self::InvalidIdentity(_)
                | Self::Certificate(_)
        )
    }
}
