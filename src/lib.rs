//! Cipher Mesh Library
//!
//! Service identity and access control for a mesh of internal services.
//!
//! # Features
//!
//! - **Certificate Authority**: self-signed root, short-lived leaf certificates
//!   carrying a SPIFFE URI (`spiffe://<trust-domain>/service/<name>`)
//! - **Validator**: validity window, chain of trust and identity extraction
//! - **Policy Engine**: ordered allow-list plus a per-pair risk score
//! - **Rotation**: background renewal once half a certificate's life is spent
//! - **Sidecar Proxy**: validate → authorize → audit for every outbound request
//! - **Control API**: axum server and reqwest client for remote enrollment

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod ca;
pub mod certificate;
pub mod cli;
pub mod config;
pub mod demo;
pub mod error;
pub mod identity;
pub mod policy;
pub mod proxy;
pub mod rotation;
pub mod validator;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level`.  `format` is `"json"` or text.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| Error::Config(format!("Invalid log level '{level}': {e}")))?;

    let subscriber = tracing_subscriber::registry().with(filter);

    let result = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };
    result.map_err(|e| Error::Internal(format!("Tracing already initialized: {e}")))
}
