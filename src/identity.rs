//! SPIFFE-style service identities.
//!
//! Every workload in the mesh is named by a URI of the form
//! `spiffe://<trust-domain>/service/<name>`.  The URI is carried in the
//! first URI Subject Alternative Name of its certificate and is the only
//! identity the policy engine and audit trail ever see.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// URI scheme for workload identities.
pub const SPIFFE_SCHEME: &str = "spiffe";

/// Path segment that precedes the service name.
const SERVICE_SEGMENT: &str = "service";

// ─────────────────────────────────────────────────────────────────────────────
// Trust domain
// ─────────────────────────────────────────────────────────────────────────────

/// Administrative namespace shared by the root CA and all issued identities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TrustDomain(String);

impl TrustDomain {
    /// Validate and wrap a trust domain name (e.g. `cipher.local`).
    ///
    /// Trust domains are lowercase DNS-style labels: ASCII letters, digits,
    /// `.`, `-` and `_`.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && !name.ends_with('.')
            && name.chars().all(|c| {
                c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_')
            });
        if !valid {
            return Err(Error::InvalidIdentity(format!(
                "trust domain '{name}' must be lowercase letters, digits, '.', '-' or '_'"
            )));
        }
        Ok(Self(name))
    }

    /// The trust domain as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrustDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TrustDomain {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<TrustDomain> for String {
    fn from(value: TrustDomain) -> Self {
        value.0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Identity
// ─────────────────────────────────────────────────────────────────────────────

/// A SPIFFE URI identifying one workload.
///
/// Equality is on the full URI string; `(A, B)` and `(B, A)` are different
/// policy pairs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Build the identity for `service_name` inside `trust_domain`.
    pub fn for_service(trust_domain: &TrustDomain, service_name: &str) -> Result<Self> {
        validate_service_name(service_name)?;
        Ok(Self(format!(
            "{SPIFFE_SCHEME}://{trust_domain}/{SERVICE_SEGMENT}/{service_name}"
        )))
    }

    /// Parse a SPIFFE URI.
    ///
    /// Requires the `spiffe` scheme, a non-empty trust domain and a non-empty
    /// path.  Query strings, fragments and userinfo are rejected.
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri).map_err(|e| Error::InvalidIdentity(format!("'{uri}': {e}")))?;

        if url.scheme() != SPIFFE_SCHEME {
            return Err(Error::InvalidIdentity(format!(
                "'{uri}': scheme must be '{SPIFFE_SCHEME}'"
            )));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(Error::InvalidIdentity(format!("'{uri}': missing trust domain")));
        }
        if url.path().len() <= 1 {
            return Err(Error::InvalidIdentity(format!("'{uri}': missing workload path")));
        }
        if url.query().is_some()
            || url.fragment().is_some()
            || !url.username().is_empty()
            || url.port().is_some()
        {
            return Err(Error::InvalidIdentity(format!(
                "'{uri}': query, fragment, userinfo and port are not allowed"
            )));
        }

        Ok(Self(uri.to_owned()))
    }

    /// The full URI.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The trust domain (URI authority).
    #[must_use]
    pub fn trust_domain(&self) -> &str {
        self.0
            .strip_prefix("spiffe://")
            .and_then(|rest| rest.split('/').next())
            .unwrap_or_default()
    }

    /// The service name when the path has the form `/service/<name>`.
    #[must_use]
    pub fn service_name(&self) -> Option<&str> {
        let rest = self.0.strip_prefix("spiffe://")?;
        let (_, path) = rest.split_once('/')?;
        path.strip_prefix("service/")
            .filter(|name| !name.is_empty() && !name.contains('/'))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Identity {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Identity> for String {
    fn from(value: Identity) -> Self {
        value.0
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service names
// ─────────────────────────────────────────────────────────────────────────────

/// Maximum service name length.
const MAX_SERVICE_NAME_LEN: usize = 128;

/// Check that `name` is safe both as a URI path segment and as a directory
/// name in the key store.
pub fn validate_service_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_SERVICE_NAME_LEN {
        return Err(Error::InvalidServiceName(format!(
            "'{name}' must be 1..={MAX_SERVICE_NAME_LEN} characters"
        )));
    }
    if name.starts_with('.') {
        return Err(Error::InvalidServiceName(format!(
            "'{name}' must not start with '.'"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(Error::InvalidServiceName(format!(
            "'{name}' may only contain ASCII letters, digits, '-', '_' and '.'"
        )));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn domain() -> TrustDomain {
        TrustDomain::new("cipher.local").unwrap()
    }

    // ─── for_service ─────────────────────────────────────────────────────────

    #[test]
    fn for_service_builds_spiffe_uri() {
        // GIVEN: trust domain and service name
        // WHEN: building the identity
        let id = Identity::for_service(&domain(), "payment-api").unwrap();
        // THEN: canonical URI
        assert_eq!(id.as_str(), "spiffe://cipher.local/service/payment-api");
        assert_eq!(id.trust_domain(), "cipher.local");
        assert_eq!(id.service_name(), Some("payment-api"));
    }

    #[test]
    fn for_service_rejects_path_traversal() {
        let result = Identity::for_service(&domain(), "../ca");
        assert!(matches!(result, Err(Error::InvalidServiceName(_))));
    }

    #[test]
    fn for_service_rejects_empty_name() {
        assert!(Identity::for_service(&domain(), "").is_err());
    }

    // ─── parse ───────────────────────────────────────────────────────────────

    #[test]
    fn parse_round_trips_display() {
        let id = Identity::parse("spiffe://cipher.local/service/user-service").unwrap();
        assert_eq!(id.to_string(), "spiffe://cipher.local/service/user-service");
    }

    #[test]
    fn parse_rejects_non_spiffe_scheme() {
        let result = Identity::parse("https://cipher.local/service/x");
        assert!(matches!(result, Err(Error::InvalidIdentity(_))));
    }

    #[test]
    fn parse_rejects_missing_path() {
        assert!(Identity::parse("spiffe://cipher.local").is_err());
        assert!(Identity::parse("spiffe://cipher.local/").is_err());
    }

    #[test]
    fn parse_rejects_query_and_fragment() {
        assert!(Identity::parse("spiffe://cipher.local/service/a?x=1").is_err());
        assert!(Identity::parse("spiffe://cipher.local/service/a#frag").is_err());
    }

    #[test]
    fn non_service_path_has_no_service_name() {
        let id = Identity::parse("spiffe://cipher.local/ns/default/sa/web").unwrap();
        assert_eq!(id.service_name(), None);
        assert_eq!(id.trust_domain(), "cipher.local");
    }

    #[test]
    fn identity_serializes_as_plain_string() {
        let id = Identity::for_service(&domain(), "billing").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"spiffe://cipher.local/service/billing\"");
        let back: Identity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn identity_deserialization_validates() {
        let result: std::result::Result<Identity, _> = serde_json::from_str("\"not a uri\"");
        assert!(result.is_err());
    }

    // ─── trust domain ────────────────────────────────────────────────────────

    #[test]
    fn trust_domain_rejects_uppercase_and_slashes() {
        assert!(TrustDomain::new("Cipher.Local").is_err());
        assert!(TrustDomain::new("cipher/local").is_err());
        assert!(TrustDomain::new("").is_err());
    }

    // ─── service names ───────────────────────────────────────────────────────

    #[test]
    fn service_name_allows_dns_like_names() {
        assert!(validate_service_name("user-service").is_ok());
        assert!(validate_service_name("svc_v2.internal").is_ok());
    }

    #[test]
    fn service_name_rejects_separators_and_hidden_names() {
        assert!(validate_service_name("a/b").is_err());
        assert!(validate_service_name("a\\b").is_err());
        assert!(validate_service_name(".hidden").is_err());
        assert!(validate_service_name("with space").is_err());
    }
}
