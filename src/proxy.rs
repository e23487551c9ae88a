//! Per-service sidecar: validate, authorize, audit.
//!
//! The proxy never lets a certificate problem escape the request path.  A
//! certificate that cannot be read or validated turns into a `Deny` with an
//! audit record carrying the failure reason, prefixed with
//! [`AUTHENTICATION_FAILED`] or [`OPERATIONAL_FAULT`].  An audit sink that refuses
//! an event is logged without changing the verdict.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::audit::{AuditEvent, AuditSink};
use crate::ca::CertificateAuthority;
use crate::identity::{validate_service_name, Identity};
use crate::policy::{PolicyDecision, PolicyEngine};
use crate::rotation::{RotationManager, DEFAULT_INTERVAL};
use crate::validator::CertificateValidator;
use crate::{Error, Result};

/// Audit reason prefix for a peer that failed authentication.
pub const AUTHENTICATION_FAILED: &str = "authentication failed";

/// Audit reason prefix for a local fault while checking the peer.
pub const OPERATIONAL_FAULT: &str = "operational fault";

/// Sidecar for one local service identity.
pub struct SidecarProxy {
    identity: Identity,
    validator: Arc<CertificateValidator>,
    policy: Arc<PolicyEngine>,
    audit: Arc<dyn AuditSink>,
    ca: Option<Arc<CertificateAuthority>>,
    rotation_interval: Duration,
    rotation: Mutex<Option<RotationManager>>,
}

impl std::fmt::Debug for SidecarProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SidecarProxy")
            .field("identity", &self.identity)
            .field("rotation_interval", &self.rotation_interval)
            .field("has_ca", &self.ca.is_some())
            .finish_non_exhaustive()
    }
}

impl SidecarProxy {
    /// Create a proxy for `identity`.
    pub fn new(
        identity: Identity,
        validator: Arc<CertificateValidator>,
        policy: Arc<PolicyEngine>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            identity,
            validator,
            policy,
            audit,
            ca: None,
            rotation_interval: DEFAULT_INTERVAL,
            rotation: Mutex::new(None),
        }
    }

    /// Bind the CA used to reissue certificates during rotation.
    #[must_use]
    pub fn with_ca(mut self, ca: Arc<CertificateAuthority>) -> Self {
        self.ca = Some(ca);
        self
    }

    /// Override the rotation check interval.
    #[must_use]
    pub fn with_rotation_interval(mut self, interval: Duration) -> Self {
        self.rotation_interval = interval;
        self
    }

    /// The local service identity.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Authorize a request to `destination` using the certificate at
    /// `certificate_path` as the caller's credential.
    ///
    /// Always returns a verdict; every call records exactly one audit event.
    pub fn outbound_request(&self, certificate_path: impl AsRef<Path>, destination: &Identity) -> bool {
        let certificate_path = certificate_path.as_ref();
        let event = match self.validator.validate_file(certificate_path) {
            Ok(source) => {
                let evaluation = self.policy.evaluate(&source, destination);
                info!(
                    source = %source,
                    destination = %destination,
                    decision = ?evaluation.decision,
                    risk = ?evaluation.risk,
                    "Authorization decision"
                );
                let event = AuditEvent::decision(source, destination.clone(), evaluation.decision);
                match (evaluation.decision, evaluation.risk) {
                    (PolicyDecision::Deny, None) => event.with_reason("pair not allow-listed"),
                    (PolicyDecision::Deny, Some(_)) => event.with_reason("risk threshold exceeded"),
                    _ => event,
                }
            }
            Err(e) if e.is_authentication_failure() => {
                warn!(
                    path = %certificate_path.display(),
                    destination = %destination,
                    error = %e,
                    "Peer authentication failed, denying"
                );
                AuditEvent::rejected(destination.clone(), format!("{AUTHENTICATION_FAILED}: {e}"))
            }
            Err(e) => {
                error!(
                    path = %certificate_path.display(),
                    destination = %destination,
                    error = %e,
                    "Certificate check faulted, denying"
                );
                AuditEvent::rejected(destination.clone(), format!("{OPERATIONAL_FAULT}: {e}"))
            }
        };

        let allowed = event.decision.is_allow();
        if let Err(e) = self.audit.append(&event) {
            warn!(event_id = %event.id, error = %e, "Failed to record audit event");
        }
        allowed
    }

    /// Start renewing the certificate at `certificate_path` by reissuing it
    /// for `service_name` through the bound CA.
    ///
    /// Replaces any rotation already running for this proxy.
    pub fn start_rotation(&self, certificate_path: impl Into<PathBuf>, service_name: &str) -> Result<()> {
        validate_service_name(service_name)?;
        let ca = self
            .ca
            .clone()
            .ok_or_else(|| Error::Config("No certificate authority bound to proxy".to_string()))?;

        let service = service_name.to_owned();
        let renewer = move || -> Result<()> {
            ca.issue_service_certificate(&service).map(|_| ())
        };
        let manager = RotationManager::new(certificate_path, Arc::new(renewer), self.rotation_interval);
        manager.start()?;

        // Dropping a previous manager closes its shutdown channel.
        *self.rotation.lock() = Some(manager);
        Ok(())
    }

    /// Stop rotation, waiting for an in-flight check to finish.
    pub async fn stop_rotation(&self) {
        let manager = self.rotation.lock().take();
        if let Some(manager) = manager {
            manager.stop().await;
        }
    }

    /// `true` while a rotation loop is active.
    #[must_use]
    pub fn is_rotating(&self) -> bool {
        self.rotation
            .lock()
            .as_ref()
            .is_some_and(RotationManager::is_running)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::fs;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::ca::{CaSettings, FileKeyStore};
    use crate::identity::TrustDomain;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: FileKeyStore,
        ca: Arc<CertificateAuthority>,
        policy: Arc<PolicyEngine>,
        audit: Arc<MemoryAuditSink>,
        proxy: SidecarProxy,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path().join("ca"), dir.path());
        let settings = CaSettings::new(TrustDomain::new("cipher.local").unwrap());
        let ca = Arc::new(CertificateAuthority::new(settings, Arc::new(store.clone())));
        ca.initialize().unwrap();
        let validator = Arc::new(
            CertificateValidator::new(ca.root_certificate_pem().unwrap().as_bytes()).unwrap(),
        );
        let policy = Arc::new(PolicyEngine::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let identity = Identity::for_service(ca.trust_domain(), "payment-api").unwrap();
        let proxy = SidecarProxy::new(identity, validator, Arc::clone(&policy), audit.clone())
            .with_ca(Arc::clone(&ca));
        Fixture {
            _dir: dir,
            store,
            ca,
            policy,
            audit,
            proxy,
        }
    }

    fn id(name: &str) -> Identity {
        Identity::parse(&format!("spiffe://cipher.local/service/{name}")).unwrap()
    }

    struct FailingSink;

    impl AuditSink for FailingSink {
        fn append(&self, _event: &AuditEvent) -> Result<()> {
            Err(Error::Internal("disk full".to_string()))
        }
    }

    // ─── outbound_request ────────────────────────────────────────────────────

    #[test]
    fn allowed_pair_is_audited_as_allow() {
        // GIVEN: payment-api → user-service allowed
        let f = fixture();
        f.ca.issue_service_certificate("payment-api").unwrap();
        f.policy.allow(id("payment-api"), id("user-service"));
        // WHEN
        let allowed = f
            .proxy
            .outbound_request(f.store.service_cert_path("payment-api"), &id("user-service"));
        // THEN
        assert!(allowed);
        let events = f.audit.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, Some(id("payment-api")));
        assert_eq!(events[0].destination, id("user-service"));
        assert_eq!(events[0].decision, PolicyDecision::Allow);
    }

    #[test]
    fn unlisted_pair_is_denied_with_reason() {
        let f = fixture();
        f.ca.issue_service_certificate("payment-api").unwrap();
        let allowed = f
            .proxy
            .outbound_request(f.store.service_cert_path("payment-api"), &id("billing"));
        assert!(!allowed);
        let events = f.audit.events();
        assert_eq!(events[0].decision, PolicyDecision::Deny);
        assert_eq!(events[0].reason.as_deref(), Some("pair not allow-listed"));
    }

    #[test]
    fn missing_certificate_is_audited_deny() {
        // GIVEN: no certificate on disk
        let f = fixture();
        f.policy.allow(id("payment-api"), id("user-service"));
        // WHEN
        let allowed = f
            .proxy
            .outbound_request(f.store.service_cert_path("payment-api"), &id("user-service"));
        // THEN: deny, source unknown, recorded as a local fault
        assert!(!allowed);
        let events = f.audit.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, None);
        assert_eq!(events[0].decision, PolicyDecision::Deny);
        let reason = events[0].reason.as_deref().unwrap();
        assert!(reason.starts_with(OPERATIONAL_FAULT), "{reason}");
    }

    #[test]
    fn corrupt_certificate_is_audited_deny() {
        let f = fixture();
        let path = f.store.service_cert_path("payment-api");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "not a certificate").unwrap();

        assert!(!f.proxy.outbound_request(&path, &id("user-service")));
        let events = f.audit.events();
        assert_eq!(events[0].source, None);
        let reason = events[0].reason.as_deref().unwrap();
        assert!(reason.starts_with(AUTHENTICATION_FAILED), "{reason}");
    }

    #[test]
    fn unreadable_certificate_path_is_an_operational_fault() {
        // GIVEN: the certificate path is a directory
        let f = fixture();
        let path = f.store.service_cert_path("payment-api");
        fs::create_dir_all(&path).unwrap();
        // WHEN
        assert!(!f.proxy.outbound_request(&path, &id("user-service")));
        // THEN
        let reason = f.audit.events()[0].reason.clone().unwrap();
        assert!(reason.starts_with(OPERATIONAL_FAULT), "{reason}");
        assert!(!reason.starts_with(AUTHENTICATION_FAILED));
    }

    #[test]
    fn audit_failure_does_not_change_verdict() {
        let f = fixture();
        f.ca.issue_service_certificate("payment-api").unwrap();
        f.policy.allow(id("payment-api"), id("user-service"));
        let validator = Arc::new(
            CertificateValidator::new(f.ca.root_certificate_pem().unwrap().as_bytes()).unwrap(),
        );
        let proxy = SidecarProxy::new(
            id("payment-api"),
            validator,
            Arc::clone(&f.policy),
            Arc::new(FailingSink),
        );
        assert!(proxy.outbound_request(f.store.service_cert_path("payment-api"), &id("user-service")));
    }

    // ─── rotation ────────────────────────────────────────────────────────────

    #[test]
    fn start_rotation_without_ca_fails() {
        let f = fixture();
        let validator = Arc::new(
            CertificateValidator::new(f.ca.root_certificate_pem().unwrap().as_bytes()).unwrap(),
        );
        let proxy = SidecarProxy::new(id("a"), validator, Arc::clone(&f.policy), f.audit.clone());
        let result = proxy.start_rotation("a.crt", "a");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn start_rotation_rejects_bad_service_name() {
        let f = fixture();
        let result = f.proxy.start_rotation("a.crt", "../etc");
        assert!(matches!(result, Err(Error::InvalidServiceName(_))));
    }

    #[tokio::test]
    async fn rotation_starts_and_stops() {
        let f = fixture();
        f.ca.issue_service_certificate("payment-api").unwrap();
        let path = f.store.service_cert_path("payment-api");
        let before = fs::read_to_string(&path).unwrap();

        f.proxy.start_rotation(&path, "payment-api").unwrap();
        assert!(f.proxy.is_rotating());
        tokio::time::sleep(Duration::from_millis(50)).await;
        f.proxy.stop_rotation().await;
        assert!(!f.proxy.is_rotating());
        // Fresh certificate was not reissued
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }
}
