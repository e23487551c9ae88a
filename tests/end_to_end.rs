//! End-to-end authorization tests
//!
//! Drives the full pipeline on disk:
//! - CA initialization and issuance
//! - Chain-of-trust validation of the issued certificates
//! - Policy decisions through the sidecar proxy
//! - Durable audit log contents

use std::sync::Arc;

use chrono::TimeDelta;
use pretty_assertions::assert_eq;

use cipher_mesh::Error;
use cipher_mesh::audit::{AuditEvent, AuditSink, JsonlAuditSink, MemoryAuditSink};
use cipher_mesh::ca::{CaSettings, CertificateAuthority, FileKeyStore};
use cipher_mesh::identity::{Identity, TrustDomain};
use cipher_mesh::policy::{PolicyDecision, PolicyEngine};
use cipher_mesh::proxy::{AUTHENTICATION_FAILED, SidecarProxy};
use cipher_mesh::validator::CertificateValidator;

struct Mesh {
    _dir: tempfile::TempDir,
    store: FileKeyStore,
    ca: Arc<CertificateAuthority>,
}

fn mesh() -> Mesh {
    let dir = tempfile::tempdir().unwrap();
    let store = FileKeyStore::new(dir.path().join("ca"), dir.path());
    let ca = Arc::new(CertificateAuthority::new(
        CaSettings::new(TrustDomain::new("cipher.local").unwrap()),
        Arc::new(store.clone()),
    ));
    assert!(ca.initialize().unwrap());
    Mesh {
        _dir: dir,
        store,
        ca,
    }
}

fn validator(mesh: &Mesh) -> Arc<CertificateValidator> {
    Arc::new(CertificateValidator::from_file(mesh.store.root_cert_path()).unwrap())
}

/// Ten allowed requests, then the risk threshold denies the eleventh
#[test]
fn test_payment_api_to_user_service_flow() {
    // GIVEN: both services enrolled and payment-api → user-service allowed
    let mesh = mesh();
    let source = mesh.ca.issue_service_certificate("payment-api").unwrap().identity;
    let destination = mesh.ca.issue_service_certificate("user-service").unwrap().identity;

    let policy = Arc::new(PolicyEngine::new());
    policy.allow(source.clone(), destination.clone());
    let audit = Arc::new(MemoryAuditSink::new());
    let proxy = SidecarProxy::new(source.clone(), validator(&mesh), policy, audit.clone());
    let cert = mesh.store.service_cert_path("payment-api");

    // WHEN: eleven requests
    let verdicts: Vec<bool> = (0..11)
        .map(|_| proxy.outbound_request(&cert, &destination))
        .collect();

    // THEN: ten allows then a deny, each audited once
    assert_eq!(verdicts, [vec![true; 10], vec![false]].concat());
    let events = audit.events();
    assert_eq!(events.len(), 11);
    assert!(events[..10].iter().all(|e| e.decision == PolicyDecision::Allow));
    assert_eq!(events[10].decision, PolicyDecision::Deny);
    assert!(events.iter().all(|e| e.source.as_ref() == Some(&source)));
    assert!(events.iter().all(|e| e.destination == destination));
}

/// The reverse direction is never allowed and never counted
#[test]
fn test_reverse_direction_denied() {
    let mesh = mesh();
    let payment = mesh.ca.issue_service_certificate("payment-api").unwrap().identity;
    let user = mesh.ca.issue_service_certificate("user-service").unwrap().identity;

    let policy = Arc::new(PolicyEngine::new());
    policy.allow(payment.clone(), user.clone());
    let audit = Arc::new(MemoryAuditSink::new());
    let proxy = SidecarProxy::new(user.clone(), validator(&mesh), Arc::clone(&policy), audit.clone());

    assert!(!proxy.outbound_request(mesh.store.service_cert_path("user-service"), &payment));
    assert_eq!(policy.request_count(&user, &payment), 0);
    assert_eq!(audit.events()[0].decision, PolicyDecision::Deny);
}

/// A certificate issued by a different root is denied, not propagated
#[test]
fn test_foreign_certificate_denied() {
    let trusted = mesh();
    let foreign = mesh();
    foreign.ca.issue_service_certificate("payment-api").unwrap();
    let source = Identity::parse("spiffe://cipher.local/service/payment-api").unwrap();
    let destination = Identity::parse("spiffe://cipher.local/service/user-service").unwrap();

    let policy = Arc::new(PolicyEngine::new());
    policy.allow(source.clone(), destination.clone());
    let audit = Arc::new(MemoryAuditSink::new());
    let proxy = SidecarProxy::new(source, validator(&trusted), policy, audit.clone());

    assert!(!proxy.outbound_request(foreign.store.service_cert_path("payment-api"), &destination));
    let event = &audit.events()[0];
    assert_eq!(event.source, None);
    let expected = format!("{AUTHENTICATION_FAILED}: {}", Error::SignatureInvalid);
    assert_eq!(event.reason.as_deref(), Some(expected.as_str()));
}

/// Reissuing replaces the certificate on disk and the new one validates
#[test]
fn test_reissue_replaces_certificate() {
    let mesh = mesh();
    let first = mesh.ca.issue_service_certificate("payment-api").unwrap();
    let second = mesh.ca.issue_service_certificate("payment-api").unwrap();
    assert_ne!(first.fingerprint, second.fingerprint);

    let on_disk = std::fs::read_to_string(mesh.store.service_cert_path("payment-api")).unwrap();
    assert_eq!(on_disk, second.certificate_pem);
    let identity = validator(&mesh)
        .validate_file(mesh.store.service_cert_path("payment-api"))
        .unwrap();
    assert_eq!(identity, second.identity);
}

/// Validation honours the validity window at its edges
#[test]
fn test_validity_window_edges() {
    let mesh = mesh();
    let issued = mesh.ca.issue_service_certificate("svc").unwrap();
    let v = validator(&mesh);
    let pem = issued.certificate_pem.as_bytes();

    assert!(v.validate_at(pem, issued.not_before).is_ok());
    assert!(v.validate_at(pem, issued.not_after).is_ok());
    assert!(matches!(
        v.validate_at(pem, issued.not_after + TimeDelta::seconds(1)),
        Err(Error::CertificateExpired { .. })
    ));
    assert_eq!(issued.not_after - issued.not_before, TimeDelta::hours(24));
}

/// Decisions land in the JSON Lines audit log
#[test]
fn test_audit_log_on_disk() {
    let mesh = mesh();
    let source = mesh.ca.issue_service_certificate("payment-api").unwrap().identity;
    let destination = Identity::parse("spiffe://cipher.local/service/user-service").unwrap();
    let policy = Arc::new(PolicyEngine::new());
    policy.allow(source.clone(), destination.clone());

    let log_path = mesh.store.root_cert_path().with_file_name("audit.jsonl");
    let sink: Arc<dyn AuditSink> = Arc::new(JsonlAuditSink::open(&log_path).unwrap());
    let proxy = SidecarProxy::new(source, validator(&mesh), policy, sink);
    let cert = mesh.store.service_cert_path("payment-api");
    for _ in 0..3 {
        assert!(proxy.outbound_request(&cert, &destination));
    }

    let events: Vec<AuditEvent> = std::fs::read_to_string(&log_path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|e| e.decision == PolicyDecision::Allow));
}

/// Initialization on an existing CA keeps the existing root key and certificate
#[test]
fn test_initialize_is_idempotent_on_disk() {
    let mesh = mesh();
    let read_root = || {
        (
            std::fs::read_to_string(mesh.store.root_key_path()).unwrap(),
            std::fs::read_to_string(mesh.store.root_cert_path()).unwrap(),
        )
    };
    let (key_before, cert_before) = read_root();

    assert!(!mesh.ca.initialize().unwrap());

    let (key_after, cert_after) = read_root();
    assert_eq!(key_before, key_after);
    assert_eq!(cert_before, cert_after);
}
