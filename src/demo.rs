//! End-to-end scenario: issue two service certificates, allow one direction,
//! and push a burst of requests through the sidecar until the risk threshold
//! flips the verdict.  The sidecar's rotation loop runs for the duration of
//! the burst.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::audit::AuditSink;
use crate::ca::{CaSettings, CertificateAuthority, FileKeyStore};
use crate::identity::Identity;
use crate::policy::PolicyEngine;
use crate::proxy::SidecarProxy;
use crate::rotation::DEFAULT_INTERVAL;
use crate::validator::CertificateValidator;
use crate::Result;

/// Parameters of the demo run.
#[derive(Debug, Clone)]
pub struct DemoScenario {
    /// Calling service.
    pub source: String,
    /// Called service.
    pub destination: String,
    /// Number of outbound requests to send.
    pub requests: usize,
    /// Check interval of the caller's rotation loop.
    pub rotation_interval: Duration,
}

impl Default for DemoScenario {
    fn default() -> Self {
        Self {
            source: "payment-api".to_string(),
            destination: "user-service".to_string(),
            requests: 12,
            rotation_interval: DEFAULT_INTERVAL,
        }
    }
}

/// Verdict for one simulated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RequestOutcome {
    /// 1-based request number.
    pub request: usize,
    /// Proxy verdict.
    pub allowed: bool,
}

/// Result of [`run`].
#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    /// Caller identity.
    pub source: Identity,
    /// Callee identity.
    pub destination: Identity,
    /// Verdicts in request order.
    pub outcomes: Vec<RequestOutcome>,
}

impl DemoReport {
    /// Number of allowed requests.
    #[must_use]
    pub fn allowed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.allowed).count()
    }

    /// Number of denied requests.
    #[must_use]
    pub fn denied(&self) -> usize {
        self.outcomes.len() - self.allowed()
    }
}

/// Run `scenario` against a CA built from `settings` over `store`.
///
/// The CA writes and the sidecar reads the same `store`.  Initializes the CA
/// if needed and (re)issues both service certificates.  The scenario pair is
/// added to `policy` on top of whatever it already allows.
pub async fn run(
    settings: CaSettings,
    store: FileKeyStore,
    policy: Arc<PolicyEngine>,
    audit: Arc<dyn AuditSink>,
    scenario: &DemoScenario,
) -> Result<DemoReport> {
    let ca = Arc::new(CertificateAuthority::new(settings, Arc::new(store.clone())));
    ca.initialize()?;
    let source = ca.issue_service_certificate(&scenario.source)?.identity;
    let destination = ca.issue_service_certificate(&scenario.destination)?.identity;

    let validator = Arc::new(CertificateValidator::new(
        ca.root_certificate_pem()?.as_bytes(),
    )?);
    policy.allow(source.clone(), destination.clone());

    let proxy = SidecarProxy::new(source.clone(), validator, policy, audit)
        .with_ca(ca)
        .with_rotation_interval(scenario.rotation_interval);
    let cert_path = store.service_cert_path(&scenario.source);
    proxy.start_rotation(&cert_path, &scenario.source)?;

    info!(
        source = %source,
        destination = %destination,
        requests = scenario.requests,
        "Simulating requests"
    );
    let outcomes = (1..=scenario.requests)
        .map(|request| RequestOutcome {
            request,
            allowed: proxy.outbound_request(&cert_path, &destination),
        })
        .collect();
    proxy.stop_rotation().await;

    Ok(DemoReport {
        source,
        destination,
        outcomes,
    })
}
