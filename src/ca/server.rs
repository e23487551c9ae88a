//! CA control API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/` | Health status |
//! | `GET` | `/v1/ca/cert` | Root certificate as `{"root_ca": "<PEM>"}` |
//! | `POST` | `/v1/certificate` | Issue for `{"service_name": "..."}`, returns `{"issued": "..."}` |
//!
//! Errors are JSON `{"error": "<code>", "message": "<detail>"}`:
//! invalid service name → `400`, CA not initialized → `503`, anything else → `500`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use super::CertificateAuthority;
use super::client::{EnrollRequest, EnrollResponse, HealthResponse, RootCaResponse};
use crate::Error;

/// Status line returned by `GET /`.
pub const HEALTH_STATUS: &str = "Cipher CA running";

// ── Route builder ─────────────────────────────────────────────────────────

/// Build the control API router.
pub fn routes(ca: Arc<CertificateAuthority>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/v1/ca/cert", get(root_certificate))
        .route("/v1/certificate", post(issue_certificate))
        .layer(TraceLayer::new_for_http())
        .with_state(ca)
}

/// Serve the control API on `listener` until `shutdown` resolves.
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    ca: Arc<CertificateAuthority>,
    shutdown: F,
) -> crate::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(addr = %addr, "CA control API listening");
    axum::serve(listener, routes(ca))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Internal(e.to_string()))
}

/// Bind `addr` and serve the control API until Ctrl+C / SIGTERM.
pub async fn serve(addr: SocketAddr, ca: Arc<CertificateAuthority>) -> crate::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_with_shutdown(listener, ca, shutdown_signal()).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}

// ── Handlers ──────────────────────────────────────────────────────────────

/// `GET /`
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: HEALTH_STATUS.to_string(),
    })
}

/// `GET /v1/ca/cert`
async fn root_certificate(State(ca): State<Arc<CertificateAuthority>>) -> Response {
    match ca.root_certificate_pem() {
        Ok(root_ca) => Json(RootCaResponse { root_ca }).into_response(),
        Err(e) => error_response(&e),
    }
}

/// `POST /v1/certificate`
async fn issue_certificate(
    State(ca): State<Arc<CertificateAuthority>>,
    Json(body): Json<EnrollRequest>,
) -> Response {
    let service_name = body.service_name;
    let name = service_name.clone();
    // Key generation and file writes block.
    let result = tokio::task::spawn_blocking(move || ca.issue_service_certificate(&name)).await;

    match result {
        Ok(Ok(_)) => Json(EnrollResponse {
            issued: service_name,
        })
        .into_response(),
        Ok(Err(e)) => {
            warn!(service = %service_name, error = %e, "Issuance failed");
            error_response(&e)
        }
        Err(e) => {
            error!(service = %service_name, error = %e, "Issuance task panicked");
            error_response(&Error::Internal(e.to_string()))
        }
    }
}

fn error_response(err: &Error) -> Response {
    let (status, code) = match err {
        Error::InvalidServiceName(_) => (StatusCode::BAD_REQUEST, "invalid_service_name"),
        Error::CaNotInitialized => (StatusCode::SERVICE_UNAVAILABLE, "ca_not_initialized"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };
    (
        status,
        Json(json!({"error": code, "message": err.to_string()})),
    )
        .into_response()
}
