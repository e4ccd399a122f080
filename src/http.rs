//! HTTP Status Server
//!
//! Small loopback endpoint for checking the relay from a browser or script:
//! connection counts, Prometheus metrics and the TLS certificate.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tracing::{error, info};

use crate::certificate::{CertError, CertificateManager};
use crate::hub::RelayHub;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub hub: Arc<RelayHub>,
    pub certs: Arc<CertificateManager>,
}

/// Creates the HTTP router with status endpoints.
pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler))
        .route("/certificate", get(certificate_handler))
        .route("/certificate/regenerate", post(regenerate_handler))
        .with_state(state)
}

async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "deck-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/metrics", "/status", "/certificate", "/certificate/regenerate"]
    }))
}

async fn metrics_handler(State(state): State<HttpState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.hub.metrics().encode(),
    )
}

async fn status_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let counts = state.hub.counts();
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "clientCount": counts.client_count,
        "mainAppCount": counts.main_app_count,
        "hasPrimary": counts.main_app_count > 0,
    }))
}

async fn certificate_handler(State(state): State<HttpState>) -> Response {
    let certs = state.certs.clone();
    match tokio::task::spawn_blocking(move || certs.material()).await {
        Ok(Ok(material)) => Json(serde_json::json!({
            "fingerprint": material.fingerprint(),
            "certificate": material.cert_pem(),
        }))
        .into_response(),
        Ok(Err(e)) => cert_error(e),
        Err(e) => {
            error!("Certificate task failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn regenerate_handler(State(state): State<HttpState>) -> Response {
    let certs = state.certs.clone();
    match tokio::task::spawn_blocking(move || certs.regenerate()).await {
        Ok(Ok(material)) => {
            info!("Certificate regenerated: {}", material.fingerprint());
            Json(serde_json::json!({ "fingerprint": material.fingerprint() })).into_response()
        }
        Ok(Err(e)) => cert_error(e),
        Err(e) => {
            error!("Certificate task failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn cert_error(e: CertError) -> Response {
    error!("Certificate unavailable: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": e.to_string() })),
    )
        .into_response()
}
