//! Operator HTTP endpoint
//!
//! - `/healthz`: liveness, 200 while the process serves requests
//! - `/metrics`: the operator's Prometheus registry

use std::net::SocketAddr;

use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus_client::encoding::text::encode;
use tracing::{error, info};

use crate::controller::metrics::REGISTRY;
use crate::error::{Error, Result};

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler() -> impl IntoResponse {
    let mut body = String::new();
    if let Err(e) = encode(&mut body, &REGISTRY) {
        error!("Failed to encode metrics: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, [("content-type", "text/plain")], String::new());
    }
    (StatusCode::OK, [("content-type", OPENMETRICS_CONTENT_TYPE)], body)
}

pub fn router() -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
}

/// Serve `/healthz` and `/metrics` until the process exits
pub async fn run_server(addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("cannot bind metrics address {addr}: {e}")))?;
    info!("Metrics server listening on http://{}/metrics", addr);
    axum::serve(listener, router())
        .await
        .map_err(|e| Error::ConfigError(format!("metrics server failed: {e}")))
}
