// src/server/metrics_server.rs

use crate::core::metrics::{self, gather_metrics};
use crate::core::state::ServerState;
use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::{get, put};
use axum::{Router, http::StatusCode, response::IntoResponse};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Handles HTTP requests to the /metrics endpoint.
async fn metrics_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if let Some(cluster) = &state.cluster {
        metrics::KNOWN_SHARDS.set(cluster.known_shards().len() as f64);
    }

    let body = gather_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

/// Handles `PUT /log-level`. The body is an `EnvFilter` directive such as `debug`.
async fn log_level_handler(
    State(state): State<Arc<ServerState>>,
    body: String,
) -> impl IntoResponse {
    match state.set_log_level(body.trim()).await {
        Ok(()) => (StatusCode::OK, "OK\n".to_string()),
        Err(e) => (StatusCode::BAD_REQUEST, format!("{e}\n")),
    }
}

/// Runs a simple HTTP server exposing Prometheus metrics on /metrics and the
/// runtime log level on /log-level.
pub async fn run_metrics_server(
    state: Arc<ServerState>,
    port: u16,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/log-level", put(log_level_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics server on port {port}"))?;
    info!(
        "Prometheus metrics server listening on http://{}/metrics",
        addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("Metrics server shutting down.");
        })
        .await
        .context("Metrics server failed")
}
