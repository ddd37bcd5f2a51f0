// src/server/metrics_server.rs

use super::context::SharedState;
use crate::core::metrics::gather_metrics;
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Handles HTTP requests to the /metrics endpoint.
///
/// It updates dynamic gauges before gathering all registered metrics and
/// encoding them in the Prometheus text format.
async fn metrics_handler(shared: Arc<SharedState>) -> impl IntoResponse {
    let status = shared.raft.status();
    crate::core::metrics::RAFT_TERM.set(status.term as i64);
    crate::core::metrics::RAFT_COMMIT_INDEX.set(status.commit_index as i64);
    crate::core::metrics::RAFT_IS_LEADER.set(if status.is_leader() { 1.0 } else { 0.0 });
    crate::core::metrics::CLUSTER_LIVE_NODES.set(shared.store.live_nodes().len() as i64);

    let body = gather_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

/// Runs a simple HTTP server to expose Prometheus metrics on /metrics.
pub async fn run_metrics_server(shared: Arc<SharedState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let port = shared.config.metrics.port;
    let app = Router::new().route("/metrics", get(move || metrics_handler(shared.clone())));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(
        "Prometheus metrics server listening on http://{}/metrics",
        addr
    );

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server on port {}: {}", port, e);
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("Metrics server shutting down.");
        })
        .await
    {
        error!("Metrics server error: {e}");
    }
}
