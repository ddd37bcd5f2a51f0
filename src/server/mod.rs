// src/server/mod.rs

//! Node lifecycle: initialization, background task spawning, the HTTP
//! surfaces, and graceful shutdown.

pub mod context;
pub mod control_api;
pub mod http_api;
pub mod initialization;
pub mod metrics_server;
pub mod spawner;

use crate::config::Config;
use anyhow::Result;
use axum::Router;
use context::LogReloadHandle;
use std::time::Duration;
use tracing::{error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Runs the node until a termination signal arrives, then drains.
pub async fn run(config: Config, log_reload_handle: LogReloadHandle) -> Result<()> {
    let mut ctx = initialization::setup(config, log_reload_handle).await?;
    spawner::spawn_all(&mut ctx).await?;

    let shared = ctx.shared.clone();
    let app = Router::new()
        .merge(http_api::router())
        .merge(control_api::router())
        .with_state(shared.clone());

    let http_listener = ctx.http_listener;
    let mut http_shutdown = shared.shutdown_tx.subscribe();
    let http_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, app)
            .with_graceful_shutdown(async move {
                http_shutdown.recv().await.ok();
            })
            .await
        {
            error!("HTTP server error: {e}");
        }
    });

    info!("Node is up.");
    wait_for_signal().await;
    info!("Termination signal received; draining.");

    // Broadcast shutdown and give tasks a bounded window to finish.
    let _ = shared.shutdown_tx.send(());
    let drain = async {
        let _ = http_task.await;
        while ctx.background_tasks.join_next().await.is_some() {}
        let _ = ctx.raft_task.await;
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("Background tasks did not drain in {SHUTDOWN_GRACE:?}; exiting anyway.");
    }
    info!("Shutdown complete.");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
