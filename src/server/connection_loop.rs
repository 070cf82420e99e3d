// src/server/connection_loop.rs

//! Serves websocket connections and handles graceful shutdown.

use super::context::ServerContext;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs until a signal arrives or a critical task stops, then shuts everything down.
pub async fn run(mut ctx: ServerContext) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;

    let app = ctx
        .hub
        .router()
        .into_make_service_with_connect_info::<SocketAddr>();
    let mut serve_shutdown_rx = ctx.shutdown_tx.subscribe();
    let serve = axum::serve(ctx.listener, app).with_graceful_shutdown(async move {
        serve_shutdown_rx.recv().await.ok();
    });
    let mut server = tokio::spawn(async move { serve.await });
    let mut server_done = false;

    loop {
        tokio::select! {
            biased;

            _ = sigint.recv() => {
                info!("SIGINT received, initiating graceful shutdown.");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, initiating graceful shutdown.");
                break;
            }

            res = &mut server => {
                server_done = true;
                match res {
                    Ok(Ok(())) => warn!("Websocket server stopped unexpectedly."),
                    Ok(Err(e)) => error!("CRITICAL: Websocket server failed: {}. Shutting down.", e),
                    Err(e) => error!("CRITICAL: Websocket server panicked: {e:?}. Shutting down."),
                }
                break;
            }

            Some(res) = ctx.background_tasks.join_next() => {
                match res {
                    Ok(Ok(())) => warn!("A background task finished unexpectedly without an error."),
                    Ok(Err(e)) => { error!("CRITICAL: Background task failed: {}. Shutting down.", e); break; }
                    Err(e) => { error!("CRITICAL: Background task panicked: {e:?}. Shutting down."); break; }
                }
            },
        }
    }

    info!("Shutting down. Sending signal to all tasks.");
    if ctx.shutdown_tx.send(()).is_err() {
        error!("Failed to send shutdown signal. Some tasks may not terminate gracefully.");
    }
    ctx.hub.close_all();

    if !server_done && tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut server).await.is_err() {
        warn!("Timed out waiting for websocket connections to close.");
        server.abort();
    }
    info!("All websocket connections closed.");

    info!("Waiting for background tasks to finish...");
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        while ctx.background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Timed out waiting for background tasks to finish cleanly.");
    };
    info!("Server shutdown complete.");
    Ok(())
}
