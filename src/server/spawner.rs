// src/server/spawner.rs

//! Spawns all of the server's long-running background tasks.

use super::context::ServerContext;
use super::metrics_server;
use super::socket_hub::SocketHubTask;
use crate::core::bus::topic_purger::TopicPurgerTask;
use crate::core::tasks::PixelFlushTask;
use anyhow::{Result, anyhow};
use tracing::info;

/// Spawns all critical background tasks into the context's JoinSet.
pub async fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    let server_state = &ctx.state;
    let shutdown_tx = &ctx.shutdown_tx;
    let background_tasks = &mut ctx.background_tasks;

    let server_init = ctx
        .init
        .take()
        .ok_or_else(|| anyhow!("background tasks were already spawned"))?;

    let (metrics_config, flush_interval) = {
        let config = server_state.config.lock().await;
        (config.metrics.clone(), config.pixels.flush_interval)
    };

    // --- Metrics Server ---
    if metrics_config.enabled {
        let metrics_state = server_state.clone();
        let shutdown_rx_metrics = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            metrics_server::run_metrics_server(metrics_state, metrics_config.port, shutdown_rx_metrics)
                .await
        });
    } else {
        info!("Prometheus metrics server is disabled in the configuration.");
    }

    // --- Pixel Broadcasting ---
    let flush_task = PixelFlushTask::new(
        server_state.pixel_cache.clone(),
        server_state.broker.clone(),
        flush_interval,
    );
    let shutdown_rx_flush = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        flush_task.run(shutdown_rx_flush).await;
        Ok(())
    });

    let hub_task = SocketHubTask::new(ctx.hub.clone());
    let shutdown_rx_hub = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        hub_task.run(shutdown_rx_hub).await;
        Ok(())
    });

    // --- Cluster Bus ---
    if let Some(tasks) = server_init.cluster_tasks {
        let shutdown_rx_pub = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            tasks.publisher.run(shutdown_rx_pub).await;
            Ok(())
        });

        let shutdown_rx_listen = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            tasks.listener.run(shutdown_rx_listen).await;
            Ok(())
        });

        let shutdown_rx_health = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            tasks.health.run(shutdown_rx_health).await;
            Ok(())
        });
    }

    if let Some(subscriber) = server_init.resp_subscriber {
        let shutdown_rx_sub = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            subscriber.run(shutdown_rx_sub).await;
            Ok(())
        });
    }

    if let Some(hub) = server_state.memory_hub.clone() {
        let purger = TopicPurgerTask::new(hub);
        let shutdown_rx_purge = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            purger.run(shutdown_rx_purge).await;
            Ok(())
        });
    }

    info!("All background tasks have been spawned.");
    Ok(())
}
