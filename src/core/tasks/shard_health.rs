// src/core/tasks/shard_health.rs

use crate::core::broker::ClusterBroker;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Periodically evicts silent shards and sends this shard's heartbeat.
pub struct ShardHealthTask {
    broker: Arc<ClusterBroker>,
}

impl ShardHealthTask {
    pub fn new(broker: Arc<ClusterBroker>) -> Self {
        Self { broker }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let period = self.broker.settings().heartbeat_interval;
        info!("Shard health task started. Heartbeat every {:?}.", period);
        let mut interval = tokio::time::interval(period);
        // The broker announces itself on startup; skip the immediate first tick.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.broker.check_health().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Shard health task shutting down.");
                    return;
                }
            }
        }
    }
}
