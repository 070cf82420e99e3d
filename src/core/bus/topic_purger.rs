// src/core/bus/topic_purger.rs

//! A background task that drops in-process bus topics nobody listens to.
//!
//! Shards that were evicted leave their private topic behind on the hub; this
//! reclaims them.

use super::MemoryHub;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

const PURGE_INTERVAL: Duration = Duration::from_secs(300);

pub struct TopicPurgerTask {
    hub: Arc<MemoryHub>,
}

impl TopicPurgerTask {
    pub fn new(hub: Arc<MemoryHub>) -> Self {
        Self { hub }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Bus topic purger task started.");
        let mut interval = tokio::time::interval(PURGE_INTERVAL);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.hub.purge_empty_topics();
                }
                _ = shutdown_rx.recv() => {
                    info!("Bus topic purger task shutting down.");
                    return;
                }
            }
        }
    }
}
