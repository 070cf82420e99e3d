// src/core/tasks/pixel_flush.rs

use crate::core::broker::SharedBroker;
use crate::core::pixel_cache::PixelCache;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Flushes the pixel cache into the broker on a fixed period.
pub struct PixelFlushTask {
    cache: Arc<PixelCache>,
    broker: SharedBroker,
    period: Duration,
}

impl PixelFlushTask {
    pub fn new(cache: Arc<PixelCache>, broker: SharedBroker, period: Duration) -> Self {
        Self {
            cache,
            broker,
            period,
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Pixel flush task started with a {:?} period.", self.period);
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.cache.flush(self.broker.as_ref());
                }
                _ = shutdown_rx.recv() => {
                    // Pixels written since the last tick still go out.
                    let flushed = self.cache.flush(self.broker.as_ref());
                    debug!("Final pixel flush sent {} chunk batches.", flushed);
                    info!("Pixel flush task shutting down.");
                    return;
                }
            }
        }
    }
}
