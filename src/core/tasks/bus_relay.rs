// src/core/tasks/bus_relay.rs

//! The two halves of the cluster broker's bus I/O.
//!
//! Broker operations are synchronous, so outbound frames are queued and written by
//! [`BusPublisherTask`] in queue order. [`BusListenerTask`] feeds every inbound
//! frame back into the broker one at a time.

use crate::core::broker::ClusterBroker;
use crate::core::bus::{BusInbox, BusMessage, PubSubBus};
use crate::core::metrics;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

pub struct BusPublisherTask {
    bus: Arc<dyn PubSubBus>,
    outbound_rx: mpsc::UnboundedReceiver<BusMessage>,
}

impl BusPublisherTask {
    pub fn new(bus: Arc<dyn PubSubBus>, outbound_rx: mpsc::UnboundedReceiver<BusMessage>) -> Self {
        Self { bus, outbound_rx }
    }

    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Bus publisher task started.");
        loop {
            tokio::select! {
                message = self.outbound_rx.recv() => {
                    let Some(message) = message else {
                        info!("Bus publisher queue closed.");
                        return;
                    };
                    // Not retried; the next heartbeat resynchronizes peers.
                    if let Err(e) = self.bus.publish(&message.topic, message.payload).await {
                        metrics::BUS_PUBLISH_ERRORS_TOTAL.inc();
                        warn!("CLUSTER: Publish on '{}' failed: {}", message.topic, e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Bus publisher task shutting down.");
                    return;
                }
            }
        }
    }
}

pub struct BusListenerTask {
    broker: Arc<ClusterBroker>,
    inbox: BusInbox,
}

impl BusListenerTask {
    pub fn new(broker: Arc<ClusterBroker>, inbox: BusInbox) -> Self {
        Self { broker, inbox }
    }

    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Bus listener task started.");
        loop {
            tokio::select! {
                message = self.inbox.recv() => {
                    let Some(message) = message else {
                        info!("Bus inbox closed; listener exiting.");
                        return;
                    };
                    self.broker.handle_bus_message(message).await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Bus listener task shutting down.");
                    return;
                }
            }
        }
    }
}
