// src/core/broker/cluster/mod.rs

//! The cluster broker: a [`LocalBroker`] whose events are mirrored to every other
//! shard over a shared [`PubSubBus`].
//!
//! Generic events travel as text on the shared broadcast topic. Pixel, chunk and
//! online-counter traffic travels as binary frames on each shard's private topic,
//! which only the shards that discovered this one subscribe to. Shards discover
//! each other by announcing their id on the broadcast topic and re-announcing
//! whenever they hear a new one.

use super::EventBroker;
use super::local::LocalBroker;
use super::registry::EventHandler;
use crate::core::PixelcastError;
use crate::core::bus::{BusInbox, BusMessage, PubSubBus};
use crate::core::events::{BrokerEvent, EventKind};
use crate::core::metrics;
use crate::core::protocol::{
    ChunkRef, ChunkUpdate, OnlineCounter, Opcode, PixelUpdate, ShardPixelUpdate,
};
use crate::core::tasks::{BusListenerTask, BusPublisherTask, ShardHealthTask};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub mod config;
pub mod gossip;
pub mod registry;

pub use config::{BusKind, ClusterConfig, ClusterSettings};
pub use gossip::GossipFrame;
pub use registry::ShardRegistry;

/// The background tasks a [`ClusterBroker`] needs. All of them must be spawned.
pub struct ClusterTasks {
    pub publisher: BusPublisherTask,
    pub listener: BusListenerTask,
    pub health: ShardHealthTask,
}

pub struct ClusterBroker {
    local: LocalBroker,
    bus: Arc<dyn PubSubBus>,
    registry: Mutex<ShardRegistry>,
    settings: ClusterSettings,
    outbound: mpsc::UnboundedSender<BusMessage>,
    initialized: AtomicBool,
}

impl ClusterBroker {
    pub fn new(
        shard_id: impl Into<String>,
        settings: ClusterSettings,
        bus: Arc<dyn PubSubBus>,
        inbox: BusInbox,
    ) -> (Arc<Self>, ClusterTasks) {
        let shard_id = shard_id.into();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let broker = Arc::new(Self {
            local: LocalBroker::new(shard_id.clone()),
            bus: bus.clone(),
            registry: Mutex::new(ShardRegistry::new(shard_id)),
            settings,
            outbound,
            initialized: AtomicBool::new(false),
        });
        let tasks = ClusterTasks {
            publisher: BusPublisherTask::new(bus, outbound_rx),
            listener: BusListenerTask::new(broker.clone(), inbox),
            health: ShardHealthTask::new(broker.clone()),
        };
        (broker, tasks)
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Remote shards currently considered alive, sorted.
    pub fn known_shards(&self) -> Vec<String> {
        self.registry.lock().known_shards()
    }

    /// Queues a frame for the publisher task. Frames leave in the order they were queued.
    fn enqueue(&self, topic: &str, payload: Bytes) {
        let message = BusMessage {
            topic: topic.to_string(),
            payload,
        };
        if self.outbound.send(message).is_err() {
            warn!("CLUSTER: Bus publisher is gone; dropping frame for '{}'.", topic);
        }
    }

    fn publish_gossip(&self, frame: GossipFrame) {
        metrics::BUS_FRAMES_PUBLISHED_TOTAL
            .with_label_values(&["gossip"])
            .inc();
        self.enqueue(&self.settings.broadcast_topic, frame.format());
    }

    fn publish_binary(&self, payload: Bytes) {
        metrics::BUS_FRAMES_PUBLISHED_TOTAL
            .with_label_values(&["binary"])
            .inc();
        self.enqueue(self.local.shard_id(), payload);
    }

    fn announce(&self) {
        self.publish_gossip(GossipFrame::Announce(self.local.shard_id().to_string()));
    }

    /// Handles one frame from the bus. Undecodable frames are logged and dropped.
    pub async fn handle_bus_message(&self, message: BusMessage) {
        metrics::BUS_FRAMES_RECEIVED_TOTAL.inc();
        let result = if message.topic == self.settings.broadcast_topic {
            self.handle_gossip(&message.payload).await
        } else {
            self.handle_shard_frame(&message.topic, &message.payload)
        };
        if let Err(e) = result {
            metrics::BUS_FRAMES_DROPPED_TOTAL.inc();
            warn!(
                "CLUSTER: Dropping undecodable frame on '{}': {}",
                message.topic, e
            );
        }
    }

    async fn handle_gossip(&self, payload: &[u8]) -> Result<(), PixelcastError> {
        let frame = GossipFrame::parse(payload)?;
        if frame.shard() == self.local.shard_id() {
            return Ok(());
        }
        let now = now_ms();
        match frame {
            GossipFrame::Announce(shard) => {
                if self.registry.lock().touch(&shard, now) {
                    return Ok(());
                }
                // Subscribe before registering so no binary frame of the new shard is missed.
                self.bus.subscribe(&shard).await?;
                let is_new = {
                    let mut registry = self.registry.lock();
                    let is_new = registry.observe(&shard, now);
                    metrics::KNOWN_SHARDS.set(registry.len() as f64);
                    is_new
                };
                if is_new {
                    info!("CLUSTER: Shard {} connected", shard);
                    self.announce();
                }
            }
            GossipFrame::Relay { shard, kind, args } => {
                self.registry.lock().touch(&shard, now);
                let event = BrokerEvent::from_json_args(&kind, &args)?;
                if !event.kind().is_relayed() {
                    debug!("CLUSTER: Ignoring shard-local '{}' relayed by {}", kind, shard);
                    return Ok(());
                }
                debug!("CLUSTER: Broadcast '{}' from {}", kind, shard);
                self.local.deliver(&event);
            }
        }
        Ok(())
    }

    fn handle_shard_frame(&self, shard: &str, payload: &Bytes) -> Result<(), PixelcastError> {
        if !self.registry.lock().touch(shard, now_ms()) {
            debug!("CLUSTER: Ignoring frame from unregistered shard {}", shard);
            return Ok(());
        }
        match Opcode::peek(payload)? {
            Opcode::PixelUpdate => {
                let update = ShardPixelUpdate::hydrate(payload)?;
                self.local
                    .deliver_pixels(update.canvas_id, update.chunk, update.client_packet());
            }
            Opcode::ChunkUpdate => {
                let update = ChunkUpdate::hydrate(payload)?;
                self.local.deliver(&BrokerEvent::ChunkUpdate {
                    canvas_id: update.canvas_id,
                    chunk: update.chunk,
                });
            }
            Opcode::OnlineCounter => {
                let counter = OnlineCounter::hydrate(payload)?;
                let aggregate = {
                    let mut registry = self.registry.lock();
                    registry.update_counter(shard, counter);
                    registry.aggregate()
                };
                self.local.store_online_counter(aggregate);
            }
            other => {
                return Err(PixelcastError::MalformedPacket(format!(
                    "unexpected {other:?} frame on shard topic"
                )));
            }
        }
        Ok(())
    }

    pub async fn check_health(&self) {
        self.check_health_at(now_ms()).await;
    }

    /// Drops shards not heard from within the shard timeout, then sends a heartbeat.
    pub async fn check_health_at(&self, now_ms: u64) {
        let timeout_ms = self.settings.shard_timeout.as_millis() as u64;
        let (evicted, aggregate) = {
            let mut registry = self.registry.lock();
            let evicted = registry.evict_stale(now_ms, timeout_ms);
            metrics::KNOWN_SHARDS.set(registry.len() as f64);
            (evicted, registry.aggregate())
        };
        if !evicted.is_empty() {
            self.local.store_online_counter(aggregate);
        }
        for shard in evicted {
            info!("CLUSTER: Shard {} disconnected", shard);
            if let Err(e) = self.bus.unsubscribe(&shard).await {
                warn!("CLUSTER: Could not unsubscribe from shard {}: {}", shard, e);
            }
        }
        self.announce();
    }
}

#[async_trait]
impl EventBroker for ClusterBroker {
    async fn initialize(&self) -> Result<(), PixelcastError> {
        self.bus.subscribe(&self.settings.broadcast_topic).await?;
        self.announce();
        tokio::time::sleep(self.settings.startup_grace).await;
        self.initialized.store(true, Ordering::Release);
        info!(
            "CLUSTER: Initialized message broker as shard {} ({} other shards known)",
            self.local.shard_id(),
            self.registry.lock().len()
        );
        Ok(())
    }

    fn shard_id(&self) -> &str {
        self.local.shard_id()
    }

    fn is_cluster(&self) -> bool {
        true
    }

    fn on(&self, kind: EventKind, handler: EventHandler) {
        self.local.on(kind, handler);
    }

    fn on_async(&self, kind: EventKind, handler: EventHandler) {
        self.local.on_async(kind, handler);
    }

    fn emit(&self, event: BrokerEvent) {
        self.local.deliver(&event);
        let kind = event.kind();
        if !kind.is_relayed() {
            return;
        }
        match event.to_json_args() {
            Ok(args) => self.publish_gossip(GossipFrame::Relay {
                shard: self.local.shard_id().to_string(),
                kind: kind.to_string(),
                args,
            }),
            Err(e) => warn!("CLUSTER: Could not encode '{}' for relay: {}", kind, e),
        }
    }

    fn broadcast_pixels(&self, canvas_id: u8, chunk_key: u16, pixels: &[u8]) {
        let chunk = ChunkRef::from_key(chunk_key);
        self.publish_binary(ShardPixelUpdate::dehydrate(canvas_id, chunk, pixels));
        self.local
            .deliver_pixels(canvas_id, chunk, PixelUpdate::from_packed(chunk, pixels));
    }

    fn broadcast_chunk_update(&self, canvas_id: u8, chunk: ChunkRef) {
        self.publish_binary(ChunkUpdate { canvas_id, chunk }.dehydrate());
        self.local
            .deliver(&BrokerEvent::ChunkUpdate { canvas_id, chunk });
    }

    fn broadcast_online_counter(&self, snapshot: OnlineCounter) {
        let packet = snapshot.dehydrate();
        let aggregate = {
            let mut registry = self.registry.lock();
            let my_id = registry.my_id().to_string();
            registry.update_counter(&my_id, snapshot);
            registry.aggregate()
        };
        self.publish_binary(packet);
        self.local.deliver_online_counter(aggregate);
    }

    fn online_counter(&self) -> OnlineCounter {
        self.local.online_counter()
    }

    fn lowest_active_shard(&self) -> String {
        self.registry.lock().lowest_active_shard()
    }

    fn am_i_important(&self) -> bool {
        self.registry.lock().am_i_important()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
