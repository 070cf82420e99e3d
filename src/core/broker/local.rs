// src/core/broker/local.rs

//! The single-process broker.

use super::EventBroker;
use super::registry::{Delivery, EventHandler, HandlerRegistry};
use crate::core::PixelcastError;
use crate::core::events::{BrokerEvent, EventKind};
use crate::core::protocol::{ChunkRef, OnlineCounter, PixelUpdate};
use async_trait::async_trait;
use parking_lot::RwLock;

/// Delivers events to in-process handlers only.
///
/// The cluster broker embeds one of these and calls [`LocalBroker::deliver`] for
/// everything that must reach local listeners without being relayed again.
pub struct LocalBroker {
    shard_id: String,
    handlers: HandlerRegistry,
    online: RwLock<OnlineCounter>,
}

impl LocalBroker {
    pub fn new(shard_id: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            handlers: HandlerRegistry::new(),
            online: RwLock::new(OnlineCounter::default()),
        }
    }

    pub fn deliver(&self, event: &BrokerEvent) -> usize {
        self.handlers.dispatch(event)
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.handler_count(kind)
    }

    /// Emits `pixelUpdate` followed by `chunkUpdate` for an already built client packet.
    pub(crate) fn deliver_pixels(&self, canvas_id: u8, chunk: ChunkRef, packet: bytes::Bytes) {
        self.deliver(&BrokerEvent::PixelUpdate {
            canvas_id,
            chunk_key: chunk.key(),
            packet,
        });
        self.deliver(&BrokerEvent::ChunkUpdate { canvas_id, chunk });
    }

    /// Replaces the stored counter and emits its packet.
    pub(crate) fn deliver_online_counter(&self, counter: OnlineCounter) {
        let packet = counter.dehydrate();
        self.store_online_counter(counter);
        self.deliver(&BrokerEvent::OnlineCounter { packet });
    }

    pub(crate) fn store_online_counter(&self, counter: OnlineCounter) {
        *self.online.write() = counter;
    }
}

#[async_trait]
impl EventBroker for LocalBroker {
    async fn initialize(&self) -> Result<(), PixelcastError> {
        Ok(())
    }

    fn shard_id(&self) -> &str {
        &self.shard_id
    }

    fn on(&self, kind: EventKind, handler: EventHandler) {
        self.handlers.register(kind, Delivery::Inline, handler);
    }

    fn on_async(&self, kind: EventKind, handler: EventHandler) {
        self.handlers.register(kind, Delivery::Deferred, handler);
    }

    fn emit(&self, event: BrokerEvent) {
        self.deliver(&event);
    }

    fn broadcast_pixels(&self, canvas_id: u8, chunk_key: u16, pixels: &[u8]) {
        let chunk = ChunkRef::from_key(chunk_key);
        self.deliver_pixels(canvas_id, chunk, PixelUpdate::from_packed(chunk, pixels));
    }

    fn broadcast_chunk_update(&self, canvas_id: u8, chunk: ChunkRef) {
        self.deliver(&BrokerEvent::ChunkUpdate { canvas_id, chunk });
    }

    fn broadcast_online_counter(&self, snapshot: OnlineCounter) {
        self.deliver_online_counter(snapshot);
    }

    fn online_counter(&self) -> OnlineCounter {
        self.online.read().clone()
    }

    fn lowest_active_shard(&self) -> String {
        self.shard_id.clone()
    }

    fn am_i_important(&self) -> bool {
        true
    }
}
