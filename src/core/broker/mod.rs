// src/core/broker/mod.rs

//! The event broker: the hub that fans pixel, chunk, chat and counter events out to
//! every local listener, and, in cluster mode, to every other shard.
//!
//! Two implementations share the [`EventBroker`] trait. [`LocalBroker`] serves a
//! single process. [`ClusterBroker`] wraps a `LocalBroker` and mirrors events over a
//! [`PubSubBus`](crate::core::bus::PubSubBus).

use crate::core::PixelcastError;
use crate::core::events::{BrokerEvent, ChatUser, DEFAULT_COUNTRY, EventKind};
use crate::core::protocol::{ChunkRef, OnlineCounter};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub mod cluster;
pub mod local;
pub mod registry;

pub use cluster::{ClusterBroker, ClusterSettings, ClusterTasks};
pub use local::LocalBroker;
pub use registry::{Delivery, EventHandler, HandlerRegistry};

#[async_trait]
pub trait EventBroker: Send + Sync {
    /// Completes startup. The cluster broker waits out its discovery grace period here.
    async fn initialize(&self) -> Result<(), PixelcastError>;

    fn shard_id(&self) -> &str;

    fn is_cluster(&self) -> bool {
        false
    }

    /// Subscribes a handler that runs synchronously inside `emit`.
    fn on(&self, kind: EventKind, handler: EventHandler);

    /// Subscribes a handler that runs on its own task after `emit` returns.
    fn on_async(&self, kind: EventKind, handler: EventHandler);

    fn emit(&self, event: BrokerEvent);

    /// Broadcasts pixels coalesced for one chunk. `pixels` holds packed 4-byte records.
    fn broadcast_pixels(&self, canvas_id: u8, chunk_key: u16, pixels: &[u8]);

    /// Announces that a chunk changed by other means than single pixel writes.
    fn broadcast_chunk_update(&self, canvas_id: u8, chunk: ChunkRef);

    /// Stores this shard's counter and emits the (cluster-wide) `onlineCounter` packet.
    fn broadcast_online_counter(&self, snapshot: OnlineCounter);

    /// The counter that was last sent to clients.
    fn online_counter(&self) -> OnlineCounter;

    fn lowest_active_shard(&self) -> String;

    /// Whether this shard should run cluster-wide periodic jobs.
    fn am_i_important(&self) -> bool;

    fn send_mail(&self, args: Vec<Value>) {
        self.emit(BrokerEvent::Mail { args });
    }

    fn recv_chat_message(&self, user: ChatUser, message: String, channel_id: u32) {
        self.emit(BrokerEvent::RecvChatMessage {
            user,
            message,
            channel_id,
        });
    }

    fn broadcast_chat_message(
        &self,
        name: String,
        message: String,
        channel_id: u32,
        user_id: u64,
        country: Option<String>,
        send_api: bool,
    ) {
        self.emit(BrokerEvent::ChatMessage {
            name,
            message,
            channel_id,
            user_id,
            country: country_or_default(country),
            send_api,
        });
    }

    fn broadcast_su_chat_message(
        &self,
        target_user_id: u64,
        name: String,
        message: String,
        channel_id: u32,
        user_id: u64,
        country: Option<String>,
    ) {
        self.emit(BrokerEvent::SingleUserChatMessage {
            target_user_id,
            name,
            message,
            channel_id,
            user_id,
            country: country_or_default(country),
        });
    }

    fn broadcast_add_chat_channel(&self, user_id: u64, channel_id: u32, channel: Value) {
        self.emit(BrokerEvent::AddChatChannel {
            user_id,
            channel_id,
            channel,
        });
    }

    fn broadcast_remove_chat_channel(&self, user_id: u64, channel_id: u32) {
        self.emit(BrokerEvent::RemoveChatChannel {
            user_id,
            channel_id,
        });
    }

    fn reload_user(&self, name: String) {
        self.emit(BrokerEvent::ReloadUser { name });
    }
}

fn country_or_default(country: Option<String>) -> String {
    country
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| DEFAULT_COUNTRY.to_string())
}

/// A shared, type-erased broker handle as passed to connection handlers and tasks.
pub type SharedBroker = Arc<dyn EventBroker>;
