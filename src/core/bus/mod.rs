// src/core/bus/mod.rs

//! The shared publish/subscribe bus that connects shards.
//!
//! A bus handle behaves like one pub/sub client connection: it publishes to any
//! topic and receives messages for the topics it subscribed to on a single inbox.

use crate::core::PixelcastError;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

pub mod memory;
pub mod resp;
pub mod topic_purger;

pub use memory::{MemoryBus, MemoryHub};
pub use resp::{RespBus, RespBusSettings, RespSubscriberTask};

/// A message delivered on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Receiving half of a bus connection.
pub type BusInbox = mpsc::UnboundedReceiver<BusMessage>;

#[async_trait]
pub trait PubSubBus: Send + Sync {
    /// Publishes a payload. Failures are reported but never retried by the bus.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PixelcastError>;

    async fn subscribe(&self, topic: &str) -> Result<(), PixelcastError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), PixelcastError>;
}
