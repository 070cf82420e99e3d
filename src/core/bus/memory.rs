// src/core/bus/memory.rs

//! An in-process pub/sub bus. Every shard created in the same process connects to
//! one [`MemoryHub`], which makes multi-shard setups runnable without an external
//! server.

use super::{BusInbox, BusMessage, PubSubBus};
use crate::core::PixelcastError;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, Receiver, Sender, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// The capacity of each topic's broadcast channel.
const TOPIC_CAPACITY: usize = 1024;

/// The shared topic table.
#[derive(Debug, Default)]
pub struct MemoryHub {
    topics: DashMap<String, Arc<Sender<Bytes>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Opens a new client connection on this hub.
    pub fn connect(self: &Arc<Self>) -> (MemoryBus, BusInbox) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let bus = MemoryBus {
            hub: self.clone(),
            inbox_tx,
            forwarders: Mutex::new(HashMap::new()),
        };
        (bus, inbox_rx)
    }

    fn subscribe(&self, topic: &str) -> Receiver<Bytes> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(broadcast::channel(TOPIC_CAPACITY).0))
            .value()
            .subscribe()
    }

    /// Returns the number of connections the message was delivered to.
    pub fn publish(&self, topic: &str, payload: Bytes) -> usize {
        self.topics
            .get(topic)
            .map_or(0, |sender| sender.send(payload).unwrap_or(0))
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |s| s.receiver_count())
    }

    pub fn topics(&self) -> Vec<String> {
        self.topics.iter().map(|e| e.key().clone()).collect()
    }

    /// Drops topics nobody listens to any more.
    pub fn purge_empty_topics(&self) -> usize {
        let mut purged = 0;
        self.topics.retain(|_topic, sender| {
            if sender.receiver_count() == 0 {
                purged += 1;
                false
            } else {
                true
            }
        });
        if purged > 0 {
            debug!("Purged {} empty bus topics.", purged);
        }
        purged
    }
}

/// One connection to a [`MemoryHub`].
///
/// Each subscribed topic gets a forwarding task that moves messages from the
/// topic's broadcast channel into this connection's inbox.
pub struct MemoryBus {
    hub: Arc<MemoryHub>,
    inbox_tx: mpsc::UnboundedSender<BusMessage>,
    forwarders: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl MemoryBus {
    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.forwarders.lock().keys().cloned().collect();
        topics.sort();
        topics
    }
}

async fn forward(topic: String, mut rx: Receiver<Bytes>, inbox: mpsc::UnboundedSender<BusMessage>) {
    loop {
        match rx.recv().await {
            Ok(payload) => {
                let message = BusMessage {
                    topic: topic.clone(),
                    payload,
                };
                if inbox.send(message).is_err() {
                    return;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Bus subscriber on '{}' lagged, {} messages dropped.", topic, skipped);
            }
            Err(RecvError::Closed) => return,
        }
    }
}

#[async_trait]
impl PubSubBus for MemoryBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PixelcastError> {
        self.hub.publish(topic, payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), PixelcastError> {
        let mut forwarders = self.forwarders.lock();
        if forwarders.contains_key(topic) {
            return Ok(());
        }
        // The receiver exists before this call returns, so nothing published
        // afterwards can be missed even if the task has not been polled yet.
        let rx = self.hub.subscribe(topic);
        let handle = tokio::spawn(forward(topic.to_string(), rx, self.inbox_tx.clone()));
        forwarders.insert(topic.to_string(), handle);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), PixelcastError> {
        if let Some(handle) = self.forwarders.lock().remove(topic) {
            handle.abort();
        }
        Ok(())
    }
}

impl Drop for MemoryBus {
    fn drop(&mut self) {
        for (_, handle) in self.forwarders.lock().drain() {
            handle.abort();
        }
    }
}
