// tests/integration/test_helpers.rs

//! Test helpers and utilities for integration tests

use parking_lot::Mutex;
use pixelcast::core::broker::cluster::{ClusterBroker, ClusterSettings};
use pixelcast::core::broker::EventBroker;
use pixelcast::core::bus::{MemoryHub, PubSubBus};
use pixelcast::core::events::{BrokerEvent, EventKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, reload};

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Sets up minimal tracing for tests. Safe to call from every test.
pub fn init_tracing() {
    let (filter, _reload_handle) = reload::Layer::new(EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// Polls `condition` until it holds, panicking after a few seconds.
pub async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("Timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Cluster settings without the startup grace period.
pub fn fast_settings() -> ClusterSettings {
    ClusterSettings {
        startup_grace: Duration::ZERO,
        ..ClusterSettings::default()
    }
}

/// Collects every event of the given kinds a broker delivers locally.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<BrokerEvent>>>,
}

impl Recorder {
    pub fn attach(broker: &dyn EventBroker, kinds: &[EventKind]) -> Self {
        let recorder = Self::default();
        for kind in kinds {
            let sink = recorder.events.clone();
            broker.on(
                *kind,
                Arc::new(move |event: &BrokerEvent| sink.lock().push(event.clone())),
            );
        }
        recorder
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.events.lock().clone()
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<BrokerEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }
}

/// A set of cluster brokers sharing one in-memory bus, each with its bus
/// tasks running. Health checks are left to the test so eviction can be driven
/// with explicit timestamps.
pub struct TestCluster {
    pub hub: Arc<MemoryHub>,
    pub shards: Vec<Arc<ClusterBroker>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl TestCluster {
    pub async fn start(ids: &[&str]) -> Self {
        init_tracing();
        let hub = MemoryHub::new();
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut shards = Vec::new();
        for id in ids {
            let (bus, inbox) = hub.connect();
            let bus: Arc<dyn PubSubBus> = Arc::new(bus);
            let (broker, tasks) = ClusterBroker::new(*id, fast_settings(), bus, inbox);
            tokio::spawn(tasks.publisher.run(shutdown_tx.subscribe()));
            tokio::spawn(tasks.listener.run(shutdown_tx.subscribe()));
            broker
                .initialize()
                .await
                .expect("Failed to initialize cluster broker");
            shards.push(broker);
        }

        let cluster = Self {
            hub,
            shards,
            shutdown_tx,
        };
        let expected = ids.len() - 1;
        wait_for("shards to discover each other", || {
            cluster
                .shards
                .iter()
                .all(|shard| shard.known_shards().len() == expected)
        })
        .await;
        cluster
    }

    pub fn shard(&self, index: usize) -> &Arc<ClusterBroker> {
        &self.shards[index]
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}
