// src/core/broker/cluster/config.rs

//! The `[cluster]` section of the configuration file.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which pub/sub transport connects the shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    /// Shards inside one process share an in-memory hub.
    #[default]
    Memory,
    /// Shards talk through a Redis-compatible server.
    Resp,
}

/// Holds all configuration settings related to cluster mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// If `true`, events are mirrored to other shards over the bus.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bus: BusKind,
    #[serde(default = "default_bus_host")]
    pub bus_host: String,
    #[serde(default = "default_bus_port")]
    pub bus_port: u16,
    pub bus_password: Option<String>,
    /// The shared topic carrying announces and relayed events.
    #[serde(default = "default_broadcast_topic")]
    pub broadcast_topic: String,
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// A shard not heard from for longer than this is dropped.
    #[serde(default = "default_shard_timeout", with = "humantime_serde")]
    pub shard_timeout: Duration,
    /// How long a starting shard listens for announces before it counts as initialized.
    #[serde(default = "default_startup_grace", with = "humantime_serde")]
    pub startup_grace: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bus: BusKind::Memory,
            bus_host: default_bus_host(),
            bus_port: default_bus_port(),
            bus_password: None,
            broadcast_topic: default_broadcast_topic(),
            heartbeat_interval: default_heartbeat_interval(),
            shard_timeout: default_shard_timeout(),
            startup_grace: default_startup_grace(),
        }
    }
}

impl ClusterConfig {
    pub fn settings(&self) -> ClusterSettings {
        ClusterSettings {
            broadcast_topic: self.broadcast_topic.clone(),
            heartbeat_interval: self.heartbeat_interval,
            shard_timeout: self.shard_timeout,
            startup_grace: self.startup_grace,
        }
    }
}

/// The runtime knobs of a [`ClusterBroker`](super::ClusterBroker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSettings {
    pub broadcast_topic: String,
    pub heartbeat_interval: Duration,
    pub shard_timeout: Duration,
    pub startup_grace: Duration,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        ClusterConfig::default().settings()
    }
}

fn default_bus_host() -> String {
    "127.0.0.1".to_string()
}
fn default_bus_port() -> u16 {
    6379
}
fn default_broadcast_topic() -> String {
    "bc".to_string()
}
fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_shard_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_startup_grace() -> Duration {
    Duration::from_secs(25)
}
