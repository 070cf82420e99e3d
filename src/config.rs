// src/config.rs

//! Loading and validation of the server configuration file.

use crate::core::broker::cluster::{BusKind, ClusterConfig};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::warn;

/// Settings of the pixel write cache.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PixelsConfig {
    /// How often buffered pixel writes are broadcast.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
}

impl Default for PixelsConfig {
    fn default() -> Self {
        Self {
            flush_interval: default_flush_interval(),
        }
    }
}

fn default_flush_interval() -> Duration {
    Duration::from_millis(20)
}

/// Settings of the websocket endpoint.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SocketsConfig {
    /// How often the online counter is recomputed and broadcast.
    #[serde(default = "default_online_counter_interval", with = "humantime_serde")]
    pub online_counter_interval: Duration,
    /// Connections silent for longer than this are closed.
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Largest accepted inbound websocket message, in bytes.
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
    #[serde(default = "default_max_chunks_per_client")]
    pub max_chunks_per_client: usize,
}

impl Default for SocketsConfig {
    fn default() -> Self {
        Self {
            online_counter_interval: default_online_counter_interval(),
            idle_timeout: default_idle_timeout(),
            max_payload: default_max_payload(),
            max_chunks_per_client: default_max_chunks_per_client(),
        }
    }
}

fn default_online_counter_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_idle_timeout() -> Duration {
    Duration::from_secs(120)
}
fn default_max_payload() -> usize {
    65536
}
fn default_max_chunks_per_client() -> usize {
    25000
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_port() -> u16 {
    8878
}

/// A raw representation of the config file before validation and resolution.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_max_clients")]
    max_clients: usize,
    shard_name: Option<String>,
    #[serde(default)]
    cluster: ClusterConfig,
    #[serde(default)]
    pixels: PixelsConfig,
    #[serde(default)]
    sockets: SocketsConfig,
    #[serde(default)]
    metrics: MetricsConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    4040
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_clients() -> usize {
    10000
}

/// Represents the final, validated, and resolved server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub max_clients: usize,
    /// This shard's id. Also the name of its private bus topic.
    pub shard_name: String,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub pixels: PixelsConfig,
    #[serde(default)]
    pub sockets: SocketsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            max_clients: default_max_clients(),
            shard_name: generate_shard_name().unwrap_or_else(|_| "shard".to_string()),
            cluster: ClusterConfig::default(),
            pixels: PixelsConfig::default(),
            sockets: SocketsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Loads, resolves and validates configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid configuration in '{path}'"))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let raw_config: RawConfig =
            toml::from_str(contents).context("Failed to parse TOML configuration")?;

        let shard_name = match raw_config.shard_name {
            Some(name) => name,
            None => generate_shard_name()?,
        };

        let config = Config {
            host: raw_config.host,
            port: raw_config.port,
            log_level: raw_config.log_level,
            max_clients: raw_config.max_clients,
            shard_name,
            cluster: raw_config.cluster,
            pixels: raw_config.pixels,
            sockets: raw_config.sockets,
            metrics: raw_config.metrics,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.max_clients == 0 {
            return Err(anyhow!("max_clients cannot be 0"));
        }
        validate_shard_name(&self.shard_name)?;

        if self.pixels.flush_interval.is_zero() {
            return Err(anyhow!("pixels.flush_interval cannot be 0"));
        }
        if self.sockets.online_counter_interval.is_zero() {
            return Err(anyhow!("sockets.online_counter_interval cannot be 0"));
        }
        if self.sockets.idle_timeout.is_zero() {
            return Err(anyhow!("sockets.idle_timeout cannot be 0"));
        }
        if self.sockets.max_payload < 16 {
            return Err(anyhow!("sockets.max_payload must be at least 16 bytes"));
        }

        let cluster = &self.cluster;
        if cluster.enabled {
            if cluster.broadcast_topic.is_empty() {
                return Err(anyhow!("cluster.broadcast_topic cannot be empty"));
            }
            if cluster.broadcast_topic == self.shard_name {
                return Err(anyhow!(
                    "shard_name cannot be the same as cluster.broadcast_topic"
                ));
            }
            if cluster.heartbeat_interval.is_zero() {
                return Err(anyhow!("cluster.heartbeat_interval cannot be 0"));
            }
            if cluster.shard_timeout <= cluster.heartbeat_interval {
                return Err(anyhow!(
                    "cluster.shard_timeout ({:?}) must be longer than cluster.heartbeat_interval ({:?})",
                    cluster.shard_timeout,
                    cluster.heartbeat_interval
                ));
            }
            if cluster.bus == BusKind::Resp && cluster.bus_host.trim().is_empty() {
                return Err(anyhow!("cluster.bus_host is required for the resp bus"));
            }
            if cluster.bus == BusKind::Memory {
                warn!(
                    "Cluster mode uses the in-memory bus; only shards in this process will see each other."
                );
            }
        }

        if self.metrics.enabled && self.metrics.port == self.port {
            return Err(anyhow!("metrics.port cannot be the same as port"));
        }
        Ok(())
    }
}

fn validate_shard_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(anyhow!("shard_name cannot be empty"));
    }
    // ':' and ',' delimit gossip relay frames.
    if name.contains([':', ',']) || name.chars().any(char::is_whitespace) {
        return Err(anyhow!(
            "shard_name '{name}' cannot contain ':', ',' or whitespace"
        ));
    }
    Ok(())
}

/// A random shard id: 20 random bytes, hex encoded.
pub fn generate_shard_name() -> Result<String> {
    let mut bytes = [0u8; 20];
    getrandom::fill(&mut bytes).map_err(|e| anyhow!("Failed to generate shard name: {e}"))?;
    Ok(hex::encode(bytes))
}
