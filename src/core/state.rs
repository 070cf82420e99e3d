// src/core/state.rs

//! The process-wide server state, built once at startup and shared by reference.

use crate::config::Config;
use crate::core::PixelcastError;
use crate::core::broker::cluster::BusKind;
use crate::core::broker::{ClusterBroker, ClusterTasks, LocalBroker, SharedBroker};
use crate::core::bus::{MemoryHub, RespBus, RespBusSettings, RespSubscriberTask};
use crate::core::pixel_cache::PixelCache;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, reload};

pub type LogReloadHandle = Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>;

pub struct ServerState {
    pub config: Mutex<Config>,
    pub broker: SharedBroker,
    /// Present in cluster mode only.
    pub cluster: Option<Arc<ClusterBroker>>,
    pub pixel_cache: Arc<PixelCache>,
    /// Present when the cluster runs over the in-memory bus.
    pub memory_hub: Option<Arc<MemoryHub>>,
    /// A handle to the logging filter, allowing for runtime log level changes.
    pub log_reload_handle: LogReloadHandle,
}

/// The state plus the tasks that must be spawned before the broker is initialized.
pub struct ServerInit {
    pub state: Arc<ServerState>,
    pub cluster_tasks: Option<ClusterTasks>,
    pub resp_subscriber: Option<RespSubscriberTask>,
}

impl ServerState {
    pub fn initialize(config: Config, log_reload_handle: LogReloadHandle) -> Result<ServerInit> {
        let pixel_cache = Arc::new(PixelCache::new());
        let shard_name = config.shard_name.clone();

        let mut memory_hub = None;
        let mut resp_subscriber = None;
        let (broker, cluster, cluster_tasks) = if config.cluster.enabled {
            let settings = config.cluster.settings();
            let (cluster, tasks) = match config.cluster.bus {
                BusKind::Memory => {
                    let hub = MemoryHub::new();
                    let (bus, inbox) = hub.connect();
                    memory_hub = Some(hub);
                    ClusterBroker::new(shard_name, settings, Arc::new(bus), inbox)
                }
                BusKind::Resp => {
                    let mut bus_settings =
                        RespBusSettings::new(config.cluster.bus_host.clone(), config.cluster.bus_port);
                    bus_settings.password = config.cluster.bus_password.clone();
                    let (bus, subscriber, inbox) = RespBus::new(bus_settings);
                    resp_subscriber = Some(subscriber);
                    ClusterBroker::new(shard_name, settings, Arc::new(bus), inbox)
                }
            };
            info!("Cluster broker created on the {:?} bus.", config.cluster.bus);
            let broker: SharedBroker = cluster.clone();
            (broker, Some(cluster), Some(tasks))
        } else {
            let broker: SharedBroker = Arc::new(LocalBroker::new(shard_name));
            (broker, None, None)
        };

        let state = Arc::new(ServerState {
            config: Mutex::new(config),
            broker,
            cluster,
            pixel_cache,
            memory_hub,
            log_reload_handle,
        });

        Ok(ServerInit {
            state,
            cluster_tasks,
            resp_subscriber,
        })
    }

    /// Swaps the active log filter and records the new level in the config.
    pub async fn set_log_level(&self, level: &str) -> Result<(), PixelcastError> {
        let filter = EnvFilter::try_new(level)
            .map_err(|e| PixelcastError::InvalidState(format!("invalid log level '{level}': {e}")))?;
        self.log_reload_handle
            .reload(filter)
            .map_err(|e| PixelcastError::Internal(format!("failed to reload log filter: {e}")))?;
        self.config.lock().await.log_level = level.to_string();
        info!("Log level changed to '{}'.", level);
        Ok(())
    }
}
