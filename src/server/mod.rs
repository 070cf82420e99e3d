// src/server/mod.rs

use crate::config::Config;
use crate::core::state::LogReloadHandle;
use anyhow::{Context, Result};

mod connection_loop;
mod context;
mod initialization;
mod metrics_server;
pub mod socket_hub;
mod spawner;

pub use socket_hub::{SocketHub, SocketHubTask};

/// The main server startup function, orchestrating all setup phases.
pub async fn run(config: Config, log_reload_handle: LogReloadHandle) -> Result<()> {
    // 1. Build the broker, pixel cache and websocket hub, and bind the listener.
    let mut server_context = initialization::setup(config, log_reload_handle).await?;

    // 2. Spawn all background tasks. The bus tasks must run before the broker initializes.
    spawner::spawn_all(&mut server_context).await?;

    // 3. Wait out shard discovery.
    server_context
        .state
        .broker
        .initialize()
        .await
        .context("Failed to initialize the event broker")?;

    // 4. Serve websocket clients until shutdown.
    connection_loop::run(server_context).await
}
