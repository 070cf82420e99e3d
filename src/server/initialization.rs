// src/server/initialization.rs

//! Builds the server state and binds the websocket listener.

use super::context::ServerContext;
use super::socket_hub::SocketHub;
use crate::config::Config;
use crate::core::state::{LogReloadHandle, ServerState};
use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::info;

/// Initializes all server components before starting the main loop.
pub async fn setup(config: Config, log_reload_handle: LogReloadHandle) -> Result<ServerContext> {
    log_startup_info(&config);
    let (shutdown_tx, _) = broadcast::channel(1);

    let host = config.host.clone();
    let port = config.port;
    let sockets = config.sockets.clone();
    let max_clients = config.max_clients;

    let server_init = ServerState::initialize(config, log_reload_handle)?;
    let state = server_init.state.clone();
    info!("Server state initialized.");

    let hub = SocketHub::new(
        state.broker.clone(),
        state.pixel_cache.clone(),
        sockets,
        max_clients,
    );

    let listener = TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("Failed to bind {host}:{port}"))?;
    info!("pixelcast listening for websockets on ws://{}:{}/ws", host, port);

    Ok(ServerContext {
        state,
        init: Some(server_init),
        hub,
        listener,
        shutdown_tx,
        background_tasks: JoinSet::new(),
    })
}

fn log_startup_info(config: &Config) {
    info!("Starting pixelcast {}", env!("PIXELCAST_BUILD_VERSION"));
    info!("Shard name: {}", config.shard_name);
    if config.cluster.enabled {
        info!(
            "Server starting in CLUSTER mode on the {:?} bus (broadcast topic '{}').",
            config.cluster.bus, config.cluster.broadcast_topic
        );
    } else {
        info!("Server starting in STANDALONE mode.");
    }
}
