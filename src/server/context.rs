// src/server/context.rs

use super::socket_hub::SocketHub;
use crate::core::state::{ServerInit, ServerState};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

/// Holds all the initialized state required to run the server's main loop.
pub struct ServerContext {
    pub state: Arc<ServerState>,
    /// Tasks created with the state; taken by the spawner.
    pub init: Option<ServerInit>,
    pub hub: Arc<SocketHub>,
    pub listener: TcpListener,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<Result<(), anyhow::Error>>,
}
