// src/client/mod.rs

//! The client side of the websocket protocol: a reconnecting connection that
//! replays its canvas and chunk subscriptions, keeps the link alive, and layers
//! short-lived request/response exchanges on top.

pub mod events;
pub mod requests;
pub mod socket;
pub mod state;

pub use events::ClientEvent;
pub use requests::{PendingRequests, RequestResult};
pub use socket::{CONNECT_TIMEOUT, ClientSettings, SocketClient, SocketClientTask};
pub use state::{ConnectionMachine, HealthAction, OutboundFrame, ReadyState};
