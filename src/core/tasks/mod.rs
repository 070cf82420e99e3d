// src/core/tasks/mod.rs

//! Long-running background tasks owned by the server: pixel flushing, cluster bus
//! I/O and shard liveness checks. Each task exits when the shutdown signal fires.

pub mod bus_relay;
pub mod pixel_flush;
pub mod shard_health;

pub use bus_relay::{BusListenerTask, BusPublisherTask};
pub use pixel_flush::PixelFlushTask;
pub use shard_health::ShardHealthTask;
