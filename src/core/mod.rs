// src/core/mod.rs

//! The event broadcast subsystem: packet codecs, the event broker and its cluster
//! transport, pixel write coalescing and the tasks that drive them.

pub mod broker;
pub mod bus;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod pixel_cache;
pub mod protocol;
pub mod state;
pub mod tasks;

pub use broker::{EventBroker, SharedBroker};
pub use errors::PixelcastError;
pub use events::{BrokerEvent, EventKind};
