// src/core/metrics.rs

//! Defines and registers Prometheus metrics for the broadcast path.
//!
//! Metrics are registered once in the default registry through `lazy_static`.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, TextEncoder, register_counter, register_counter_vec,
    register_gauge, register_histogram,
};

lazy_static! {
    // --- Gauges ---
    /// Websocket clients currently connected to this shard.
    pub static ref CONNECTED_SOCKETS: Gauge =
        register_gauge!("pixelcast_connected_sockets", "Number of currently connected websocket clients.").unwrap();
    /// Remote shards this shard currently considers alive.
    pub static ref KNOWN_SHARDS: Gauge =
        register_gauge!("pixelcast_known_shards", "Number of live remote shards.").unwrap();


    // --- Counters ---
    /// Per-chunk batches handed to the broker by the pixel cache.
    pub static ref PIXEL_BATCHES_FLUSHED_TOTAL: Counter =
        register_counter!("pixelcast_pixel_batches_flushed_total", "Total number of per-chunk pixel batches flushed.").unwrap();
    pub static ref PIXELS_FLUSHED_TOTAL: Counter =
        register_counter!("pixelcast_pixels_flushed_total", "Total number of pixel records flushed.").unwrap();
    /// Frames published on the bus, labeled by `gossip` or `binary`.
    pub static ref BUS_FRAMES_PUBLISHED_TOTAL: CounterVec =
        register_counter_vec!("pixelcast_bus_frames_published_total", "Total number of frames published on the bus.", &["kind"]).unwrap();
    pub static ref BUS_FRAMES_RECEIVED_TOTAL: Counter =
        register_counter!("pixelcast_bus_frames_received_total", "Total number of frames received from the bus.").unwrap();
    /// Inbound bus frames that failed to decode and were dropped.
    pub static ref BUS_FRAMES_DROPPED_TOTAL: Counter =
        register_counter!("pixelcast_bus_frames_dropped_total", "Total number of undecodable bus frames dropped.").unwrap();
    pub static ref BUS_PUBLISH_ERRORS_TOTAL: Counter =
        register_counter!("pixelcast_bus_publish_errors_total", "Total number of failed bus publishes.").unwrap();


    // --- Histograms ---
    /// Time spent handing one pixel cache snapshot to the broker.
    pub static ref PIXEL_FLUSH_DURATION_SECONDS: Histogram =
        register_histogram!("pixelcast_pixel_flush_duration_seconds", "Pixel cache flush duration in seconds.").unwrap();
}

/// Gathers all registered metrics and encodes them into the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| format!("# failed to encode metrics: {e}\n"))
}
