// src/core/pixel_cache.rs

//! Coalesces single pixel writes into one packed buffer per chunk.
//!
//! Writes accumulate between flushes. A flush swaps the whole table for an empty
//! one before broadcasting anything, so writes made while the old table is being
//! broadcast (including writes from broker handlers) land in the next flush.

use crate::core::broker::EventBroker;
use crate::core::metrics;
use crate::core::protocol::chunk::{cache_key, split_cache_key};
use crate::core::protocol::pixel::PIXEL_RECORD_LEN;
use crate::core::protocol::{ChunkRef, PixelRecord};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::mem;

#[derive(Debug, Default)]
pub struct PixelCache {
    buffers: Mutex<HashMap<u32, BytesMut>>,
}

impl PixelCache {
    pub fn new() -> Self {
        Default::default()
    }

    /// Appends one packed pixel record to the buffer of chunk `(i, j)` on `canvas_id`.
    pub fn append(&self, canvas_id: u8, color: u8, i: u8, j: u8, offset: u32) {
        let key = cache_key(canvas_id, ChunkRef::new(i, j));
        let mut buffers = self.buffers.lock();
        let buffer = buffers
            .entry(key)
            .or_insert_with(|| BytesMut::with_capacity(PIXEL_RECORD_LEN * 8));
        PixelRecord::new(offset, color).write_to(buffer);
    }

    /// Hands every buffered chunk to `broker.broadcast_pixels` and returns the number
    /// of broadcasts made. An empty cache broadcasts nothing.
    pub fn flush(&self, broker: &dyn EventBroker) -> usize {
        let snapshot = mem::take(&mut *self.buffers.lock());
        if snapshot.is_empty() {
            return 0;
        }
        let timer = metrics::PIXEL_FLUSH_DURATION_SECONDS.start_timer();
        let batches = snapshot.len();
        for (key, buffer) in snapshot {
            let (canvas_id, chunk) = split_cache_key(key);
            metrics::PIXELS_FLUSHED_TOTAL.inc_by((buffer.len() / PIXEL_RECORD_LEN) as f64);
            broker.broadcast_pixels(canvas_id, chunk.key(), &buffer);
        }
        metrics::PIXEL_BATCHES_FLUSHED_TOTAL.inc_by(batches as f64);
        timer.observe_duration();
        batches
    }

    /// Number of chunks with pending writes.
    pub fn len(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.lock().is_empty()
    }
}
