// src/core/protocol/online.rs

//! Online user counters.

use super::{Opcode, expect_header};
use crate::core::PixelcastError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Number of connected users, in total and per canvas.
///
/// Wire layout: `[0xA7][total:u16]` followed by zero or more
/// `[canvasId:u8][count:u16]` records. Counts saturate at `u16::MAX` on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineCounter {
    pub total: u32,
    pub canvases: BTreeMap<u8, u32>,
}

impl OnlineCounter {
    pub const HEADER_LEN: usize = 3;
    const RECORD_LEN: usize = 3;

    pub fn new(total: u32) -> Self {
        Self {
            total,
            canvases: BTreeMap::new(),
        }
    }

    pub fn with_canvas(mut self, canvas_id: u8, count: u32) -> Self {
        self.canvases.insert(canvas_id, count);
        self
    }

    pub fn canvas(&self, canvas_id: u8) -> u32 {
        self.canvases.get(&canvas_id).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0 && self.canvases.values().all(|&c| c == 0)
    }

    /// Adds every key of `other` onto `self`.
    pub fn absorb(&mut self, other: &OnlineCounter) {
        self.total = self.total.saturating_add(other.total);
        for (&canvas_id, &count) in &other.canvases {
            let entry = self.canvases.entry(canvas_id).or_insert(0);
            *entry = entry.saturating_add(count);
        }
    }

    /// Per-key sum over any number of snapshots.
    pub fn sum<'a>(snapshots: impl IntoIterator<Item = &'a OnlineCounter>) -> OnlineCounter {
        let mut aggregate = OnlineCounter::default();
        for snapshot in snapshots {
            aggregate.absorb(snapshot);
        }
        aggregate
    }

    pub fn dehydrate(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(Self::HEADER_LEN + self.canvases.len() * Self::RECORD_LEN);
        buf.put_u8(Opcode::OnlineCounter.as_byte());
        buf.put_u16(clamp_u16(self.total));
        for (&canvas_id, &count) in &self.canvases {
            buf.put_u8(canvas_id);
            buf.put_u16(clamp_u16(count));
        }
        buf.freeze()
    }

    pub fn hydrate(data: &[u8]) -> Result<Self, PixelcastError> {
        expect_header(data, Opcode::OnlineCounter, Self::HEADER_LEN)?;
        let mut body = &data[1..];
        let total = u32::from(body.get_u16());
        let mut canvases = BTreeMap::new();
        while body.remaining() >= Self::RECORD_LEN {
            let canvas_id = body.get_u8();
            let count = u32::from(body.get_u16());
            canvases.insert(canvas_id, count);
        }
        Ok(Self { total, canvases })
    }
}

fn clamp_u16(value: u32) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}
