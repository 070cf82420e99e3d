// src/core/protocol/chunk.rs

//! Chunk addressing and the inter-shard ChunkUpdate packet.

use super::{Opcode, expect_header};
use crate::core::PixelcastError;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Chunk coordinates within a canvas. Serialized as `[i, j]` in JSON frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "(u8, u8)", into = "(u8, u8)")]
pub struct ChunkRef {
    pub i: u8,
    pub j: u8,
}

impl ChunkRef {
    pub fn new(i: u8, j: u8) -> Self {
        Self { i, j }
    }

    /// The 16-bit chunk id used on the wire: `(i << 8) | j`.
    pub fn key(self) -> u16 {
        (u16::from(self.i) << 8) | u16::from(self.j)
    }

    pub fn from_key(key: u16) -> Self {
        Self {
            i: (key >> 8) as u8,
            j: (key & 0xFF) as u8,
        }
    }
}

impl From<(u8, u8)> for ChunkRef {
    fn from((i, j): (u8, u8)) -> Self {
        Self { i, j }
    }
}

impl From<ChunkRef> for (u8, u8) {
    fn from(chunk: ChunkRef) -> Self {
        (chunk.i, chunk.j)
    }
}

/// Packs a canvas id and chunk into the lookup key `(canvasId << 16) | (i << 8) | j`.
pub fn cache_key(canvas_id: u8, chunk: ChunkRef) -> u32 {
    (u32::from(canvas_id) << 16) | u32::from(chunk.key())
}

/// Inverse of [`cache_key`].
pub fn split_cache_key(key: u32) -> (u8, ChunkRef) {
    let canvas_id = ((key >> 16) & 0xFF) as u8;
    (canvas_id, ChunkRef::from_key((key & 0xFFFF) as u16))
}

/// `[0xC4][canvasId][i][j]`: a chunk changed by something other than a pixel update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkUpdate {
    pub canvas_id: u8,
    pub chunk: ChunkRef,
}

impl ChunkUpdate {
    pub const LEN: usize = 4;

    pub fn dehydrate(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u8(Opcode::ChunkUpdate.as_byte());
        buf.put_u8(self.canvas_id);
        buf.put_u8(self.chunk.i);
        buf.put_u8(self.chunk.j);
        buf.freeze()
    }

    pub fn hydrate(data: &[u8]) -> Result<Self, PixelcastError> {
        expect_header(data, Opcode::ChunkUpdate, Self::LEN)?;
        Ok(Self {
            canvas_id: data[1],
            chunk: ChunkRef::new(data[2], data[3]),
        })
    }
}
