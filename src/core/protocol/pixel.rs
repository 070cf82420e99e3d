// src/core/protocol/pixel.rs

//! Pixel update packets.
//!
//! Pixels travel as opcode-free 4-byte records `[offHigh:u8][offLow:u16 BE][color:u8]`
//! appended after a small per-chunk header. A single packet carries every pixel
//! written to one chunk during a flush interval.

use super::chunk::ChunkRef;
use super::{Opcode, expect_header};
use crate::core::PixelcastError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of one packed pixel record.
pub const PIXEL_RECORD_LEN: usize = 4;
/// Largest intra-chunk offset that fits the 21-bit encoding.
pub const MAX_OFFSET: u32 = (1 << 21) - 1;
/// Upper bound on pixels accepted from a single client packet.
pub const MAX_PIXELS_PER_PACKET: usize = 500;

/// Splits an intra-chunk offset into its high byte and low 16 bits.
pub fn split_offset(offset: u32) -> (u8, u16) {
    (((offset >> 16) & 0xFF) as u8, (offset & 0xFFFF) as u16)
}

pub fn join_offset(high: u8, low: u16) -> u32 {
    (u32::from(high) << 16) | u32::from(low)
}

/// One pixel write inside a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelRecord {
    pub offset: u32,
    pub color: u8,
}

impl PixelRecord {
    pub fn new(offset: u32, color: u8) -> Self {
        Self { offset, color }
    }

    pub fn write_to(&self, dst: &mut impl BufMut) {
        let (high, low) = split_offset(self.offset);
        dst.put_u8(high);
        dst.put_u16(low);
        dst.put_u8(self.color);
    }
}

/// Packs records back to back, without any header.
pub fn encode_records(pixels: &[PixelRecord]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(pixels.len() * PIXEL_RECORD_LEN);
    for pixel in pixels {
        pixel.write_to(&mut buf);
    }
    buf
}

/// Reads records in order until fewer than four bytes remain.
/// A partial trailing record is ignored.
pub fn decode_records(mut data: &[u8], limit: Option<usize>) -> Vec<PixelRecord> {
    let limit = limit.unwrap_or(usize::MAX);
    let mut pixels = Vec::with_capacity((data.len() / PIXEL_RECORD_LEN).min(limit));
    while data.remaining() >= PIXEL_RECORD_LEN && pixels.len() < limit {
        let high = data.get_u8();
        let low = data.get_u16();
        let color = data.get_u8();
        pixels.push(PixelRecord::new(join_offset(high, low), color));
    }
    pixels
}

/// Client-facing pixel update: `[0xC1][i][j]` + records.
///
/// The same layout is used by clients to request pixel placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelUpdate {
    pub chunk: ChunkRef,
    pub pixels: Vec<PixelRecord>,
}

impl PixelUpdate {
    pub const HEADER_LEN: usize = 3;

    pub fn new(chunk: ChunkRef, pixels: Vec<PixelRecord>) -> Self {
        Self { chunk, pixels }
    }

    pub fn dehydrate(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(Self::HEADER_LEN + self.pixels.len() * PIXEL_RECORD_LEN);
        buf.put_u8(Opcode::PixelUpdate.as_byte());
        buf.put_u8(self.chunk.i);
        buf.put_u8(self.chunk.j);
        for pixel in &self.pixels {
            pixel.write_to(&mut buf);
        }
        buf.freeze()
    }

    /// Builds the packet straight from already packed records, as produced by the
    /// pixel cache, without decoding them.
    pub fn from_packed(chunk: ChunkRef, packed: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::HEADER_LEN + packed.len());
        buf.put_u8(Opcode::PixelUpdate.as_byte());
        buf.put_u8(chunk.i);
        buf.put_u8(chunk.j);
        buf.extend_from_slice(packed);
        buf.freeze()
    }

    pub fn hydrate(data: &[u8]) -> Result<Self, PixelcastError> {
        Self::hydrate_limited(data, None)
    }

    /// Decodes a placement request from a client, keeping at most
    /// [`MAX_PIXELS_PER_PACKET`] pixels.
    pub fn hydrate_request(data: &[u8]) -> Result<Self, PixelcastError> {
        Self::hydrate_limited(data, Some(MAX_PIXELS_PER_PACKET))
    }

    fn hydrate_limited(data: &[u8], limit: Option<usize>) -> Result<Self, PixelcastError> {
        expect_header(data, Opcode::PixelUpdate, Self::HEADER_LEN)?;
        Ok(Self {
            chunk: ChunkRef::new(data[1], data[2]),
            pixels: decode_records(&data[Self::HEADER_LEN..], limit),
        })
    }
}

/// Inter-shard pixel update: `[0xC1][canvasId][i][j]` + records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPixelUpdate {
    pub canvas_id: u8,
    pub chunk: ChunkRef,
    /// Raw packed records, exactly as appended by the sender's pixel cache.
    pub records: Bytes,
}

impl ShardPixelUpdate {
    pub const HEADER_LEN: usize = 4;

    pub fn dehydrate(canvas_id: u8, chunk: ChunkRef, packed: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::HEADER_LEN + packed.len());
        buf.put_u8(Opcode::PixelUpdate.as_byte());
        buf.put_u8(canvas_id);
        buf.put_u8(chunk.i);
        buf.put_u8(chunk.j);
        buf.extend_from_slice(packed);
        buf.freeze()
    }

    pub fn hydrate(data: &Bytes) -> Result<Self, PixelcastError> {
        expect_header(data, Opcode::PixelUpdate, Self::HEADER_LEN)?;
        let whole = data.len() - (data.len() - Self::HEADER_LEN) % PIXEL_RECORD_LEN;
        Ok(Self {
            canvas_id: data[1],
            chunk: ChunkRef::new(data[2], data[3]),
            records: data.slice(Self::HEADER_LEN..whole),
        })
    }

    /// The client-facing packet for the same pixels.
    pub fn client_packet(&self) -> Bytes {
        PixelUpdate::from_packed(self.chunk, &self.records)
    }

    pub fn pixels(&self) -> Vec<PixelRecord> {
        decode_records(&self.records, None)
    }
}
