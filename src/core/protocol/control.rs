// src/core/protocol/control.rs

//! Small fixed-layout control packets: keep-alives, chunk registration and
//! placement feedback.

use super::chunk::ChunkRef;
use super::{Opcode, expect_header};
use crate::core::PixelcastError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// `[0xB0]`, sent by clients that have been quiet for too long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ping;

impl Ping {
    pub fn dehydrate() -> Bytes {
        Bytes::from_static(&[Opcode::Ping as u8])
    }
}

/// `[0xA6]`, tells a client that its session data changed and it should reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangedMe;

impl ChangedMe {
    pub fn dehydrate() -> Bytes {
        Bytes::from_static(&[Opcode::ChangedMe as u8])
    }
}

/// `[0xA0][canvasId]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterCanvas {
    pub canvas_id: u8,
}

impl RegisterCanvas {
    pub fn dehydrate(canvas_id: u8) -> Bytes {
        Bytes::copy_from_slice(&[Opcode::RegisterCanvas.as_byte(), canvas_id])
    }

    pub fn hydrate(data: &[u8]) -> Result<Self, PixelcastError> {
        expect_header(data, Opcode::RegisterCanvas, 2)?;
        Ok(Self { canvas_id: data[1] })
    }
}

fn single_chunk(opcode: Opcode, chunk: ChunkRef) -> Bytes {
    let mut buf = BytesMut::with_capacity(3);
    buf.put_u8(opcode.as_byte());
    buf.put_u16(chunk.key());
    buf.freeze()
}

fn read_single_chunk(data: &[u8], opcode: Opcode) -> Result<ChunkRef, PixelcastError> {
    expect_header(data, opcode, 3)?;
    Ok(ChunkRef::from_key(u16::from_be_bytes([data[1], data[2]])))
}

/// `[0xA1][chunkId:u16]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterChunk {
    pub chunk: ChunkRef,
}

impl RegisterChunk {
    pub fn dehydrate(chunk: ChunkRef) -> Bytes {
        single_chunk(Opcode::RegisterChunk, chunk)
    }

    pub fn hydrate(data: &[u8]) -> Result<Self, PixelcastError> {
        read_single_chunk(data, Opcode::RegisterChunk).map(|chunk| Self { chunk })
    }
}

/// `[0xA2][chunkId:u16]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeRegisterChunk {
    pub chunk: ChunkRef,
}

impl DeRegisterChunk {
    pub fn dehydrate(chunk: ChunkRef) -> Bytes {
        single_chunk(Opcode::DeRegisterChunk, chunk)
    }

    pub fn hydrate(data: &[u8]) -> Result<Self, PixelcastError> {
        read_single_chunk(data, Opcode::DeRegisterChunk).map(|chunk| Self { chunk })
    }
}

/// Body shared by the bulk (de)registration packets: `[op][0x00]` followed by
/// chunk ids as little-endian u16. The padding byte keeps the ids 2-byte aligned.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChunkList {
    pub chunks: Vec<ChunkRef>,
}

impl ChunkList {
    const HEADER_LEN: usize = 2;

    fn dehydrate(opcode: Opcode, chunks: &[ChunkRef]) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::HEADER_LEN + chunks.len() * 2);
        buf.put_u8(opcode.as_byte());
        buf.put_u8(0);
        for chunk in chunks {
            buf.put_u16_le(chunk.key());
        }
        buf.freeze()
    }

    fn hydrate(data: &[u8], opcode: Opcode) -> Result<Self, PixelcastError> {
        expect_header(data, opcode, Self::HEADER_LEN)?;
        let mut body = &data[Self::HEADER_LEN..];
        let mut chunks = Vec::with_capacity(body.len() / 2);
        while body.remaining() >= 2 {
            chunks.push(ChunkRef::from_key(body.get_u16_le()));
        }
        Ok(Self { chunks })
    }
}

/// `[0xA3][0x00]` + `chunkId:u16 LE`*
pub struct RegisterMultipleChunks;

impl RegisterMultipleChunks {
    pub fn dehydrate(chunks: &[ChunkRef]) -> Bytes {
        ChunkList::dehydrate(Opcode::RegisterMultipleChunks, chunks)
    }

    pub fn hydrate(data: &[u8]) -> Result<ChunkList, PixelcastError> {
        ChunkList::hydrate(data, Opcode::RegisterMultipleChunks)
    }
}

/// `[0xA4][0x00]` + `chunkId:u16 LE`*
pub struct DeRegisterMultipleChunks;

impl DeRegisterMultipleChunks {
    pub fn dehydrate(chunks: &[ChunkRef]) -> Bytes {
        ChunkList::dehydrate(Opcode::DeRegisterMultipleChunks, chunks)
    }

    pub fn hydrate(data: &[u8]) -> Result<ChunkList, PixelcastError> {
        ChunkList::hydrate(data, Opcode::DeRegisterMultipleChunks)
    }
}

/// `[0xC2][wait:u32]`: remaining cooldown in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoolDown {
    pub wait_ms: u32,
}

impl CoolDown {
    pub fn dehydrate(wait_ms: u32) -> Bytes {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(Opcode::CoolDown.as_byte());
        buf.put_u32(wait_ms);
        buf.freeze()
    }

    pub fn hydrate(data: &[u8]) -> Result<Self, PixelcastError> {
        expect_header(data, Opcode::CoolDown, 5)?;
        let mut body = &data[1..];
        Ok(Self {
            wait_ms: body.get_u32(),
        })
    }
}

/// `[0xC3][retCode:u8][wait:u32][coolDownSeconds:i16][pxlCnt:u8]`: the answer to a
/// placement request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelReturn {
    pub ret_code: u8,
    pub wait_ms: u32,
    pub cool_down_secs: i16,
    pub pixel_count: u8,
}

impl PixelReturn {
    pub const LEN: usize = 9;

    pub fn dehydrate(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u8(Opcode::PixelReturn.as_byte());
        buf.put_u8(self.ret_code);
        buf.put_u32(self.wait_ms);
        buf.put_i16(self.cool_down_secs);
        buf.put_u8(self.pixel_count);
        buf.freeze()
    }

    pub fn hydrate(data: &[u8]) -> Result<Self, PixelcastError> {
        expect_header(data, Opcode::PixelReturn, Self::LEN)?;
        let mut body = &data[1..];
        Ok(Self {
            ret_code: body.get_u8(),
            wait_ms: body.get_u32(),
            cool_down_secs: body.get_i16(),
            pixel_count: body.get_u8(),
        })
    }
}
