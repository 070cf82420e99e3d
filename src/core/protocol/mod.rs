// src/core/protocol/mod.rs

//! Wire formats: the one-byte-opcode binary packets exchanged with clients and
//! between shards, the JSON text frames used for chat and signals, and the RESP
//! codec used to talk to an external pub/sub server.

pub mod chunk;
pub mod control;
pub mod online;
pub mod pixel;
pub mod resp_frame;
pub mod text;

pub use chunk::{ChunkRef, ChunkUpdate};
pub use control::{
    ChangedMe, ChunkList, CoolDown, DeRegisterChunk, DeRegisterMultipleChunks, Ping, PixelReturn,
    RegisterCanvas, RegisterChunk, RegisterMultipleChunks,
};
pub use online::OnlineCounter;
pub use pixel::{PixelRecord, PixelUpdate, ShardPixelUpdate};
pub use resp_frame::{RespFrame, RespFrameCodec};

use crate::core::PixelcastError;

/// The first byte of every binary frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    RegisterCanvas = 0xA0,
    RegisterChunk = 0xA1,
    DeRegisterChunk = 0xA2,
    RegisterMultipleChunks = 0xA3,
    DeRegisterMultipleChunks = 0xA4,
    ChangedMe = 0xA6,
    OnlineCounter = 0xA7,
    Ping = 0xB0,
    PixelUpdate = 0xC1,
    CoolDown = 0xC2,
    PixelReturn = 0xC3,
    ChunkUpdate = 0xC4,
}

impl Opcode {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Reads the opcode of a frame without consuming it.
    pub fn peek(data: &[u8]) -> Result<Self, PixelcastError> {
        let first = *data.first().ok_or(PixelcastError::IncompleteData)?;
        Self::try_from(first)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = PixelcastError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0xA0 => Opcode::RegisterCanvas,
            0xA1 => Opcode::RegisterChunk,
            0xA2 => Opcode::DeRegisterChunk,
            0xA3 => Opcode::RegisterMultipleChunks,
            0xA4 => Opcode::DeRegisterMultipleChunks,
            0xA6 => Opcode::ChangedMe,
            0xA7 => Opcode::OnlineCounter,
            0xB0 => Opcode::Ping,
            0xC1 => Opcode::PixelUpdate,
            0xC2 => Opcode::CoolDown,
            0xC3 => Opcode::PixelReturn,
            0xC4 => Opcode::ChunkUpdate,
            other => return Err(PixelcastError::UnknownOpcode(other)),
        })
    }
}

/// Checks that `data` starts with `expected` and is at least `min_len` bytes long.
pub(crate) fn expect_header(
    data: &[u8],
    expected: Opcode,
    min_len: usize,
) -> Result<(), PixelcastError> {
    let opcode = Opcode::peek(data)?;
    if opcode != expected {
        return Err(PixelcastError::MalformedPacket(format!(
            "expected opcode {expected:?}, got {opcode:?}"
        )));
    }
    if data.len() < min_len {
        return Err(PixelcastError::IncompleteData);
    }
    Ok(())
}
