// src/core/protocol/resp_frame.rs

//! RESP (REdis Serialization Protocol) frames and their `tokio_util` codec, used by
//! the RESP pub/sub bus to talk to any Redis-compatible server.

use crate::core::PixelcastError;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const CRLF: &[u8] = b"\r\n";
const CRLF_LEN: usize = 2;

// Protocol-level limits so a misbehaving server cannot exhaust memory.
const MAX_FRAME_ELEMENTS: usize = 1_024 * 1_024;
const MAX_BULK_STRING_SIZE: usize = 512 * 1024 * 1024;
const MAX_RECURSION_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum RespFrame {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Bytes),
    Null,
    NullArray,
    Array(Vec<RespFrame>),
}

impl RespFrame {
    /// Builds a command array such as `PUBLISH topic payload`.
    pub fn command<I, B>(parts: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        RespFrame::Array(
            parts
                .into_iter()
                .map(|p| RespFrame::BulkString(p.into()))
                .collect(),
        )
    }

    /// Interprets a frame pushed on a subscribed connection.
    pub fn as_push(&self) -> Option<PushMessage> {
        let RespFrame::Array(parts) = self else {
            return None;
        };
        let kind = match parts.first()? {
            RespFrame::BulkString(b) => b.as_ref(),
            RespFrame::SimpleString(s) => s.as_bytes(),
            _ => return None,
        };
        match (kind, parts.get(1), parts.get(2)) {
            (b"message", Some(RespFrame::BulkString(topic)), Some(RespFrame::BulkString(payload))) => {
                Some(PushMessage::Message {
                    topic: topic.clone(),
                    payload: payload.clone(),
                })
            }
            (b"subscribe", Some(RespFrame::BulkString(topic)), _) => {
                Some(PushMessage::Subscribed(topic.clone()))
            }
            (b"unsubscribe", Some(RespFrame::BulkString(topic)), _) => {
                Some(PushMessage::Unsubscribed(topic.clone()))
            }
            (b"pong", _, _) => Some(PushMessage::Pong),
            _ => None,
        }
    }
}

/// Out-of-band frames received in subscriber mode.
#[derive(Debug, Clone, PartialEq)]
pub enum PushMessage {
    Message { topic: Bytes, payload: Bytes },
    Subscribed(Bytes),
    Unsubscribed(Bytes),
    Pong,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RespFrameCodec;

impl Encoder<RespFrame> for RespFrameCodec {
    type Error = PixelcastError;

    fn encode(&mut self, item: RespFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            RespFrame::SimpleString(s) => {
                dst.extend_from_slice(b"+");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Error(s) => {
                dst.extend_from_slice(b"-");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Integer(i) => {
                dst.extend_from_slice(b":");
                dst.extend_from_slice(i.to_string().as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::BulkString(b) => {
                dst.extend_from_slice(b"$");
                dst.extend_from_slice(b.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                dst.extend_from_slice(&b);
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Null => dst.extend_from_slice(b"$-1\r\n"),
            RespFrame::NullArray => dst.extend_from_slice(b"*-1\r\n"),
            RespFrame::Array(arr) => {
                dst.extend_from_slice(b"*");
                dst.extend_from_slice(arr.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                for frame in arr {
                    self.encode(frame, dst)?;
                }
            }
        }
        Ok(())
    }
}

impl Decoder for RespFrameCodec {
    type Item = RespFrame;
    type Error = PixelcastError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut bytes = &src[..];
        match decode_recursive(&mut bytes, 0) {
            Ok(frame) => {
                let len = src.len() - bytes.len();
                src.advance(len);
                Ok(Some(frame))
            }
            // Not enough bytes buffered yet; wait for the next read.
            Err(PixelcastError::IncompleteData) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn decode_recursive(bytes: &mut &[u8], depth: usize) -> Result<RespFrame, PixelcastError> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(PixelcastError::Protocol(
            "RESP recursion depth limit exceeded".to_string(),
        ));
    }
    let Some(&prefix) = bytes.first() else {
        return Err(PixelcastError::IncompleteData);
    };
    *bytes = &bytes[1..];

    match prefix {
        b'+' => Ok(RespFrame::SimpleString(line_string(bytes)?)),
        b'-' => Ok(RespFrame::Error(line_string(bytes)?)),
        b':' => Ok(RespFrame::Integer(line_string(bytes)?.parse::<i64>()?)),
        b'$' => parse_bulk_string(bytes),
        b'*' => parse_array(bytes, depth),
        other => Err(PixelcastError::Protocol(format!(
            "unexpected RESP type byte 0x{other:02X}"
        ))),
    }
}

fn parse_line<'a>(bytes: &mut &'a [u8]) -> Result<&'a [u8], PixelcastError> {
    let pos = find_crlf(bytes).ok_or(PixelcastError::IncompleteData)?;
    let line = &bytes[..pos];
    *bytes = &bytes[pos + CRLF_LEN..];
    Ok(line)
}

fn line_string(bytes: &mut &[u8]) -> Result<String, PixelcastError> {
    Ok(String::from_utf8_lossy(parse_line(bytes)?).to_string())
}

fn parse_bulk_string(bytes: &mut &[u8]) -> Result<RespFrame, PixelcastError> {
    let len = line_string(bytes)?.parse::<i64>()?;
    if len == -1 {
        return Ok(RespFrame::Null);
    }
    let len = usize::try_from(len)
        .ok()
        .filter(|&l| l <= MAX_BULK_STRING_SIZE)
        .ok_or_else(|| PixelcastError::Protocol(format!("invalid bulk length {len}")))?;

    if bytes.len() < len + CRLF_LEN {
        return Err(PixelcastError::IncompleteData);
    }
    if &bytes[len..len + CRLF_LEN] != CRLF {
        return Err(PixelcastError::Protocol(
            "bulk string not terminated by CRLF".to_string(),
        ));
    }
    let data = Bytes::copy_from_slice(&bytes[..len]);
    *bytes = &bytes[len + CRLF_LEN..];
    Ok(RespFrame::BulkString(data))
}

fn parse_array(bytes: &mut &[u8], depth: usize) -> Result<RespFrame, PixelcastError> {
    let len = line_string(bytes)?.parse::<i64>()?;
    if len == -1 {
        return Ok(RespFrame::NullArray);
    }
    let len = usize::try_from(len)
        .ok()
        .filter(|&l| l <= MAX_FRAME_ELEMENTS)
        .ok_or_else(|| PixelcastError::Protocol(format!("invalid array length {len}")))?;

    let mut frames = Vec::with_capacity(len.min(64));
    for _ in 0..len {
        frames.push(decode_recursive(bytes, depth + 1)?);
    }
    Ok(RespFrame::Array(frames))
}

fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(CRLF_LEN).position(|window| window == CRLF)
}
