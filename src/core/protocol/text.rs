// src/core/protocol/text.rs

//! JSON text frames that share the websocket with the binary packets.
//!
//! Server to client:
//! - chat line: `[name, text, country, channelId, userId]`
//! - signal: `[signal, args]`, e.g. `["addch", {...}]`, `["remch", 3]`, `["cs", 0]`
//!
//! Client to server:
//! - chat: `[message, channelId]`
//! - captcha solution: `["cs", [solution, captchaId]]`

use crate::core::PixelcastError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SIGNAL_ADD_CHANNEL: &str = "addch";
pub const SIGNAL_REMOVE_CHANNEL: &str = "remch";
pub const SIGNAL_CAPTCHA: &str = "cs";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatLine {
    pub name: String,
    pub text: String,
    pub country: String,
    pub channel_id: u32,
    pub user_id: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerText {
    Chat(ChatLine),
    Signal { name: String, args: Value },
}

impl ServerText {
    pub fn to_frame(&self) -> Result<String, PixelcastError> {
        let frame = match self {
            ServerText::Chat(line) => serde_json::to_string(&(
                &line.name,
                &line.text,
                &line.country,
                line.channel_id,
                line.user_id,
            ))?,
            ServerText::Signal { name, args } => serde_json::to_string(&(name, args))?,
        };
        Ok(frame)
    }

    /// Returns `Ok(None)` for well-formed JSON that is not a known frame shape.
    pub fn parse(frame: &str) -> Result<Option<Self>, PixelcastError> {
        if frame.is_empty() {
            return Ok(None);
        }
        let Value::Array(mut parts) = serde_json::from_str::<Value>(frame)? else {
            return Ok(None);
        };
        match parts.len() {
            5 => {
                let (name, text, country, channel_id, user_id): (String, String, String, Value, u64) =
                    serde_json::from_value(Value::Array(parts))?;
                Ok(Some(ServerText::Chat(ChatLine {
                    name,
                    text,
                    country,
                    channel_id: loose_u32(&channel_id)?,
                    user_id,
                })))
            }
            2 => {
                let args = parts.pop().unwrap_or(Value::Null);
                let Some(Value::String(name)) = parts.pop() else {
                    return Ok(None);
                };
                Ok(Some(ServerText::Signal { name, args }))
            }
            _ => Ok(None),
        }
    }
}

/// Channel ids arrive as numbers or numeric strings.
fn loose_u32(value: &Value) -> Result<u32, PixelcastError> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| PixelcastError::MalformedPacket(format!("invalid channel id {n}"))),
        Value::String(s) => Ok(s.parse::<u32>()?),
        other => Err(PixelcastError::MalformedPacket(format!(
            "invalid channel id {other}"
        ))),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientText {
    Chat { message: String, channel_id: u32 },
    CaptchaSolution { solution: String, captcha_id: String },
}

impl ClientText {
    pub fn to_frame(&self) -> Result<String, PixelcastError> {
        let frame = match self {
            ClientText::Chat {
                message,
                channel_id,
            } => serde_json::to_string(&(message, channel_id))?,
            ClientText::CaptchaSolution {
                solution,
                captcha_id,
            } => serde_json::to_string(&(SIGNAL_CAPTCHA, (solution, captcha_id)))?,
        };
        Ok(frame)
    }

    pub fn parse(frame: &str) -> Result<Self, PixelcastError> {
        let (head, tail): (String, Value) = serde_json::from_str(frame)?;
        match tail {
            Value::Array(_) if head == SIGNAL_CAPTCHA => {
                let (solution, captcha_id): (String, String) = serde_json::from_value(tail)?;
                Ok(ClientText::CaptchaSolution {
                    solution,
                    captcha_id,
                })
            }
            channel => Ok(ClientText::Chat {
                message: head,
                channel_id: loose_u32(&channel)?,
            }),
        }
    }
}
