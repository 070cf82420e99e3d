// src/core/events.rs

//! The closed set of broker events and their JSON relay encoding.
//!
//! Every event has a fixed argument tuple. When relayed between shards the tuple
//! is serialized as a JSON array, so `chunkUpdate` for canvas 0 and chunk (3, 4)
//! travels as `[0,[3,4]]`.

use crate::core::PixelcastError;
use crate::core::protocol::ChunkRef;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use strum_macros::{AsRefStr, Display, EnumCount, EnumIter, EnumString};

pub const DEFAULT_COUNTRY: &str = "xx";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString, EnumIter, EnumCount,
)]
#[strum(serialize_all = "camelCase")]
pub enum EventKind {
    PixelUpdate,
    ChunkUpdate,
    ChatMessage,
    SingleUserChatMessage,
    AddChatChannel,
    RemoveChatChannel,
    ReloadUser,
    OnlineCounter,
    Mail,
    /// A chat message received on this shard's own sockets that still needs
    /// server-side processing. Never leaves the shard.
    RecvChatMessage,
}

impl EventKind {
    /// Whether the cluster broker mirrors this kind to other shards.
    pub fn is_relayed(self) -> bool {
        !matches!(self, EventKind::RecvChatMessage)
    }
}

/// The author of a chat message received on a local socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatUser {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    PixelUpdate {
        canvas_id: u8,
        chunk_key: u16,
        packet: Bytes,
    },
    ChunkUpdate {
        canvas_id: u8,
        chunk: ChunkRef,
    },
    ChatMessage {
        name: String,
        message: String,
        channel_id: u32,
        user_id: u64,
        country: String,
        send_api: bool,
    },
    SingleUserChatMessage {
        target_user_id: u64,
        name: String,
        message: String,
        channel_id: u32,
        user_id: u64,
        country: String,
    },
    AddChatChannel {
        user_id: u64,
        channel_id: u32,
        channel: Value,
    },
    RemoveChatChannel {
        user_id: u64,
        channel_id: u32,
    },
    ReloadUser {
        name: String,
    },
    OnlineCounter {
        packet: Bytes,
    },
    Mail {
        args: Vec<Value>,
    },
    RecvChatMessage {
        user: ChatUser,
        message: String,
        channel_id: u32,
    },
}

impl BrokerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            BrokerEvent::PixelUpdate { .. } => EventKind::PixelUpdate,
            BrokerEvent::ChunkUpdate { .. } => EventKind::ChunkUpdate,
            BrokerEvent::ChatMessage { .. } => EventKind::ChatMessage,
            BrokerEvent::SingleUserChatMessage { .. } => EventKind::SingleUserChatMessage,
            BrokerEvent::AddChatChannel { .. } => EventKind::AddChatChannel,
            BrokerEvent::RemoveChatChannel { .. } => EventKind::RemoveChatChannel,
            BrokerEvent::ReloadUser { .. } => EventKind::ReloadUser,
            BrokerEvent::OnlineCounter { .. } => EventKind::OnlineCounter,
            BrokerEvent::Mail { .. } => EventKind::Mail,
            BrokerEvent::RecvChatMessage { .. } => EventKind::RecvChatMessage,
        }
    }

    /// Serializes the argument tuple as a JSON array.
    pub fn to_json_args(&self) -> Result<String, PixelcastError> {
        let json = match self {
            BrokerEvent::PixelUpdate {
                canvas_id,
                chunk_key,
                packet,
            } => serde_json::to_string(&(canvas_id, chunk_key, packet))?,
            BrokerEvent::ChunkUpdate { canvas_id, chunk } => {
                serde_json::to_string(&(canvas_id, chunk))?
            }
            BrokerEvent::ChatMessage {
                name,
                message,
                channel_id,
                user_id,
                country,
                send_api,
            } => serde_json::to_string(&(name, message, channel_id, user_id, country, send_api))?,
            BrokerEvent::SingleUserChatMessage {
                target_user_id,
                name,
                message,
                channel_id,
                user_id,
                country,
            } => serde_json::to_string(&(
                target_user_id,
                name,
                message,
                channel_id,
                user_id,
                country,
            ))?,
            BrokerEvent::AddChatChannel {
                user_id,
                channel_id,
                channel,
            } => serde_json::to_string(&(user_id, channel_id, channel))?,
            BrokerEvent::RemoveChatChannel {
                user_id,
                channel_id,
            } => serde_json::to_string(&(user_id, channel_id))?,
            BrokerEvent::ReloadUser { name } => serde_json::to_string(&(name,))?,
            BrokerEvent::OnlineCounter { packet } => serde_json::to_string(&(packet,))?,
            BrokerEvent::Mail { args } => serde_json::to_string(args)?,
            BrokerEvent::RecvChatMessage {
                user,
                message,
                channel_id,
            } => serde_json::to_string(&(user, message, channel_id))?,
        };
        Ok(json)
    }

    /// Rebuilds an event from its relay name and JSON argument array.
    pub fn from_json_args(kind: &str, args: &str) -> Result<Self, PixelcastError> {
        let kind =
            EventKind::from_str(kind).map_err(|_| PixelcastError::UnknownEvent(kind.to_string()))?;
        let event = match kind {
            EventKind::PixelUpdate => {
                let (canvas_id, chunk_key, packet): (u8, u16, Bytes) = serde_json::from_str(args)?;
                BrokerEvent::PixelUpdate {
                    canvas_id,
                    chunk_key,
                    packet,
                }
            }
            EventKind::ChunkUpdate => {
                let (canvas_id, chunk): (u8, ChunkRef) = serde_json::from_str(args)?;
                BrokerEvent::ChunkUpdate { canvas_id, chunk }
            }
            EventKind::ChatMessage => {
                let (name, message, channel_id, user_id, country, send_api): (
                    String,
                    String,
                    u32,
                    u64,
                    String,
                    bool,
                ) = serde_json::from_str(args)?;
                BrokerEvent::ChatMessage {
                    name,
                    message,
                    channel_id,
                    user_id,
                    country,
                    send_api,
                }
            }
            EventKind::SingleUserChatMessage => {
                let (target_user_id, name, message, channel_id, user_id, country): (
                    u64,
                    String,
                    String,
                    u32,
                    u64,
                    String,
                ) = serde_json::from_str(args)?;
                BrokerEvent::SingleUserChatMessage {
                    target_user_id,
                    name,
                    message,
                    channel_id,
                    user_id,
                    country,
                }
            }
            EventKind::AddChatChannel => {
                let (user_id, channel_id, channel): (u64, u32, Value) = serde_json::from_str(args)?;
                BrokerEvent::AddChatChannel {
                    user_id,
                    channel_id,
                    channel,
                }
            }
            EventKind::RemoveChatChannel => {
                let (user_id, channel_id): (u64, u32) = serde_json::from_str(args)?;
                BrokerEvent::RemoveChatChannel {
                    user_id,
                    channel_id,
                }
            }
            EventKind::ReloadUser => {
                let (name,): (String,) = serde_json::from_str(args)?;
                BrokerEvent::ReloadUser { name }
            }
            EventKind::OnlineCounter => {
                let (packet,): (Bytes,) = serde_json::from_str(args)?;
                BrokerEvent::OnlineCounter { packet }
            }
            EventKind::Mail => BrokerEvent::Mail {
                args: serde_json::from_str(args)?,
            },
            EventKind::RecvChatMessage => {
                let (user, message, channel_id): (ChatUser, String, u32) =
                    serde_json::from_str(args)?;
                BrokerEvent::RecvChatMessage {
                    user,
                    message,
                    channel_id,
                }
            }
        };
        Ok(event)
    }
}
