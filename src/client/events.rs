// src/client/events.rs

use crate::core::protocol::text::ChatLine;
use crate::core::protocol::{CoolDown, OnlineCounter, PixelReturn, PixelUpdate};
use serde_json::Value;

/// What a [`SocketClient`](super::SocketClient) reports to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Open,
    Close,
    PixelUpdate(PixelUpdate),
    PixelReturn(PixelReturn),
    OnlineCounter(OnlineCounter),
    CoolDown(CoolDown),
    /// The server asks the client to reload its user; a reconnect follows.
    ChangedMe,
    ChatMessage(ChatLine),
    /// A `[signal, args]` text frame such as `addch` or `remch`.
    Signal { name: String, args: Value },
}
