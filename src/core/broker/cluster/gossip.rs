// src/core/broker/cluster/gossip.rs

//! Text frames exchanged on the shared broadcast topic.
//!
//! A frame is either a bare shard id (an announce, which doubles as the heartbeat)
//! or `<shardId>:<eventKind>,<jsonArgs>` relaying one broker event.

use crate::core::PixelcastError;
use bytes::Bytes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipFrame {
    Announce(String),
    Relay {
        shard: String,
        kind: String,
        args: String,
    },
}

/// Shard ids are non-empty and free of ':', ',' and whitespace, the same rule the
/// config applies to `shard_name`.
fn is_shard_id(id: &str) -> bool {
    !id.is_empty() && !id.chars().any(|c| c == ':' || c == ',' || c.is_whitespace())
}

impl GossipFrame {
    pub fn shard(&self) -> &str {
        match self {
            GossipFrame::Announce(shard) => shard,
            GossipFrame::Relay { shard, .. } => shard,
        }
    }

    pub fn parse(payload: &[u8]) -> Result<Self, PixelcastError> {
        let text = std::str::from_utf8(payload)?;
        let Some((shard, rest)) = text.split_once(':') else {
            if !is_shard_id(text) {
                return Err(PixelcastError::MalformedPacket(format!(
                    "invalid shard id in announce: '{text}'"
                )));
            }
            return Ok(GossipFrame::Announce(text.to_string()));
        };
        let (kind, args) = rest.split_once(',').ok_or_else(|| {
            PixelcastError::MalformedPacket(format!("gossip relay without arguments: '{text}'"))
        })?;
        if !is_shard_id(shard) || kind.is_empty() {
            return Err(PixelcastError::MalformedPacket(format!(
                "gossip relay without shard or kind: '{text}'"
            )));
        }
        Ok(GossipFrame::Relay {
            shard: shard.to_string(),
            kind: kind.to_string(),
            args: args.to_string(),
        })
    }

    pub fn format(&self) -> Bytes {
        match self {
            GossipFrame::Announce(shard) => Bytes::from(shard.clone()),
            GossipFrame::Relay { shard, kind, args } => {
                Bytes::from(format!("{shard}:{kind},{args}"))
            }
        }
    }
}
