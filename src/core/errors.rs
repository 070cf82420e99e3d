// src/core/errors.rs

//! Defines the primary error type for the broadcast and coordination subsystem.

use std::num::ParseIntError;
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all failures that can cross a module boundary.
/// Decode errors are never fatal: callers log them and drop the offending frame.
#[derive(Error, Debug)]
pub enum PixelcastError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Unknown opcode 0x{0:02X}")]
    UnknownOpcode(u8),

    #[error("Unknown event kind '{0}'")]
    UnknownEvent(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Pub/Sub bus error: {0}")]
    Bus(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Request '{0}' timed out")]
    RequestTimeout(String),

    #[error("Request '{0}' was superseded by a newer request of the same kind")]
    Superseded(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Operation not allowed in the current state: {0}")]
    InvalidState(String),

    #[error("Internal Error: {0}")]
    Internal(String),
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
impl Clone for PixelcastError {
    fn clone(&self) -> Self {
        match self {
            PixelcastError::Io(e) => PixelcastError::Io(Arc::clone(e)),
            PixelcastError::IncompleteData => PixelcastError::IncompleteData,
            PixelcastError::MalformedPacket(s) => PixelcastError::MalformedPacket(s.clone()),
            PixelcastError::UnknownOpcode(op) => PixelcastError::UnknownOpcode(*op),
            PixelcastError::UnknownEvent(s) => PixelcastError::UnknownEvent(s.clone()),
            PixelcastError::Json(s) => PixelcastError::Json(s.clone()),
            PixelcastError::Bus(s) => PixelcastError::Bus(s.clone()),
            PixelcastError::Protocol(s) => PixelcastError::Protocol(s.clone()),
            PixelcastError::WebSocket(s) => PixelcastError::WebSocket(s.clone()),
            PixelcastError::RequestTimeout(s) => PixelcastError::RequestTimeout(s.clone()),
            PixelcastError::Superseded(s) => PixelcastError::Superseded(s.clone()),
            PixelcastError::ConnectionClosed => PixelcastError::ConnectionClosed,
            PixelcastError::InvalidState(s) => PixelcastError::InvalidState(s.clone()),
            PixelcastError::Internal(s) => PixelcastError::Internal(s.clone()),
        }
    }
}

impl PartialEq for PixelcastError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PixelcastError::Io(e1), PixelcastError::Io(e2)) => e1.to_string() == e2.to_string(),
            (PixelcastError::MalformedPacket(s1), PixelcastError::MalformedPacket(s2)) => s1 == s2,
            (PixelcastError::UnknownOpcode(o1), PixelcastError::UnknownOpcode(o2)) => o1 == o2,
            (PixelcastError::UnknownEvent(s1), PixelcastError::UnknownEvent(s2)) => s1 == s2,
            (PixelcastError::Json(s1), PixelcastError::Json(s2)) => s1 == s2,
            (PixelcastError::Bus(s1), PixelcastError::Bus(s2)) => s1 == s2,
            (PixelcastError::Protocol(s1), PixelcastError::Protocol(s2)) => s1 == s2,
            (PixelcastError::WebSocket(s1), PixelcastError::WebSocket(s2)) => s1 == s2,
            (PixelcastError::RequestTimeout(s1), PixelcastError::RequestTimeout(s2)) => s1 == s2,
            (PixelcastError::Superseded(s1), PixelcastError::Superseded(s2)) => s1 == s2,
            (PixelcastError::InvalidState(s1), PixelcastError::InvalidState(s2)) => s1 == s2,
            (PixelcastError::Internal(s1), PixelcastError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for PixelcastError {
    fn from(e: std::io::Error) -> Self {
        PixelcastError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for PixelcastError {
    fn from(e: serde_json::Error) -> Self {
        PixelcastError::Json(e.to_string())
    }
}

impl From<std::str::Utf8Error> for PixelcastError {
    fn from(e: std::str::Utf8Error) -> Self {
        PixelcastError::MalformedPacket(format!("invalid UTF-8: {e}"))
    }
}

impl From<std::string::FromUtf8Error> for PixelcastError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        PixelcastError::MalformedPacket(format!("invalid UTF-8: {e}"))
    }
}

impl From<ParseIntError> for PixelcastError {
    fn from(e: ParseIntError) -> Self {
        PixelcastError::Protocol(format!("invalid integer: {e}"))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for PixelcastError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        match e {
            tokio_tungstenite::tungstenite::Error::ConnectionClosed
            | tokio_tungstenite::tungstenite::Error::AlreadyClosed => {
                PixelcastError::ConnectionClosed
            }
            other => PixelcastError::WebSocket(other.to_string()),
        }
    }
}
