// src/client/state.rs

//! The client connection state machine.
//!
//! The machine does no I/O. The socket driver reports transport events with the
//! current time and writes out the frames the machine hands back, which keeps
//! every timing rule testable with a synthetic clock.

use crate::core::protocol::{
    ChunkRef, DeRegisterChunk, Ping, RegisterCanvas, RegisterChunk, RegisterMultipleChunks,
};
use bytes::Bytes;
use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// How often the driver should call [`ConnectionMachine::check_health`].
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(2);
/// A server silent for longer than this is assumed dead.
pub const SERVER_SILENCE_TIMEOUT: Duration = Duration::from_secs(30);
/// A keep-alive is sent when nothing was sent for longer than this.
pub const KEEPALIVE_AFTER: Duration = Duration::from_secs(23);
/// Sessions that lasted at least this long reconnect quickly.
pub const LONG_SESSION: Duration = Duration::from_secs(7);
pub const FAST_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const SLOW_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Binary(Bytes),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    /// The server went silent; the socket must be closed.
    ForceClose,
    /// Send a [`Ping`] to keep the connection from idling out.
    SendPing,
}

#[derive(Debug)]
pub struct ConnectionMachine {
    state: ReadyState,
    canvas_id: u8,
    /// Chunks of the current canvas the client is interested in.
    chunks: BTreeSet<ChunkRef>,
    queue: VecDeque<OutboundFrame>,
    last_connecting: Option<Instant>,
    last_server_frame: Instant,
    last_sent: Instant,
}

impl ConnectionMachine {
    pub fn new(now: Instant) -> Self {
        Self {
            state: ReadyState::Closed,
            canvas_id: 0,
            chunks: BTreeSet::new(),
            queue: VecDeque::new(),
            last_connecting: None,
            last_server_frame: now,
            last_sent: now,
        }
    }

    pub fn state(&self) -> ReadyState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ReadyState::Open
    }

    pub fn canvas_id(&self) -> u8 {
        self.canvas_id
    }

    pub fn chunks(&self) -> Vec<ChunkRef> {
        self.chunks.iter().copied().collect()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// A connect attempt starts.
    pub fn connect(&mut self, now: Instant) {
        self.state = ReadyState::Connecting;
        self.last_connecting = Some(now);
    }

    /// The socket opened. Returns the frames to write, in order: the canvas
    /// registration, the chunk registrations, then everything queued while closed.
    pub fn on_open(&mut self, now: Instant) -> Vec<OutboundFrame> {
        self.state = ReadyState::Open;
        self.last_server_frame = now;
        self.last_sent = now;

        let mut frames = Vec::with_capacity(2 + self.queue.len());
        frames.push(OutboundFrame::Binary(RegisterCanvas::dehydrate(self.canvas_id)));
        if !self.chunks.is_empty() {
            info!("Register {} chunks", self.chunks.len());
            let chunks = self.chunks();
            frames.push(OutboundFrame::Binary(RegisterMultipleChunks::dehydrate(
                &chunks,
            )));
        }
        frames.extend(self.queue.drain(..));
        frames
    }

    /// The socket closed or failed to open. Returns how long to wait before the
    /// next attempt.
    pub fn on_close(&mut self, now: Instant) -> Duration {
        self.state = ReadyState::Connecting;
        let long_session = self
            .last_connecting
            .is_none_or(|started| now.saturating_duration_since(started) >= LONG_SESSION);
        if long_session {
            FAST_RECONNECT_DELAY
        } else {
            SLOW_RECONNECT_DELAY
        }
    }

    /// Starts an explicit reconnect. Only an open connection can be restarted;
    /// the caller drops the socket and connects again right away.
    pub fn begin_reconnect(&mut self) -> bool {
        if self.state != ReadyState::Open {
            return false;
        }
        debug!("Restarting websocket");
        self.state = ReadyState::Closing;
        true
    }

    /// Any frame from the server counts as a heartbeat.
    pub fn on_server_frame(&mut self, now: Instant) {
        self.last_server_frame = now;
    }

    pub fn check_health(&mut self, now: Instant) -> Option<HealthAction> {
        if self.state != ReadyState::Open {
            return None;
        }
        if now.saturating_duration_since(self.last_server_frame) > SERVER_SILENCE_TIMEOUT {
            info!("Server is silent, killing websocket");
            self.state = ReadyState::Closing;
            return Some(HealthAction::ForceClose);
        }
        if now.saturating_duration_since(self.last_sent) > KEEPALIVE_AFTER {
            self.last_sent = now;
            return Some(HealthAction::SendPing);
        }
        None
    }

    /// The keep-alive frame for [`HealthAction::SendPing`].
    pub fn ping_frame() -> OutboundFrame {
        OutboundFrame::Binary(Ping::dehydrate())
    }

    /// Passes `frame` through if the connection is open; drops it otherwise.
    pub fn send(&mut self, frame: OutboundFrame, now: Instant) -> Option<OutboundFrame> {
        if !self.is_open() {
            return None;
        }
        self.last_sent = now;
        Some(frame)
    }

    /// Like [`send`](Self::send), but queues the frame while the connection is not
    /// open. Only for frames that are still meaningful after a reconnect.
    pub fn send_when_ready(&mut self, frame: OutboundFrame, now: Instant) -> Option<OutboundFrame> {
        if self.is_open() {
            self.last_sent = now;
            return Some(frame);
        }
        debug!("Queueing frame while websocket is not open");
        self.queue.push_back(frame);
        None
    }

    /// Switches canvas. The chunk interest set belongs to the old canvas and is cleared.
    pub fn set_canvas(&mut self, canvas_id: u8, now: Instant) -> Option<OutboundFrame> {
        if canvas_id == self.canvas_id {
            return None;
        }
        self.canvas_id = canvas_id;
        self.chunks.clear();
        self.send(
            OutboundFrame::Binary(RegisterCanvas::dehydrate(canvas_id)),
            now,
        )
    }

    pub fn register_chunk(&mut self, chunk: ChunkRef, now: Instant) -> Option<OutboundFrame> {
        self.chunks.insert(chunk);
        self.send(OutboundFrame::Binary(RegisterChunk::dehydrate(chunk)), now)
    }

    pub fn deregister_chunk(&mut self, chunk: ChunkRef, now: Instant) -> Option<OutboundFrame> {
        self.chunks.remove(&chunk);
        self.send(OutboundFrame::Binary(DeRegisterChunk::dehydrate(chunk)), now)
    }
}
