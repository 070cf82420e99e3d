// src/client/socket.rs

//! The websocket driver behind [`SocketClient`].
//!
//! [`SocketClientTask`] owns the socket and the [`ConnectionMachine`]. The cloneable
//! [`SocketClient`] handle only sends commands to it, and everything the server
//! says comes back as [`ClientEvent`]s on an unbounded channel.

use super::events::ClientEvent;
use super::requests::{PendingRequests, REQUEST_TIMEOUT, RequestResult};
use super::state::{ConnectionMachine, HEALTH_CHECK_INTERVAL, HealthAction, OutboundFrame};
use crate::core::PixelcastError;
use crate::core::protocol::text::{ClientText, SIGNAL_CAPTCHA, ServerText};
use crate::core::protocol::{
    ChunkRef, CoolDown, OnlineCounter, Opcode, PixelRecord, PixelReturn, PixelUpdate,
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Pending request kind of a captcha submission.
const CAPTCHA_REQUEST: &str = "captcha";
/// A handshake that has not completed by then counts as a failed attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeouts of a [`SocketClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSettings {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
        }
    }
}

enum ClientCommand {
    SetCanvas(u8),
    RegisterChunk(ChunkRef),
    DeRegisterChunk(ChunkRef),
    PlacePixels(PixelUpdate),
    SendChat {
        message: String,
        channel_id: u32,
    },
    Reconnect,
    SolveCaptcha {
        solution: String,
        captcha_id: String,
        reply: oneshot::Sender<RequestResult>,
    },
}

/// What the driver has to do after a command or an inbound frame.
enum Step {
    Idle,
    Write(OutboundFrame),
    Reconnect,
}

/// How a connect attempt ended.
enum Connect {
    Open(Box<ClientSocket>),
    Failed(PixelcastError),
    Shutdown,
}

/// How a connected session ended.
enum SessionEnd {
    Closed,
    Reconnect,
    Shutdown,
}

/// A handle to a reconnecting websocket connection.
#[derive(Clone)]
pub struct SocketClient {
    commands: mpsc::UnboundedSender<ClientCommand>,
}

impl SocketClient {
    /// Creates the handle, the task that must be spawned to drive the connection,
    /// and the receiver for everything the server sends.
    pub fn new(
        url: impl Into<String>,
    ) -> (Self, SocketClientTask, mpsc::UnboundedReceiver<ClientEvent>) {
        Self::with_settings(url, ClientSettings::default())
    }

    pub fn with_settings(
        url: impl Into<String>,
        settings: ClientSettings,
    ) -> (Self, SocketClientTask, mpsc::UnboundedReceiver<ClientEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let task = SocketClientTask {
            url: url.into(),
            connect_timeout: settings.connect_timeout,
            machine: ConnectionMachine::new(Instant::now()),
            pending: PendingRequests::new(settings.request_timeout),
            commands: command_rx,
            events: event_tx,
        };
        (
            Self {
                commands: command_tx,
            },
            task,
            event_rx,
        )
    }

    fn command(&self, command: ClientCommand) {
        if self.commands.send(command).is_err() {
            debug!("Socket client task is gone; dropping command");
        }
    }

    pub fn set_canvas(&self, canvas_id: u8) {
        self.command(ClientCommand::SetCanvas(canvas_id));
    }

    pub fn register_chunk(&self, i: u8, j: u8) {
        self.command(ClientCommand::RegisterChunk(ChunkRef::new(i, j)));
    }

    pub fn deregister_chunk(&self, i: u8, j: u8) {
        self.command(ClientCommand::DeRegisterChunk(ChunkRef::new(i, j)));
    }

    /// Asks the server to place pixels. Sent as soon as the connection is open.
    pub fn request_place_pixels(&self, i: u8, j: u8, pixels: Vec<PixelRecord>) {
        self.command(ClientCommand::PlacePixels(PixelUpdate::new(
            ChunkRef::new(i, j),
            pixels,
        )));
    }

    pub fn send_chat_message(&self, message: impl Into<String>, channel_id: u32) {
        self.command(ClientCommand::SendChat {
            message: message.into(),
            channel_id,
        });
    }

    /// Drops the current connection and connects again right away.
    pub fn reconnect(&self) {
        self.command(ClientCommand::Reconnect);
    }

    /// Submits a captcha solution and waits for the server's verdict.
    ///
    /// Fails with [`PixelcastError::ConnectionClosed`] if the socket is not open and
    /// with [`PixelcastError::RequestTimeout`] if no answer arrives in time.
    pub async fn solve_captcha(
        &self,
        solution: impl Into<String>,
        captcha_id: impl Into<String>,
    ) -> Result<Value, PixelcastError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ClientCommand::SolveCaptcha {
                solution: solution.into(),
                captcha_id: captcha_id.into(),
                reply,
            })
            .map_err(|_| PixelcastError::ConnectionClosed)?;
        rx.await.map_err(|_| PixelcastError::ConnectionClosed)?
    }
}

pub struct SocketClientTask {
    url: String,
    connect_timeout: Duration,
    machine: ConnectionMachine,
    pending: PendingRequests,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl SocketClientTask {
    /// Connects and keeps reconnecting until shutdown or until every
    /// [`SocketClient`] handle is dropped.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Socket client connecting to {}", self.url);
        loop {
            match self.open(&mut shutdown_rx).await {
                Connect::Open(ws) => match self.session(*ws, &mut shutdown_rx).await {
                    SessionEnd::Shutdown => {
                        info!("Socket client shutting down.");
                        return;
                    }
                    SessionEnd::Reconnect => {
                        self.emit(ClientEvent::Close);
                        continue;
                    }
                    SessionEnd::Closed => {}
                },
                Connect::Failed(e) => warn!("Websocket connect to {} failed: {}", self.url, e),
                Connect::Shutdown => {
                    info!("Socket client shutting down.");
                    return;
                }
            }

            self.emit(ClientEvent::Close);
            let delay = self.machine.on_close(Instant::now());
            info!("Websocket closed, reconnecting in {:?}", delay);
            if !self.wait_before_reconnect(delay, &mut shutdown_rx).await {
                info!("Socket client shutting down.");
                return;
            }
        }
    }

    /// One connect attempt, bounded by the connect timeout. Commands keep being
    /// served meanwhile and pending requests still expire.
    async fn open(&mut self, shutdown_rx: &mut broadcast::Receiver<()>) -> Connect {
        self.machine.connect(Instant::now());
        let url = self.url.clone();
        let connect = time::timeout(self.connect_timeout, connect_async(url));
        tokio::pin!(connect);

        let mut health = time::interval(HEALTH_CHECK_INTERVAL);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        health.tick().await;

        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok(Ok((ws, _))) => Connect::Open(Box::new(ws)),
                        Ok(Err(e)) => Connect::Failed(e.into()),
                        Err(_) => Connect::Failed(PixelcastError::WebSocket(format!(
                            "handshake did not complete within {:?}",
                            self.connect_timeout
                        ))),
                    };
                }
                _ = shutdown_rx.recv() => return Connect::Shutdown,
                command = self.commands.recv() => match command {
                    // Nothing can be written before the socket opens.
                    Some(command) => {
                        let _ = self.apply_command(command, Instant::now());
                    }
                    None => return Connect::Shutdown,
                },
                _ = health.tick() => {
                    let expired = self.pending.expire(Instant::now());
                    if expired > 0 {
                        debug!("{} pending requests timed out", expired);
                    }
                }
            }
        }
    }

    async fn session(
        &mut self,
        mut ws: ClientSocket,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> SessionEnd {
        debug!("Websocket open");
        let opening = self.machine.on_open(Instant::now());
        self.emit(ClientEvent::Open);
        for frame in opening {
            if let Err(e) = write_frame(&mut ws, frame).await {
                warn!("Failed to write to websocket: {}", e);
                return SessionEnd::Closed;
            }
        }

        let mut health = time::interval(HEALTH_CHECK_INTERVAL);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        health.tick().await;

        loop {
            let step = tokio::select! {
                _ = shutdown_rx.recv() => {
                    let _ = ws.close(None).await;
                    return SessionEnd::Shutdown;
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        let _ = ws.close(None).await;
                        return SessionEnd::Shutdown;
                    };
                    self.apply_command(command, Instant::now())
                }
                _ = health.tick() => {
                    let now = Instant::now();
                    let expired = self.pending.expire(now);
                    if expired > 0 {
                        debug!("{} pending requests timed out", expired);
                    }
                    match self.machine.check_health(now) {
                        Some(HealthAction::ForceClose) => {
                            let _ = ws.close(None).await;
                            return SessionEnd::Closed;
                        }
                        Some(HealthAction::SendPing) => Step::Write(ConnectionMachine::ping_frame()),
                        None => Step::Idle,
                    }
                }
                message = ws.next() => match message {
                    Some(Ok(message)) => match self.handle_message(message, Instant::now()) {
                        Some(step) => step,
                        None => return SessionEnd::Closed,
                    },
                    Some(Err(e)) => {
                        warn!("Websocket error: {}", e);
                        return SessionEnd::Closed;
                    }
                    None => return SessionEnd::Closed,
                },
            };

            match step {
                Step::Idle => {}
                Step::Write(frame) => {
                    if let Err(e) = write_frame(&mut ws, frame).await {
                        warn!("Failed to write to websocket: {}", e);
                        return SessionEnd::Closed;
                    }
                }
                Step::Reconnect => {
                    let _ = ws.close(None).await;
                    return SessionEnd::Reconnect;
                }
            }
        }
    }

    /// Sleeps out the reconnect delay while still accepting commands, so the
    /// subscription set stays current. Returns `false` on shutdown.
    async fn wait_before_reconnect(
        &mut self,
        delay: Duration,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> bool {
        let sleep = time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                _ = shutdown_rx.recv() => return false,
                command = self.commands.recv() => match command {
                    // Nothing can be written while closed.
                    Some(command) => {
                        let _ = self.apply_command(command, Instant::now());
                    }
                    None => return false,
                },
            }
        }
        self.pending.expire(Instant::now());
        true
    }

    fn apply_command(&mut self, command: ClientCommand, now: Instant) -> Step {
        let frame = match command {
            ClientCommand::SetCanvas(canvas_id) => self.machine.set_canvas(canvas_id, now),
            ClientCommand::RegisterChunk(chunk) => self.machine.register_chunk(chunk, now),
            ClientCommand::DeRegisterChunk(chunk) => self.machine.deregister_chunk(chunk, now),
            ClientCommand::PlacePixels(update) => self
                .machine
                .send_when_ready(OutboundFrame::Binary(update.dehydrate()), now),
            ClientCommand::SendChat {
                message,
                channel_id,
            } => match (ClientText::Chat {
                message,
                channel_id,
            })
            .to_frame()
            {
                Ok(text) => self.machine.send_when_ready(OutboundFrame::Text(text), now),
                Err(e) => {
                    warn!("Failed to encode chat message: {}", e);
                    None
                }
            },
            ClientCommand::Reconnect => {
                return if self.machine.begin_reconnect() {
                    Step::Reconnect
                } else {
                    Step::Idle
                };
            }
            ClientCommand::SolveCaptcha {
                solution,
                captcha_id,
                reply,
            } => {
                let text = match (ClientText::CaptchaSolution {
                    solution,
                    captcha_id,
                })
                .to_frame()
                {
                    Ok(text) => text,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return Step::Idle;
                    }
                };
                match self.machine.send(OutboundFrame::Text(text), now) {
                    Some(frame) => {
                        self.pending.insert(CAPTCHA_REQUEST, reply, now);
                        Some(frame)
                    }
                    None => {
                        let _ = reply.send(Err(PixelcastError::ConnectionClosed));
                        None
                    }
                }
            }
        };
        frame.map_or(Step::Idle, Step::Write)
    }

    /// Returns `None` when the server closed the connection.
    fn handle_message(&mut self, message: WsMessage, now: Instant) -> Option<Step> {
        match message {
            WsMessage::Binary(data) => {
                self.machine.on_server_frame(now);
                Some(self.handle_binary(&data))
            }
            WsMessage::Text(text) => {
                self.handle_text(text.as_str());
                Some(Step::Idle)
            }
            WsMessage::Close(frame) => {
                debug!("Server closed the websocket: {:?}", frame);
                None
            }
            _ => Some(Step::Idle),
        }
    }

    fn handle_binary(&mut self, data: &[u8]) -> Step {
        let event = match Opcode::peek(data) {
            Ok(Opcode::PixelUpdate) => PixelUpdate::hydrate(data).map(ClientEvent::PixelUpdate),
            Ok(Opcode::PixelReturn) => PixelReturn::hydrate(data).map(ClientEvent::PixelReturn),
            Ok(Opcode::OnlineCounter) => {
                OnlineCounter::hydrate(data).map(ClientEvent::OnlineCounter)
            }
            Ok(Opcode::CoolDown) => CoolDown::hydrate(data).map(ClientEvent::CoolDown),
            Ok(Opcode::ChangedMe) => {
                self.emit(ClientEvent::ChangedMe);
                return if self.machine.begin_reconnect() {
                    Step::Reconnect
                } else {
                    Step::Idle
                };
            }
            Ok(other) => {
                debug!("Ignoring unexpected opcode {:?} from server", other);
                return Step::Idle;
            }
            Err(e) => Err(e),
        };
        match event {
            Ok(event) => self.emit(event),
            Err(e) => warn!("Dropping undecodable server frame: {}", e),
        }
        Step::Idle
    }

    fn handle_text(&mut self, text: &str) {
        match ServerText::parse(text) {
            Ok(Some(ServerText::Chat(line))) => self.emit(ClientEvent::ChatMessage(line)),
            Ok(Some(ServerText::Signal { name, args })) => {
                if name == SIGNAL_CAPTCHA && !self.pending.resolve(CAPTCHA_REQUEST, args.clone()) {
                    debug!("Captcha answer without a pending request");
                }
                self.emit(ClientEvent::Signal { name, args });
            }
            Ok(None) => debug!("Ignoring unknown text frame"),
            Err(e) => warn!("Dropping undecodable text frame: {}", e),
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

async fn write_frame(ws: &mut ClientSocket, frame: OutboundFrame) -> Result<(), PixelcastError> {
    let message = match frame {
        OutboundFrame::Binary(data) => WsMessage::Binary(data),
        OutboundFrame::Text(text) => WsMessage::Text(text.into()),
    };
    ws.send(message).await?;
    Ok(())
}
