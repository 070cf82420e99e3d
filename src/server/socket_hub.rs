// src/server/socket_hub.rs

//! The websocket endpoint that pixel clients connect to.
//!
//! The hub keeps one session per socket with the canvas and chunks it registered,
//! and an index from chunk to subscribed sessions. Broker events are routed to the
//! matching sessions; pixel writes from clients go into the pixel cache.

use crate::config::SocketsConfig;
use crate::core::PixelcastError;
use crate::core::broker::SharedBroker;
use crate::core::events::{BrokerEvent, ChatUser, EventKind};
use crate::core::metrics;
use crate::core::pixel_cache::PixelCache;
use crate::core::protocol::chunk::cache_key;
use crate::core::protocol::pixel::MAX_OFFSET;
use crate::core::protocol::text::{
    ChatLine, ClientText, SIGNAL_ADD_CHANNEL, SIGNAL_REMOVE_CHANNEL, ServerText,
};
use crate::core::protocol::{
    ChangedMe, ChunkRef, DeRegisterChunk, DeRegisterMultipleChunks, OnlineCounter, Opcode,
    PixelReturn, PixelUpdate, RegisterCanvas, RegisterChunk, RegisterMultipleChunks,
};
use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{Notify, broadcast, mpsc};
use tracing::{debug, info, warn};

/// Outbound frames buffered per socket before new ones are dropped.
const OUTBOUND_CAPACITY: usize = 256;

/// Identity passed by the upstream auth layer as query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub user_id: Option<u64>,
    pub name: Option<String>,
}

struct Session {
    tx: mpsc::Sender<Message>,
    kick: Arc<Notify>,
    ip: IpAddr,
    user: Option<ChatUser>,
    canvas: Option<u8>,
    /// Cache keys of the registered chunks.
    chunks: HashSet<u32>,
    last_activity: Instant,
}

pub struct SocketHub {
    broker: SharedBroker,
    pixel_cache: Arc<PixelCache>,
    config: SocketsConfig,
    max_clients: usize,
    sessions: DashMap<u64, Session>,
    chunk_subscribers: DashMap<u32, HashSet<u64>>,
    next_session_id: AtomicU64,
}

impl SocketHub {
    /// Creates the hub and subscribes it to the broker events it forwards to sockets.
    pub fn new(
        broker: SharedBroker,
        pixel_cache: Arc<PixelCache>,
        config: SocketsConfig,
        max_clients: usize,
    ) -> Arc<Self> {
        let hub = Arc::new(Self {
            broker,
            pixel_cache,
            config,
            max_clients,
            sessions: DashMap::new(),
            chunk_subscribers: DashMap::new(),
            next_session_id: AtomicU64::new(1),
        });
        hub.attach();
        hub
    }

    fn attach(self: &Arc<Self>) {
        let kinds = [
            EventKind::PixelUpdate,
            EventKind::OnlineCounter,
            EventKind::ChatMessage,
            EventKind::SingleUserChatMessage,
            EventKind::AddChatChannel,
            EventKind::RemoveChatChannel,
            EventKind::ReloadUser,
        ];
        for kind in kinds {
            let weak: Weak<SocketHub> = Arc::downgrade(self);
            self.broker.on(
                kind,
                Arc::new(move |event: &BrokerEvent| {
                    if let Some(hub) = weak.upgrade() {
                        hub.route(event);
                    }
                }),
            );
        }
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .with_state(self.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of sessions registered to the given chunk.
    pub fn chunk_subscriber_count(&self, canvas_id: u8, chunk: ChunkRef) -> usize {
        self.chunk_subscribers
            .get(&cache_key(canvas_id, chunk))
            .map_or(0, |ids| ids.len())
    }

    /// Sends a broker event to the sockets it concerns.
    fn route(&self, event: &BrokerEvent) {
        match event {
            BrokerEvent::PixelUpdate {
                canvas_id,
                chunk_key,
                packet,
            } => {
                let key = cache_key(*canvas_id, ChunkRef::from_key(*chunk_key));
                let ids: Vec<u64> = match self.chunk_subscribers.get(&key) {
                    Some(ids) => ids.iter().copied().collect(),
                    None => return,
                };
                for id in ids {
                    self.send_to(id, Message::Binary(packet.clone()));
                }
            }
            BrokerEvent::OnlineCounter { packet } => {
                self.send_to_all(|_| Some(Message::Binary(packet.clone())));
            }
            BrokerEvent::ChatMessage {
                name,
                message,
                channel_id,
                user_id,
                country,
                ..
            } => {
                let line = ChatLine {
                    name: name.clone(),
                    text: message.clone(),
                    country: country.clone(),
                    channel_id: *channel_id,
                    user_id: *user_id,
                };
                if let Some(frame) = text_frame(&ServerText::Chat(line)) {
                    self.send_to_all(|_| Some(frame.clone()));
                }
            }
            BrokerEvent::SingleUserChatMessage {
                target_user_id,
                name,
                message,
                channel_id,
                user_id,
                country,
            } => {
                let line = ChatLine {
                    name: name.clone(),
                    text: message.clone(),
                    country: country.clone(),
                    channel_id: *channel_id,
                    user_id: *user_id,
                };
                if let Some(frame) = text_frame(&ServerText::Chat(line)) {
                    self.send_to_user(*target_user_id, frame);
                }
            }
            BrokerEvent::AddChatChannel {
                user_id, channel, ..
            } => {
                let signal = ServerText::Signal {
                    name: SIGNAL_ADD_CHANNEL.to_string(),
                    args: channel.clone(),
                };
                if let Some(frame) = text_frame(&signal) {
                    self.send_to_user(*user_id, frame);
                }
            }
            BrokerEvent::RemoveChatChannel {
                user_id,
                channel_id,
            } => {
                let signal = ServerText::Signal {
                    name: SIGNAL_REMOVE_CHANNEL.to_string(),
                    args: json!(channel_id),
                };
                if let Some(frame) = text_frame(&signal) {
                    self.send_to_user(*user_id, frame);
                }
            }
            BrokerEvent::ReloadUser { name } => {
                let packet = ChangedMe::dehydrate();
                self.send_to_all(|session| {
                    session
                        .user
                        .as_ref()
                        .filter(|user| &user.name == name)
                        .map(|_| Message::Binary(packet.clone()))
                });
            }
            _ => {}
        }
    }

    fn send_to(&self, id: u64, message: Message) {
        if let Some(session) = self.sessions.get(&id) {
            push(id, &session, message);
        }
    }

    fn send_to_all(&self, mut build: impl FnMut(&Session) -> Option<Message>) {
        for entry in self.sessions.iter() {
            if let Some(message) = build(entry.value()) {
                push(*entry.key(), entry.value(), message);
            }
        }
    }

    fn send_to_user(&self, user_id: u64, message: Message) {
        self.send_to_all(|session| {
            session
                .user
                .as_ref()
                .filter(|user| user.id == user_id)
                .map(|_| message.clone())
        });
    }

    /// Unique client addresses, in total and per registered canvas.
    pub fn online_counter(&self) -> OnlineCounter {
        let mut total: HashSet<IpAddr> = HashSet::new();
        let mut per_canvas: BTreeMap<u8, HashSet<IpAddr>> = BTreeMap::new();
        for entry in self.sessions.iter() {
            let session = entry.value();
            total.insert(session.ip);
            if let Some(canvas_id) = session.canvas {
                per_canvas.entry(canvas_id).or_default().insert(session.ip);
            }
        }
        per_canvas.into_iter().fold(
            OnlineCounter::new(total.len() as u32),
            |counter, (canvas_id, ips)| counter.with_canvas(canvas_id, ips.len() as u32),
        )
    }

    /// Closes every socket that has been silent for longer than the idle timeout.
    pub fn kick_idle(&self) -> usize {
        let now = Instant::now();
        let mut kicked = 0;
        for entry in self.sessions.iter() {
            if now.duration_since(entry.last_activity) > self.config.idle_timeout {
                debug!("Closing idle socket {}.", entry.key());
                entry.kick.notify_one();
                kicked += 1;
            }
        }
        kicked
    }

    pub fn close_all(&self) {
        for entry in self.sessions.iter() {
            entry.kick.notify_one();
        }
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, addr: SocketAddr, params: ConnectParams) {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
        let kick = Arc::new(Notify::new());

        let user = params.user_id.map(|user_id| ChatUser {
            id: user_id,
            name: params.name.unwrap_or_default(),
        });
        self.sessions.insert(
            id,
            Session {
                tx,
                kick: kick.clone(),
                ip: addr.ip(),
                user,
                canvas: None,
                chunks: HashSet::new(),
                last_activity: Instant::now(),
            },
        );
        metrics::CONNECTED_SOCKETS.inc();
        debug!("Socket {} connected from {}.", id, addr);

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        loop {
            tokio::select! {
                frame = stream.next() => {
                    let message = match frame {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => {
                            debug!("Socket {} errored: {}", id, e);
                            break;
                        }
                        None => break,
                    };
                    if let Some(mut session) = self.sessions.get_mut(&id) {
                        session.last_activity = Instant::now();
                    }
                    let result = match message {
                        Message::Binary(data) => self.handle_binary(id, data),
                        Message::Text(text) => self.handle_text(id, text.as_str()),
                        Message::Close(_) => break,
                        Message::Ping(_) | Message::Pong(_) => Ok(()),
                    };
                    if let Err(e) = result {
                        warn!("Dropping bad frame from socket {}: {}", id, e);
                    }
                }
                _ = kick.notified() => break,
            }
        }

        self.remove_session(id);
        writer.abort();
        metrics::CONNECTED_SOCKETS.dec();
        debug!("Socket {} disconnected.", id);
    }

    fn remove_session(&self, id: u64) {
        if let Some((_, session)) = self.sessions.remove(&id) {
            for key in session.chunks {
                self.unindex(key, id);
            }
        }
    }

    fn index(&self, key: u32, id: u64) {
        self.chunk_subscribers.entry(key).or_default().insert(id);
    }

    fn unindex(&self, key: u32, id: u64) {
        self.chunk_subscribers.remove_if_mut(&key, |_, ids| {
            ids.remove(&id);
            ids.is_empty()
        });
    }

    fn handle_binary(&self, id: u64, data: Bytes) -> Result<(), PixelcastError> {
        match Opcode::peek(&data)? {
            Opcode::RegisterCanvas => {
                let canvas_id = RegisterCanvas::hydrate(&data)?.canvas_id;
                let previous = match self.sessions.get_mut(&id) {
                    Some(mut session) => {
                        session.canvas = Some(canvas_id);
                        std::mem::take(&mut session.chunks)
                    }
                    None => return Ok(()),
                };
                for key in previous {
                    self.unindex(key, id);
                }
            }
            Opcode::RegisterChunk => {
                let chunk = RegisterChunk::hydrate(&data)?.chunk;
                self.register_chunks(id, &[chunk])?;
            }
            Opcode::RegisterMultipleChunks => {
                let list = RegisterMultipleChunks::hydrate(&data)?;
                self.register_chunks(id, &list.chunks)?;
            }
            Opcode::DeRegisterChunk => {
                let chunk = DeRegisterChunk::hydrate(&data)?.chunk;
                self.deregister_chunks(id, &[chunk]);
            }
            Opcode::DeRegisterMultipleChunks => {
                let list = DeRegisterMultipleChunks::hydrate(&data)?;
                self.deregister_chunks(id, &list.chunks);
            }
            Opcode::Ping => {}
            Opcode::PixelUpdate => self.place_pixels(id, &data)?,
            other => {
                return Err(PixelcastError::MalformedPacket(format!(
                    "{other:?} is not accepted from clients"
                )));
            }
        }
        Ok(())
    }

    fn register_chunks(&self, id: u64, chunks: &[ChunkRef]) -> Result<(), PixelcastError> {
        let mut added = Vec::with_capacity(chunks.len());
        {
            let Some(mut session) = self.sessions.get_mut(&id) else {
                return Ok(());
            };
            let canvas_id = session.canvas.ok_or_else(|| {
                PixelcastError::InvalidState("chunk registered before canvas".into())
            })?;
            for chunk in chunks {
                if session.chunks.len() >= self.config.max_chunks_per_client {
                    warn!(
                        "Socket {} hit the limit of {} registered chunks.",
                        id, self.config.max_chunks_per_client
                    );
                    break;
                }
                let key = cache_key(canvas_id, *chunk);
                if session.chunks.insert(key) {
                    added.push(key);
                }
            }
        }
        for key in added {
            self.index(key, id);
        }
        Ok(())
    }

    fn deregister_chunks(&self, id: u64, chunks: &[ChunkRef]) {
        let mut removed = Vec::with_capacity(chunks.len());
        {
            let Some(mut session) = self.sessions.get_mut(&id) else {
                return;
            };
            let Some(canvas_id) = session.canvas else {
                return;
            };
            for chunk in chunks {
                let key = cache_key(canvas_id, *chunk);
                if session.chunks.remove(&key) {
                    removed.push(key);
                }
            }
        }
        for key in removed {
            self.unindex(key, id);
        }
    }

    fn place_pixels(&self, id: u64, data: &[u8]) -> Result<(), PixelcastError> {
        let request = PixelUpdate::hydrate_request(data)?;
        let canvas_id = self
            .sessions
            .get(&id)
            .and_then(|session| session.canvas)
            .ok_or_else(|| PixelcastError::InvalidState("pixels placed before canvas".into()))?;

        let ChunkRef { i, j } = request.chunk;
        let mut placed = 0usize;
        for pixel in request.pixels.iter().filter(|p| p.offset <= MAX_OFFSET) {
            self.pixel_cache.append(canvas_id, pixel.color, i, j, pixel.offset);
            placed += 1;
        }
        let reply = PixelReturn {
            ret_code: 0,
            wait_ms: 0,
            cool_down_secs: 0,
            pixel_count: placed.min(u8::MAX as usize) as u8,
        };
        self.send_to(id, Message::Binary(reply.dehydrate()));
        Ok(())
    }

    fn handle_text(&self, id: u64, text: &str) -> Result<(), PixelcastError> {
        match ClientText::parse(text)? {
            ClientText::Chat {
                message,
                channel_id,
            } => {
                let user = self.sessions.get(&id).and_then(|s| s.user.clone());
                match user {
                    Some(user) => self.broker.recv_chat_message(user, message, channel_id),
                    None => debug!("Ignoring chat from anonymous socket {}.", id),
                }
            }
            ClientText::CaptchaSolution { captcha_id, .. } => {
                debug!(
                    "Captcha solution {} from socket {} is left to the upstream service.",
                    captcha_id, id
                );
            }
        }
        Ok(())
    }
}

fn push(id: u64, session: &Session, message: Message) {
    if let Err(mpsc::error::TrySendError::Full(_)) = session.tx.try_send(message) {
        debug!("Outbound queue of socket {} is full; dropping frame.", id);
    }
}

fn text_frame(text: &ServerText) -> Option<Message> {
    match text.to_frame() {
        Ok(frame) => Some(Message::Text(frame.into())),
        Err(e) => {
            warn!("Could not encode text frame: {}", e);
            None
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<ConnectParams>,
    State(hub): State<Arc<SocketHub>>,
) -> Response {
    if hub.connection_count() >= hub.max_clients {
        warn!("Rejecting socket from {}: max_clients reached.", addr);
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.max_message_size(hub.config.max_payload)
        .on_upgrade(move |socket| hub.handle_socket(socket, addr, params))
}

/// Publishes the online counter and closes idle sockets on a fixed period.
pub struct SocketHubTask {
    hub: Arc<SocketHub>,
}

impl SocketHubTask {
    pub fn new(hub: Arc<SocketHub>) -> Self {
        Self { hub }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let period = self.hub.config.online_counter_interval;
        info!("Socket hub task started. Online counter every {:?}.", period);
        let mut interval = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.hub.kick_idle();
                    let counter = self.hub.online_counter();
                    self.hub.broker.broadcast_online_counter(counter);
                }
                _ = shutdown_rx.recv() => {
                    self.hub.close_all();
                    info!("Socket hub task shutting down.");
                    return;
                }
            }
        }
    }
}
