// src/core/bus/resp.rs

//! A pub/sub bus backed by any Redis-compatible server, spoken to over RESP.
//!
//! Publishing uses a dedicated request/response connection that is reopened
//! lazily after a failure. Subscriptions live on a second connection owned by
//! [`RespSubscriberTask`], which reconnects with exponential backoff and replays
//! every subscribed topic after reconnecting.

use super::{BusInbox, BusMessage, PubSubBus};
use crate::core::PixelcastError;
use crate::core::protocol::resp_frame::PushMessage;
use crate::core::protocol::{RespFrame, RespFrameCodec};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::time::{self, Instant};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

type RespConnection = Framed<TcpStream, RespFrameCodec>;

#[derive(Debug, Clone)]
pub struct RespBusSettings {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub connect_timeout: Duration,
    pub reply_timeout: Duration,
}

impl RespBusSettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: None,
            connect_timeout: Duration::from_secs(2),
            reply_timeout: Duration::from_secs(2),
        }
    }
}

enum SubscriberCommand {
    Subscribe(String),
    Unsubscribe(String),
}

pub struct RespBus {
    settings: Arc<RespBusSettings>,
    publisher: Mutex<Option<RespConnection>>,
    control_tx: mpsc::UnboundedSender<SubscriberCommand>,
}

impl RespBus {
    /// Creates the bus handle, the subscriber task that must be spawned for
    /// subscriptions to work, and the inbox it feeds.
    pub fn new(settings: RespBusSettings) -> (Self, RespSubscriberTask, BusInbox) {
        let settings = Arc::new(settings);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let bus = Self {
            settings: settings.clone(),
            publisher: Mutex::new(None),
            control_tx,
        };
        let task = RespSubscriberTask {
            settings,
            control_rx,
            inbox_tx,
            topics: BTreeSet::new(),
        };
        (bus, task, inbox_rx)
    }

    async fn publish_on(
        &self,
        conn: &mut RespConnection,
        topic: &str,
        payload: Bytes,
    ) -> Result<(), PixelcastError> {
        let frame = RespFrame::command([
            Bytes::from_static(b"PUBLISH"),
            Bytes::copy_from_slice(topic.as_bytes()),
            payload,
        ]);
        conn.send(frame).await?;
        match read_reply(conn, self.settings.reply_timeout).await? {
            RespFrame::Integer(_) => Ok(()),
            RespFrame::Error(e) => Err(PixelcastError::Bus(format!("PUBLISH rejected: {e}"))),
            other => Err(PixelcastError::Bus(format!(
                "unexpected PUBLISH reply: {other:?}"
            ))),
        }
    }
}

#[async_trait]
impl PubSubBus for RespBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PixelcastError> {
        let mut guard = self.publisher.lock().await;
        if guard.is_none() {
            *guard = Some(open_connection(&self.settings).await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(PixelcastError::ConnectionClosed);
        };
        let result = self.publish_on(conn, topic, payload).await;
        if result.is_err() {
            // Reopen on the next publish.
            *guard = None;
        }
        result
    }

    async fn subscribe(&self, topic: &str) -> Result<(), PixelcastError> {
        self.control_tx
            .send(SubscriberCommand::Subscribe(topic.to_string()))
            .map_err(|_| PixelcastError::Bus("subscriber task is not running".into()))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), PixelcastError> {
        self.control_tx
            .send(SubscriberCommand::Unsubscribe(topic.to_string()))
            .map_err(|_| PixelcastError::Bus("subscriber task is not running".into()))
    }
}

async fn open_connection(settings: &RespBusSettings) -> Result<RespConnection, PixelcastError> {
    let addr = (settings.host.as_str(), settings.port);
    let stream = time::timeout(settings.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| PixelcastError::Bus(format!("connect to {}:{} timed out", settings.host, settings.port)))??;
    stream.set_nodelay(true)?;
    let mut conn = Framed::new(stream, RespFrameCodec);

    if let Some(password) = &settings.password {
        conn.send(RespFrame::command([
            Bytes::from_static(b"AUTH"),
            Bytes::copy_from_slice(password.as_bytes()),
        ]))
        .await?;
        match read_reply(&mut conn, settings.reply_timeout).await? {
            RespFrame::SimpleString(_) => {}
            other => {
                return Err(PixelcastError::Bus(format!("AUTH failed: {other:?}")));
            }
        }
    }
    Ok(conn)
}

async fn read_reply(conn: &mut RespConnection, timeout: Duration) -> Result<RespFrame, PixelcastError> {
    match time::timeout(timeout, conn.next()).await {
        Ok(Some(frame)) => frame,
        Ok(None) => Err(PixelcastError::ConnectionClosed),
        Err(_) => Err(PixelcastError::Bus("timed out waiting for reply".into())),
    }
}

enum PumpExit {
    Shutdown,
    Lost(PixelcastError),
}

/// Owns the subscriber connection.
pub struct RespSubscriberTask {
    settings: Arc<RespBusSettings>,
    control_rx: mpsc::UnboundedReceiver<SubscriberCommand>,
    inbox_tx: mpsc::UnboundedSender<BusMessage>,
    topics: BTreeSet<String>,
}

impl RespSubscriberTask {
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "RESP bus subscriber started for {}:{}.",
            self.settings.host, self.settings.port
        );
        let mut reconnect_delay = INITIAL_RECONNECT_DELAY;

        loop {
            match open_connection(&self.settings).await {
                Ok(mut conn) => {
                    reconnect_delay = INITIAL_RECONNECT_DELAY;
                    info!(
                        "RESP bus subscriber connected, restoring {} subscriptions.",
                        self.topics.len()
                    );
                    let exit = match self.resubscribe(&mut conn).await {
                        Ok(()) => self.pump(&mut conn, &mut shutdown_rx).await,
                        Err(e) => PumpExit::Lost(e),
                    };
                    match exit {
                        PumpExit::Shutdown => break,
                        PumpExit::Lost(e) => {
                            warn!("RESP bus subscriber connection lost: {}. Reconnecting...", e);
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "RESP bus subscriber failed to connect: {}. Retrying in {:?}...",
                        e, reconnect_delay
                    );
                }
            }

            if !self.wait_before_reconnect(reconnect_delay, &mut shutdown_rx).await {
                break;
            }
            reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
        }
        info!("RESP bus subscriber shutting down.");
    }

    /// Sleeps for `delay` while still tracking topic changes. Returns `false` on shutdown.
    async fn wait_before_reconnect(
        &mut self,
        delay: Duration,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = time::sleep_until(deadline) => return true,
                _ = shutdown_rx.recv() => return false,
                cmd = self.control_rx.recv() => match cmd {
                    Some(cmd) => { self.apply(cmd); }
                    None => return false,
                },
            }
        }
    }

    /// Updates the topic set. Returns the command to send, if the set changed.
    fn apply(&mut self, cmd: SubscriberCommand) -> Option<RespFrame> {
        match cmd {
            SubscriberCommand::Subscribe(topic) => self.topics.insert(topic.clone()).then(|| {
                RespFrame::command([Bytes::from_static(b"SUBSCRIBE"), Bytes::from(topic)])
            }),
            SubscriberCommand::Unsubscribe(topic) => self.topics.remove(&topic).then(|| {
                RespFrame::command([Bytes::from_static(b"UNSUBSCRIBE"), Bytes::from(topic)])
            }),
        }
    }

    async fn resubscribe(&self, conn: &mut RespConnection) -> Result<(), PixelcastError> {
        if self.topics.is_empty() {
            return Ok(());
        }
        let mut parts = vec![Bytes::from_static(b"SUBSCRIBE")];
        parts.extend(self.topics.iter().map(|t| Bytes::from(t.clone())));
        conn.send(RespFrame::command(parts)).await
    }

    async fn pump(
        &mut self,
        conn: &mut RespConnection,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> PumpExit {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => return PumpExit::Shutdown,
                cmd = self.control_rx.recv() => {
                    let Some(cmd) = cmd else { return PumpExit::Shutdown };
                    if let Some(frame) = self.apply(cmd) {
                        if let Err(e) = conn.send(frame).await {
                            return PumpExit::Lost(e);
                        }
                    }
                }
                frame = conn.next() => match frame {
                    Some(Ok(frame)) => match frame.as_push() {
                        Some(PushMessage::Message { topic, payload }) => {
                            let message = BusMessage {
                                topic: String::from_utf8_lossy(&topic).into_owned(),
                                payload,
                            };
                            if self.inbox_tx.send(message).is_err() {
                                return PumpExit::Shutdown;
                            }
                        }
                        Some(PushMessage::Subscribed(topic)) => {
                            debug!("RESP bus subscribed to '{}'.", String::from_utf8_lossy(&topic));
                        }
                        Some(PushMessage::Unsubscribed(_)) | Some(PushMessage::Pong) => {}
                        None => debug!("Ignoring unexpected frame on subscriber connection: {:?}", frame),
                    },
                    Some(Err(e)) => return PumpExit::Lost(e),
                    None => return PumpExit::Lost(PixelcastError::ConnectionClosed),
                },
            }
        }
    }
}
