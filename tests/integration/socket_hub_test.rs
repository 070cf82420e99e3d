// tests/integration/socket_hub_test.rs

//! The websocket hub served over a real listener, driven by raw websocket clients.

use super::test_helpers::{Recorder, init_tracing, wait_for};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use pixelcast::client::{ClientEvent, SocketClient};
use pixelcast::config::SocketsConfig;
use pixelcast::core::SharedBroker;
use pixelcast::core::broker::{EventBroker, LocalBroker};
use pixelcast::core::events::{BrokerEvent, ChatUser, EventKind};
use pixelcast::core::pixel_cache::PixelCache;
use pixelcast::core::protocol::text::{ChatLine, ServerText};
use pixelcast::core::protocol::{
    ChangedMe, ChunkRef, OnlineCounter, PixelRecord, PixelReturn, PixelUpdate, RegisterCanvas,
    RegisterChunk,
};
use pixelcast::server::SocketHub;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type TestSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

struct HubFixture {
    hub: Arc<SocketHub>,
    broker: Arc<LocalBroker>,
    cache: Arc<PixelCache>,
    url: String,
}

impl HubFixture {
    async fn start() -> Self {
        Self::with_config(SocketsConfig::default(), 100).await
    }

    async fn with_config(config: SocketsConfig, max_clients: usize) -> Self {
        init_tracing();
        let broker = Arc::new(LocalBroker::new("hub-test"));
        let shared: SharedBroker = broker.clone();
        let cache = Arc::new(PixelCache::new());
        let hub = SocketHub::new(shared, cache.clone(), config, max_clients);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = hub.router();
        tokio::spawn(async move {
            let _ = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await;
        });

        Self {
            hub,
            broker,
            cache,
            url: format!("ws://{addr}/ws"),
        }
    }

    async fn connect(&self) -> TestSocket {
        self.connect_with_query("").await
    }

    async fn connect_as(&self, user_id: u64, name: &str) -> TestSocket {
        self.connect_with_query(&format!("?user_id={user_id}&name={name}"))
            .await
    }

    async fn connect_with_query(&self, query: &str) -> TestSocket {
        let (ws, _) = connect_async(format!("{}{}", self.url, query))
            .await
            .expect("Failed to connect to the hub");
        ws
    }

    /// Connects and subscribes to one chunk, waiting until the hub has indexed it.
    async fn subscriber(&self, canvas_id: u8, chunk: ChunkRef) -> TestSocket {
        let mut ws = self.connect().await;
        let before = self.hub.chunk_subscriber_count(canvas_id, chunk);
        send_binary(&mut ws, RegisterCanvas::dehydrate(canvas_id)).await;
        send_binary(&mut ws, RegisterChunk::dehydrate(chunk)).await;
        wait_for("chunk registration", || {
            self.hub.chunk_subscriber_count(canvas_id, chunk) == before + 1
        })
        .await;
        ws
    }
}

async fn send_binary(ws: &mut TestSocket, data: Bytes) {
    ws.send(WsMessage::Binary(data)).await.unwrap();
}

async fn next_message(ws: &mut TestSocket) -> WsMessage {
    tokio::time::timeout(STEP_TIMEOUT, ws.next())
        .await
        .expect("Timed out waiting for a hub frame")
        .expect("Hub closed the socket")
        .expect("Websocket error")
}

async fn next_binary(ws: &mut TestSocket) -> Bytes {
    match next_message(ws).await {
        WsMessage::Binary(data) => data,
        other => panic!("Expected binary frame, got {other:?}"),
    }
}

async fn next_text(ws: &mut TestSocket) -> String {
    match next_message(ws).await {
        WsMessage::Text(text) => text.as_str().to_string(),
        other => panic!("Expected text frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_pixel_updates_reach_chunk_subscribers_only() {
    let fixture = HubFixture::start().await;
    let mut on_34 = fixture.subscriber(0, ChunkRef::new(3, 4)).await;
    let mut on_35 = fixture.subscriber(0, ChunkRef::new(3, 5)).await;

    fixture.cache.append(0, 5, 3, 4, 100);
    fixture.cache.flush(&*fixture.broker);
    fixture.cache.append(0, 6, 3, 5, 200);
    fixture.cache.flush(&*fixture.broker);

    let update = PixelUpdate::hydrate(&next_binary(&mut on_34).await).unwrap();
    assert_eq!(update.chunk, ChunkRef::new(3, 4));
    assert_eq!(update.pixels, vec![PixelRecord::new(100, 5)]);

    // The first frame on the other socket is its own chunk's update.
    let update = PixelUpdate::hydrate(&next_binary(&mut on_35).await).unwrap();
    assert_eq!(update.chunk, ChunkRef::new(3, 5));
    assert_eq!(update.pixels, vec![PixelRecord::new(200, 6)]);
}

#[tokio::test]
async fn test_canvas_change_drops_chunk_registrations() {
    let fixture = HubFixture::start().await;
    let chunk = ChunkRef::new(1, 1);
    let mut ws = fixture.subscriber(0, chunk).await;

    send_binary(&mut ws, RegisterCanvas::dehydrate(1)).await;
    wait_for("old registration to go", || {
        fixture.hub.chunk_subscriber_count(0, chunk) == 0
    })
    .await;
    assert_eq!(fixture.hub.chunk_subscriber_count(1, chunk), 0);
}

#[tokio::test]
async fn test_placed_pixels_go_to_the_cache() {
    let fixture = HubFixture::start().await;
    let flushed = Recorder::attach(&*fixture.broker, &[EventKind::PixelUpdate]);
    let mut ws = fixture.connect().await;

    send_binary(&mut ws, RegisterCanvas::dehydrate(1)).await;
    let request = PixelUpdate::new(
        ChunkRef::new(2, 2),
        vec![PixelRecord::new(7, 1), PixelRecord::new(8, 2)],
    );
    send_binary(&mut ws, request.dehydrate()).await;

    let reply = PixelReturn::hydrate(&next_binary(&mut ws).await).unwrap();
    assert_eq!(reply.ret_code, 0);
    assert_eq!(reply.pixel_count, 2);
    assert_eq!(fixture.cache.len(), 1);

    assert_eq!(fixture.cache.flush(&*fixture.broker), 1);
    match &flushed.events()[..] {
        [BrokerEvent::PixelUpdate {
            canvas_id, packet, ..
        }] => {
            assert_eq!(*canvas_id, 1);
            assert_eq!(PixelUpdate::hydrate(packet).unwrap(), request);
        }
        other => panic!("Expected one PixelUpdate, got {other:?}"),
    }
}

#[tokio::test]
async fn test_chat_needs_an_identified_user() {
    let fixture = HubFixture::start().await;
    let received = Recorder::attach(&*fixture.broker, &[EventKind::RecvChatMessage]);

    let mut anonymous = fixture.connect().await;
    anonymous
        .send(WsMessage::Text(r#"["hello",1]"#.into()))
        .await
        .unwrap();
    // A later frame on the same socket shows the chat was handled.
    send_binary(&mut anonymous, RegisterCanvas::dehydrate(0)).await;
    wait_for("anonymous canvas", || fixture.hub.online_counter().canvas(0) == 1).await;
    assert_eq!(received.len(), 0);

    let mut alice = fixture.connect_as(5, "alice").await;
    alice
        .send(WsMessage::Text(r#"["hi all",2]"#.into()))
        .await
        .unwrap();
    wait_for("chat from alice", || received.len() == 1).await;
    assert_eq!(
        received.events(),
        vec![BrokerEvent::RecvChatMessage {
            user: ChatUser {
                id: 5,
                name: "alice".into()
            },
            message: "hi all".into(),
            channel_id: 2,
        }]
    );
}

#[tokio::test]
async fn test_chat_events_are_routed_to_users() {
    let fixture = HubFixture::start().await;
    let mut alice = fixture.connect_as(5, "alice").await;
    let mut bob = fixture.connect_as(6, "bob").await;
    wait_for("both sockets", || fixture.hub.connection_count() == 2).await;

    fixture
        .broker
        .broadcast_su_chat_message(6, "mod".into(), "psst".into(), 1, 0, None);
    fixture.broker.broadcast_remove_chat_channel(5, 3);
    fixture.broker.broadcast_chat_message(
        "carol".into(),
        "hello".into(),
        1,
        7,
        Some("fr".into()),
        false,
    );

    let to_all = ServerText::Chat(ChatLine {
        name: "carol".into(),
        text: "hello".into(),
        country: "fr".into(),
        channel_id: 1,
        user_id: 7,
    })
    .to_frame()
    .unwrap();
    let whisper = ServerText::Chat(ChatLine {
        name: "mod".into(),
        text: "psst".into(),
        country: "xx".into(),
        channel_id: 1,
        user_id: 0,
    })
    .to_frame()
    .unwrap();

    assert_eq!(next_text(&mut bob).await, whisper);
    assert_eq!(next_text(&mut bob).await, to_all);

    assert_eq!(
        ServerText::parse(&next_text(&mut alice).await).unwrap(),
        Some(ServerText::Signal {
            name: "remch".into(),
            args: json!(3)
        })
    );
    assert_eq!(next_text(&mut alice).await, to_all);
}

#[tokio::test]
async fn test_reload_user_sends_changed_me() {
    let fixture = HubFixture::start().await;
    let mut alice = fixture.connect_as(5, "alice").await;
    let mut bob = fixture.connect_as(6, "bob").await;
    wait_for("both sockets", || fixture.hub.connection_count() == 2).await;

    fixture.broker.reload_user("alice".into());
    fixture
        .broker
        .broadcast_online_counter(OnlineCounter::new(2));

    assert_eq!(next_binary(&mut alice).await, ChangedMe::dehydrate());
    // Bob's first frame is the counter, so he never got the reload.
    let counter = OnlineCounter::hydrate(&next_binary(&mut bob).await).unwrap();
    assert_eq!(counter.total, 2);
}

#[tokio::test]
async fn test_online_counter_counts_unique_addresses() {
    let fixture = HubFixture::start().await;
    let _first = fixture.subscriber(0, ChunkRef::new(0, 0)).await;
    let _second = fixture.subscriber(2, ChunkRef::new(0, 0)).await;
    let _third = fixture.connect().await;
    wait_for("three sockets", || fixture.hub.connection_count() == 3).await;

    // Every test socket comes from 127.0.0.1.
    let counter = fixture.hub.online_counter();
    assert_eq!(counter.total, 1);
    assert_eq!(counter.canvas(0), 1);
    assert_eq!(counter.canvas(2), 1);
    assert_eq!(counter.canvas(1), 0);
}

#[tokio::test]
async fn test_disconnect_cleans_up_subscriptions() {
    let fixture = HubFixture::start().await;
    let chunk = ChunkRef::new(9, 9);
    let mut ws = fixture.subscriber(3, chunk).await;

    ws.close(None).await.unwrap();
    wait_for("session removal", || fixture.hub.connection_count() == 0).await;
    assert_eq!(fixture.hub.chunk_subscriber_count(3, chunk), 0);
}

#[tokio::test]
async fn test_max_clients_is_enforced() {
    let fixture = HubFixture::with_config(SocketsConfig::default(), 1).await;
    let _first = fixture.connect().await;
    wait_for("first socket", || fixture.hub.connection_count() == 1).await;

    assert!(connect_async(fixture.url.as_str()).await.is_err());
}

#[tokio::test]
async fn test_idle_sockets_are_kicked() {
    let config = SocketsConfig {
        idle_timeout: Duration::from_millis(50),
        ..SocketsConfig::default()
    };
    let fixture = HubFixture::with_config(config, 100).await;
    let mut ws = fixture.connect().await;
    wait_for("socket", || fixture.hub.connection_count() == 1).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fixture.hub.kick_idle(), 1);
    wait_for("kicked session", || fixture.hub.connection_count() == 0).await;

    let closed = tokio::time::timeout(STEP_TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(STEP_TIMEOUT, events.recv())
        .await
        .expect("Timed out waiting for a client event")
        .expect("Client event channel closed")
}

#[tokio::test]
async fn test_socket_client_against_the_hub() {
    let fixture = HubFixture::start().await;
    let (client, task, mut events) = SocketClient::new(fixture.url.clone());
    client.set_canvas(0);
    client.register_chunk(3, 4);
    let (shutdown_tx, _) = broadcast::channel(1);
    tokio::spawn(task.run(shutdown_tx.subscribe()));

    wait_for("client registration", || {
        fixture.hub.chunk_subscriber_count(0, ChunkRef::new(3, 4)) == 1
    })
    .await;
    assert_eq!(next_event(&mut events).await, ClientEvent::Open);

    client.request_place_pixels(3, 4, vec![PixelRecord::new(42, 9)]);
    match next_event(&mut events).await {
        ClientEvent::PixelReturn(reply) => assert_eq!(reply.pixel_count, 1),
        other => panic!("Expected PixelReturn, got {other:?}"),
    }

    fixture.cache.flush(&*fixture.broker);
    match next_event(&mut events).await {
        ClientEvent::PixelUpdate(update) => {
            assert_eq!(update.chunk, ChunkRef::new(3, 4));
            assert_eq!(update.pixels, vec![PixelRecord::new(42, 9)]);
        }
        other => panic!("Expected PixelUpdate, got {other:?}"),
    }
    let _ = shutdown_tx.send(());
}
