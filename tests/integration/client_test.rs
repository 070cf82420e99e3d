// tests/integration/client_test.rs

//! The reconnecting socket client against a scripted websocket server.

use super::test_helpers::init_tracing;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use pixelcast::client::{ClientEvent, ClientSettings, SocketClient};
use pixelcast::core::PixelcastError;
use pixelcast::core::protocol::text::{ChatLine, ServerText};
use pixelcast::core::protocol::{
    ChangedMe, ChunkRef, CoolDown, OnlineCounter, PixelRecord, PixelReturn, PixelUpdate,
    RegisterCanvas, RegisterChunk, RegisterMultipleChunks,
};
use serde_json::json;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;

type ServerSocket = WebSocketStream<TcpStream>;

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Accepts websocket connections and hands each one to the test.
async fn fake_server() -> (String, mpsc::UnboundedReceiver<ServerSocket>) {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                if tx.send(ws).is_err() {
                    return;
                }
            }
        }
    });
    (url, rx)
}

struct RunningClient {
    client: SocketClient,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    shutdown_tx: broadcast::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

/// Accepts TCP connections and holds them without ever answering the handshake.
async fn silent_server() -> (String, mpsc::UnboundedReceiver<TcpStream>) {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if tx.send(stream).is_err() {
                return;
            }
        }
    });
    (url, rx)
}

fn start_client(url: String, setup: impl FnOnce(&SocketClient)) -> RunningClient {
    start_client_with(url, ClientSettings::default(), setup)
}

fn start_client_with(
    url: String,
    settings: ClientSettings,
    setup: impl FnOnce(&SocketClient),
) -> RunningClient {
    let (client, task, events) = SocketClient::with_settings(url, settings);
    setup(&client);
    let (shutdown_tx, _) = broadcast::channel(1);
    let handle = tokio::spawn(task.run(shutdown_tx.subscribe()));
    RunningClient {
        client,
        events,
        shutdown_tx,
        handle,
    }
}

async fn next_conn(conns: &mut mpsc::UnboundedReceiver<ServerSocket>) -> ServerSocket {
    tokio::time::timeout(STEP_TIMEOUT, conns.recv())
        .await
        .expect("Timed out waiting for the client to connect")
        .expect("Fake server stopped")
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(STEP_TIMEOUT, events.recv())
        .await
        .expect("Timed out waiting for a client event")
        .expect("Client event channel closed")
}

async fn next_message(ws: &mut ServerSocket) -> WsMessage {
    tokio::time::timeout(STEP_TIMEOUT, ws.next())
        .await
        .expect("Timed out waiting for a client frame")
        .expect("Client disconnected")
        .expect("Websocket error")
}

async fn next_binary(ws: &mut ServerSocket) -> Bytes {
    match next_message(ws).await {
        WsMessage::Binary(data) => data,
        other => panic!("Expected binary frame, got {other:?}"),
    }
}

async fn next_text(ws: &mut ServerSocket) -> String {
    loop {
        match next_message(ws).await {
            WsMessage::Text(text) => return text.as_str().to_string(),
            WsMessage::Binary(_) => continue,
            other => panic!("Expected text frame, got {other:?}"),
        }
    }
}

/// Keeps reading an abandoned server socket so its close handshake completes.
fn drain(mut ws: ServerSocket) {
    tokio::spawn(async move { while let Some(Ok(_)) = ws.next().await {} });
}

#[tokio::test]
async fn test_open_sends_canvas_then_queued_commands() {
    let (url, mut conns) = fake_server().await;
    let mut running = start_client(url, |client| {
        client.set_canvas(2);
        client.register_chunk(1, 1);
        client.request_place_pixels(1, 1, vec![PixelRecord::new(5, 3)]);
    });

    let mut ws = next_conn(&mut conns).await;
    assert_eq!(next_event(&mut running.events).await, ClientEvent::Open);
    assert_eq!(next_binary(&mut ws).await, RegisterCanvas::dehydrate(0));
    assert_eq!(next_binary(&mut ws).await, RegisterCanvas::dehydrate(2));
    assert_eq!(
        next_binary(&mut ws).await,
        RegisterChunk::dehydrate(ChunkRef::new(1, 1))
    );
    let request = PixelUpdate::hydrate_request(&next_binary(&mut ws).await).unwrap();
    assert_eq!(request.chunk, ChunkRef::new(1, 1));
    assert_eq!(request.pixels, vec![PixelRecord::new(5, 3)]);
}

#[tokio::test]
async fn test_server_frames_become_events() {
    let (url, mut conns) = fake_server().await;
    let mut running = start_client(url, |_| {});
    let mut ws = next_conn(&mut conns).await;
    assert_eq!(next_event(&mut running.events).await, ClientEvent::Open);

    let update = PixelUpdate::new(ChunkRef::new(3, 4), vec![PixelRecord::new(10, 2)]);
    let counter = OnlineCounter::new(12).with_canvas(0, 12);
    let placed = PixelReturn {
        ret_code: 0,
        wait_ms: 4000,
        cool_down_secs: 3,
        pixel_count: 1,
    };
    let line = ChatLine {
        name: "alice".into(),
        text: "hello".into(),
        country: "de".into(),
        channel_id: 1,
        user_id: 9,
    };
    ws.send(WsMessage::Binary(update.dehydrate())).await.unwrap();
    ws.send(WsMessage::Binary(counter.dehydrate())).await.unwrap();
    ws.send(WsMessage::Binary(placed.dehydrate())).await.unwrap();
    ws.send(WsMessage::Binary(CoolDown::dehydrate(1500))).await.unwrap();
    // Undecodable frames are dropped without closing the socket.
    ws.send(WsMessage::Binary(Bytes::from_static(&[0xEE])))
        .await
        .unwrap();
    let chat = ServerText::Chat(line.clone()).to_frame().unwrap();
    ws.send(WsMessage::Text(chat.into())).await.unwrap();
    ws.send(WsMessage::Text(r#"["remch",4]"#.into()))
        .await
        .unwrap();

    let events = &mut running.events;
    assert_eq!(next_event(events).await, ClientEvent::PixelUpdate(update));
    assert_eq!(next_event(events).await, ClientEvent::OnlineCounter(counter));
    assert_eq!(next_event(events).await, ClientEvent::PixelReturn(placed));
    match next_event(events).await {
        ClientEvent::CoolDown(cool_down) => assert_eq!(cool_down.wait_ms, 1500),
        other => panic!("Expected CoolDown, got {other:?}"),
    }
    assert_eq!(next_event(events).await, ClientEvent::ChatMessage(line));
    assert_eq!(
        next_event(events).await,
        ClientEvent::Signal {
            name: "remch".into(),
            args: json!(4)
        }
    );
}

#[tokio::test]
async fn test_chat_is_sent_as_text() {
    let (url, mut conns) = fake_server().await;
    let mut running = start_client(url, |_| {});
    let mut ws = next_conn(&mut conns).await;
    assert_eq!(next_event(&mut running.events).await, ClientEvent::Open);

    running.client.send_chat_message("hi there", 3);
    assert_eq!(next_text(&mut ws).await, r#"["hi there",3]"#);
}

#[tokio::test]
async fn test_changed_me_reconnects_and_replays_subscriptions() {
    let (url, mut conns) = fake_server().await;
    let mut running = start_client(url, |client| {
        client.set_canvas(2);
        client.register_chunk(1, 1);
        client.register_chunk(0, 7);
    });
    let mut ws = next_conn(&mut conns).await;
    assert_eq!(next_event(&mut running.events).await, ClientEvent::Open);
    // RegisterCanvas(0), RegisterCanvas(2) and both chunks.
    for _ in 0..4 {
        next_binary(&mut ws).await;
    }

    ws.send(WsMessage::Binary(ChangedMe::dehydrate()))
        .await
        .unwrap();
    drain(ws);
    assert_eq!(next_event(&mut running.events).await, ClientEvent::ChangedMe);
    assert_eq!(next_event(&mut running.events).await, ClientEvent::Close);

    let mut ws = next_conn(&mut conns).await;
    assert_eq!(next_event(&mut running.events).await, ClientEvent::Open);
    assert_eq!(next_binary(&mut ws).await, RegisterCanvas::dehydrate(2));
    assert_eq!(
        next_binary(&mut ws).await,
        RegisterMultipleChunks::dehydrate(&[ChunkRef::new(0, 7), ChunkRef::new(1, 1)])
    );
}

#[tokio::test]
async fn test_captcha_answer_resolves_request() {
    let (url, mut conns) = fake_server().await;
    let mut running = start_client(url, |_| {});
    let mut ws = next_conn(&mut conns).await;
    assert_eq!(next_event(&mut running.events).await, ClientEvent::Open);

    let solver = running.client.clone();
    let answer = tokio::spawn(async move { solver.solve_captcha("x7k2", "c-19").await });

    assert_eq!(next_text(&mut ws).await, r#"["cs",["x7k2","c-19"]]"#);
    ws.send(WsMessage::Text(r#"["cs",0]"#.into())).await.unwrap();

    let result = tokio::time::timeout(STEP_TIMEOUT, answer)
        .await
        .expect("Timed out waiting for the captcha answer")
        .unwrap();
    assert_eq!(result, Ok(json!(0)));
    assert_eq!(
        next_event(&mut running.events).await,
        ClientEvent::Signal {
            name: "cs".into(),
            args: json!(0)
        }
    );
}

#[tokio::test]
async fn test_captcha_fails_while_disconnected() {
    init_tracing();
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let mut running = start_client(format!("ws://{addr}"), |_| {});
    // The failed connect is reported as a close.
    assert_eq!(next_event(&mut running.events).await, ClientEvent::Close);

    match running.client.solve_captcha("x", "y").await {
        Err(PixelcastError::ConnectionClosed) => {}
        other => panic!("Expected ConnectionClosed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unanswered_captcha_times_out() {
    let (url, mut conns) = fake_server().await;
    let settings = ClientSettings {
        request_timeout: Duration::from_millis(300),
        ..ClientSettings::default()
    };
    let mut running = start_client_with(url, settings, |_| {});
    let mut ws = next_conn(&mut conns).await;
    assert_eq!(next_event(&mut running.events).await, ClientEvent::Open);

    let solver = running.client.clone();
    let answer = tokio::spawn(async move { solver.solve_captcha("x7k2", "c-19").await });
    assert_eq!(next_text(&mut ws).await, r#"["cs",["x7k2","c-19"]]"#);

    // Expiry runs on the health tick, so allow one full interval.
    let result = tokio::time::timeout(STEP_TIMEOUT, answer)
        .await
        .expect("Timed out waiting for the captcha to expire")
        .unwrap();
    match result {
        Err(PixelcastError::RequestTimeout(_)) => {}
        other => panic!("Expected RequestTimeout, got {other:?}"),
    }

    // The expired entry is gone and a later exchange still works.
    let solver = running.client.clone();
    let answer = tokio::spawn(async move { solver.solve_captcha("q", "c-20").await });
    assert_eq!(next_text(&mut ws).await, r#"["cs",["q","c-20"]]"#);
    ws.send(WsMessage::Text(r#"["cs",0]"#.into())).await.unwrap();
    let result = tokio::time::timeout(STEP_TIMEOUT, answer)
        .await
        .expect("Timed out waiting for the captcha answer")
        .unwrap();
    assert_eq!(result, Ok(json!(0)));
}

#[tokio::test]
async fn test_commands_are_served_while_handshake_hangs() {
    let (url, mut conns) = silent_server().await;
    let running = start_client(url, |_| {});
    let _held = tokio::time::timeout(STEP_TIMEOUT, conns.recv())
        .await
        .expect("Timed out waiting for the client to connect")
        .expect("Silent server stopped");

    match tokio::time::timeout(STEP_TIMEOUT, running.client.solve_captcha("x", "y")).await {
        Ok(Err(PixelcastError::ConnectionClosed)) => {}
        other => panic!("Expected ConnectionClosed, got {other:?}"),
    }

    running.shutdown_tx.send(()).unwrap();
    tokio::time::timeout(STEP_TIMEOUT, running.handle)
        .await
        .expect("Client task did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_hanging_handshake_counts_as_failed_attempt() {
    let (url, mut conns) = silent_server().await;
    let settings = ClientSettings {
        connect_timeout: Duration::from_millis(300),
        ..ClientSettings::default()
    };
    let mut running = start_client_with(url, settings, |_| {});
    let _held = tokio::time::timeout(STEP_TIMEOUT, conns.recv())
        .await
        .expect("Timed out waiting for the client to connect")
        .expect("Silent server stopped");

    assert_eq!(next_event(&mut running.events).await, ClientEvent::Close);

    running.shutdown_tx.send(()).unwrap();
    tokio::time::timeout(STEP_TIMEOUT, running.handle)
        .await
        .expect("Client task did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_server_close_is_reported() {
    let (url, mut conns) = fake_server().await;
    let mut running = start_client(url, |_| {});
    let mut ws = next_conn(&mut conns).await;
    assert_eq!(next_event(&mut running.events).await, ClientEvent::Open);

    ws.close(None).await.unwrap();
    drain(ws);
    assert_eq!(next_event(&mut running.events).await, ClientEvent::Close);
}

#[tokio::test]
async fn test_shutdown_stops_the_task() {
    let (url, mut conns) = fake_server().await;
    let mut running = start_client(url, |_| {});
    let mut ws = next_conn(&mut conns).await;
    assert_eq!(next_event(&mut running.events).await, ClientEvent::Open);

    running.shutdown_tx.send(()).unwrap();
    tokio::time::timeout(STEP_TIMEOUT, running.handle)
        .await
        .expect("Client task did not stop")
        .unwrap();

    // The server sees the socket go away.
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

#[tokio::test]
async fn test_dropping_every_handle_stops_the_task() {
    let (url, mut conns) = fake_server().await;
    let mut running = start_client(url, |_| {});
    let ws = next_conn(&mut conns).await;
    assert_eq!(next_event(&mut running.events).await, ClientEvent::Open);
    drain(ws);

    drop(running.client);
    tokio::time::timeout(STEP_TIMEOUT, running.handle)
        .await
        .expect("Client task did not stop")
        .unwrap();
}
