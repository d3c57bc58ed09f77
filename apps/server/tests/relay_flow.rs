//! End-to-end relay tests: a real relay, a fake session backend, WebSocket clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use signaling_relay::bridge::HttpSessionBackend;
use signaling_relay::config::Config;
use signaling_relay::state::AppState;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Deserialize)]
struct Since {
    since: Option<u64>,
}

fn fake_backend() -> Router {
    Router::new().route(
        "/api/chat/:session/messages",
        post(|Path(session): Path<String>, Json(draft): Json<Value>| async move {
            if session == "broken" {
                return (StatusCode::BAD_GATEWAY, Json(json!({ "error": "db down" })));
            }
            if session == "slow" {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            let mut stored = draft;
            stored["id"] = json!(42);
            (StatusCode::OK, Json(json!({ "success": true, "data": stored })))
        })
        .get(|Query(query): Query<Since>| async move {
            let since = query.since.unwrap_or(0);
            let messages: Vec<Value> = (1..=5u64)
                .filter(|id| *id > since)
                .map(|id| json!({ "id": id, "message": format!("m{id}") }))
                .collect();
            Json(json!({ "success": true, "data": messages }))
        }),
    )
}

async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    addr
}

async fn boot_relay() -> SocketAddr {
    boot_relay_with(|_| {}).await.0
}

async fn boot_relay_with(configure: impl FnOnce(&mut Config)) -> (SocketAddr, AppState) {
    let backend_addr = serve(fake_backend()).await;
    let mut config = Config {
        backend_base_url: format!("http://{backend_addr}"),
        ring_timeout: None,
        ..Config::default()
    };
    configure(&mut config);
    let backend = HttpSessionBackend::new(&config.backend_base_url, Duration::from_secs(2))
        .expect("backend client");
    let state = AppState::new(config, Arc::new(backend));
    let addr = serve(signaling_relay::app(state.clone())).await;
    (addr, state)
}

/// Polls until `done` holds or the test timeout elapses.
async fn eventually(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !done() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn connect(addr: SocketAddr, path: &str, session: &str, user: &str) -> WsStream {
    let url = format!("ws://{addr}/{path}?appointmentId={session}&userId={user}&authToken=t-{user}");
    let (mut ws, _) = connect_async(url).await.expect("connect");
    let established = recv(&mut ws).await;
    assert_eq!(established["type"], "connection-established");
    assert_eq!(established["userId"], user);
    ws
}

async fn send(ws: &mut WsStream, envelope: Value) {
    ws.send(Message::Text(envelope.to_string()))
        .await
        .expect("send");
}

async fn recv(ws: &mut WsStream) -> Value {
    loop {
        let frame = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for envelope")
            .expect("stream ended")
            .expect("read frame");
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).expect("json envelope"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

#[tokio::test]
async fn offer_answer_relay_and_participant_left() {
    let addr = boot_relay().await;
    let mut a = connect(addr, "call-signaling", "S1", "A").await;
    let mut b = connect(addr, "call-signaling", "S1", "B").await;

    send(&mut a, json!({ "type": "offer", "offer": { "type": "offer", "sdp": "v=0 a" } })).await;
    let offer = recv(&mut b).await;
    assert_eq!(offer["type"], "offer");
    assert_eq!(offer["userId"], "A");
    assert_eq!(offer["sessionId"], "S1");

    send(&mut b, json!({ "type": "answer", "answer": { "type": "answer", "sdp": "v=0 b" } })).await;
    let answer = recv(&mut a).await;
    assert_eq!(answer["type"], "answer");
    assert_eq!(answer["userId"], "B");

    let health: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .expect("health request")
        .json()
        .await
        .expect("health json");
    assert_eq!(health["activeAppointments"], 1);
    assert_eq!(health["totalConnections"], 2);

    a.close(None).await.expect("close");
    let left = recv(&mut b).await;
    assert_eq!(left["type"], "participant-left");
    assert_eq!(left["userId"], "A");
}

#[tokio::test]
async fn duplicate_offer_is_suppressed() {
    let addr = boot_relay().await;
    let mut a = connect(addr, "audio-signaling", "S2", "A").await;
    let mut b = connect(addr, "audio-signaling", "S2", "B").await;

    let offer = json!({ "type": "offer", "sdp": "v=0 identical" });
    send(&mut a, offer.clone()).await;
    send(&mut a, offer).await;
    send(&mut a, json!({ "type": "ice-candidate", "candidate": "marker" })).await;

    assert_eq!(recv(&mut b).await["type"], "offer");
    let next = recv(&mut b).await;
    assert_eq!(next["type"], "ice-candidate");
    assert_eq!(next["candidate"], "marker");
}

#[tokio::test]
async fn persisted_chat_reaches_each_member_once() {
    let addr = boot_relay().await;
    let mut a = connect(addr, "chat-signaling", "S3", "A").await;
    let mut b = connect(addr, "chat-signaling", "S3", "B").await;

    send(
        &mut a,
        json!({ "type": "chat-message", "message": { "message": "hello", "messageType": "text" } }),
    )
    .await;

    for ws in [&mut a, &mut b] {
        let chat = recv(ws).await;
        assert_eq!(chat["type"], "chat-message");
        assert_eq!(chat["message"]["id"], 42);
        assert_eq!(chat["message"]["message"], "hello");
    }

    send(&mut a, json!({ "type": "typing-indicator", "isTyping": false })).await;
    send(&mut b, json!({ "type": "typing-indicator", "isTyping": false })).await;
    assert_eq!(recv(&mut b).await["type"], "typing-indicator");
    assert_eq!(recv(&mut a).await["type"], "typing-indicator");
}

#[tokio::test]
async fn failed_chat_reports_one_error_to_sender() {
    let addr = boot_relay().await;
    let mut a = connect(addr, "chat-signaling", "broken", "A").await;
    let mut b = connect(addr, "chat-signaling", "broken", "B").await;

    send(&mut a, json!({ "type": "chat-message", "message": { "message": "lost" } })).await;
    let error = recv(&mut a).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "backend");
    assert_eq!(error["message"], "Failed to send message");

    send(&mut a, json!({ "type": "typing-indicator", "isTyping": true })).await;
    let next = recv(&mut b).await;
    assert_eq!(next["type"], "typing-indicator");
    assert_eq!(next["senderId"], "A");
}

#[tokio::test]
async fn sync_returns_only_newer_messages() {
    let addr = boot_relay().await;
    let mut a = connect(addr, "chat-signaling", "S4", "A").await;

    send(&mut a, json!({ "type": "sync-messages", "lastMessageId": 3 })).await;
    let synced = recv(&mut a).await;
    assert_eq!(synced["type"], "messages-synced");
    let ids: Vec<u64> = synced["messages"]
        .as_array()
        .expect("messages")
        .iter()
        .filter_map(|message| message["id"].as_u64())
        .collect();
    assert_eq!(ids, vec![4, 5]);

    send(&mut a, json!({ "type": "sync-messages" })).await;
    let again = recv(&mut a).await;
    assert_eq!(again["messages"], json!([]));
}

#[tokio::test]
async fn malformed_envelope_keeps_connection_open() {
    let addr = boot_relay().await;
    let mut a = connect(addr, "call-signaling", "S5", "A").await;
    let mut b = connect(addr, "call-signaling", "S5", "B").await;

    a.send(Message::Text("{broken".to_string())).await.expect("send");
    let error = recv(&mut a).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "invalid_envelope");

    send(&mut a, json!({ "type": "screen-share", "enabled": true })).await;
    let relayed = recv(&mut b).await;
    assert_eq!(relayed["type"], "screen-share");
    assert_eq!(relayed["enabled"], true);
    assert_eq!(relayed["userId"], "A");
}

#[tokio::test]
async fn handshake_without_user_is_refused() {
    let addr = boot_relay().await;
    let result = connect_async(format!("ws://{addr}/call-signaling?appointmentId=S6")).await;

    match result {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status().as_u16(), 400),
        Err(e) => panic!("expected HTTP 400, got {e}"),
        Ok(_) => panic!("handshake without userId was accepted"),
    }
}

#[tokio::test]
async fn queued_envelopes_are_relayed_before_participant_left() {
    let addr = boot_relay().await;
    let mut a = connect(addr, "call-signaling", "slow", "A").await;
    let mut b = connect(addr, "call-signaling", "slow", "B").await;

    send(&mut a, json!({ "type": "chat-message", "message": { "message": "first" } })).await;
    send(&mut a, json!({ "type": "offer", "sdp": "late" })).await;
    a.close(None).await.expect("close");

    let mut seen = Vec::new();
    loop {
        let envelope = recv(&mut b).await;
        let kind = envelope["type"].as_str().expect("type").to_string();
        seen.push(kind.clone());
        if kind == "participant-left" {
            break;
        }
    }
    assert_eq!(seen, vec!["chat-message", "offer", "participant-left"]);
}

#[tokio::test]
async fn silent_peer_is_dropped_by_heartbeat() {
    let (addr, _state) = boot_relay_with(|config| {
        config.heartbeat_interval = Duration::from_secs(1);
        config.pong_timeout = Duration::from_secs(1);
    })
    .await;
    // Never polled again, so it never answers pings.
    let _silent = connect(addr, "call-signaling", "S7", "A").await;
    let mut b = connect(addr, "call-signaling", "S7", "B").await;

    let left = recv(&mut b).await;
    assert_eq!(left["type"], "participant-left");
    assert_eq!(left["userId"], "A");
}

#[tokio::test]
async fn shutdown_closes_connections_with_going_away() {
    let (addr, state) = boot_relay_with(|_| {}).await;
    let mut a = connect(addr, "chat-signaling", "S8", "A").await;

    state.begin_shutdown();

    let frame = timeout(TIMEOUT, a.next())
        .await
        .expect("timed out waiting for close")
        .expect("stream ended")
        .expect("read frame");
    match frame {
        Message::Close(Some(close)) => {
            assert_eq!(u16::from(close.code), 1001);
            assert_eq!(close.reason, "Server shutting down");
        }
        other => panic!("expected a close frame, got {other:?}"),
    }
    eventually("registry to empty", || state.registry.count_all() == 0).await;
}

#[tokio::test]
async fn last_member_leaving_releases_call_state() {
    let (addr, state) = boot_relay_with(|_| {}).await;
    let mut a = connect(addr, "call-signaling", "S9", "A").await;

    send(&mut a, json!({ "type": "offer", "sdp": "v=0 ringing" })).await;
    eventually("call to start ringing", || state.calls.in_progress() == 1).await;

    a.close(None).await.expect("close");
    eventually("call state release", || state.calls.in_progress() == 0).await;
    assert_eq!(state.registry.session_count(), 0);
}
