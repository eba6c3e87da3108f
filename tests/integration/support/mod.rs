//! Shared helpers for relay integration tests: an in-process server bound to
//! an OS-assigned port and a thin JSON client over `tokio-tungstenite`.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fluxsend_relay::config::RelayConfig;
use fluxsend_relay::server::{self, RelayState};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;

pub type Ws =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Upper bound for any single expected frame.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Default config with a short handshake delay so tests run quickly.
pub fn fast_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.timing.handshake_delay = Duration::from_millis(50);
    config
}

/// Starts a relay with `config` on `127.0.0.1:0`.
pub async fn start(config: RelayConfig) -> (SocketAddr, Arc<RelayState>) {
    let state = Arc::new(RelayState::with_config(config));
    let (addr, _handle) = server::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start test server");
    (addr, state)
}

pub async fn connect(addr: SocketAddr) -> Ws {
    let url = format!("ws://{addr}/ws");
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws
}

pub async fn send_json(ws: &mut Ws, value: &Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

pub async fn send_raw(ws: &mut Ws, text: &str) {
    ws.send(Message::Text(text.to_string().into())).await.unwrap();
}

pub async fn send_binary(ws: &mut Ws, data: Vec<u8>) {
    ws.send(Message::Binary(data.into())).await.unwrap();
}

/// Next frame that is not a keepalive, raw.
pub async fn recv_frame(ws: &mut Ws) -> Message {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("read error");
        match &msg {
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Text(text) if is_keepalive(text.as_str()) => {}
            _ => return msg,
        }
    }
}

/// Next non-keepalive text frame, parsed.
pub async fn recv_json(ws: &mut Ws) -> Value {
    match recv_frame(ws).await {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

/// Next message, which must have the given `type`.
pub async fn recv_type(ws: &mut Ws, ty: &str) -> Value {
    let value = recv_json(ws).await;
    assert_eq!(value["type"], ty, "unexpected message: {value}");
    value
}

/// Next message, which must be an `error` with the given code.
pub async fn recv_error(ws: &mut Ws, code: &str) -> Value {
    let value = recv_type(ws, "error").await;
    assert_eq!(value["code"], code, "unexpected error: {value}");
    value
}

/// Reads until a close frame arrives and returns its code.
pub async fn recv_close(ws: &mut Ws) -> u16 {
    loop {
        let next = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for close");
        match next {
            Some(Ok(Message::Close(Some(frame)))) => return u16::from(frame.code),
            Some(Ok(Message::Close(None))) => return 1005,
            Some(Ok(_)) => {}
            Some(Err(e)) => panic!("read error before close frame: {e}"),
            None => panic!("stream ended without close frame"),
        }
    }
}

/// Asserts nothing but keepalives arrives within `window`.
pub async fn expect_silence(ws: &mut Ws, window: Duration) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Text(text)))) if is_keepalive(text.as_str()) => {}
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
            Ok(other) => panic!("expected silence, got {other:?}"),
        }
    }
}

fn is_keepalive(text: &str) -> bool {
    serde_json::from_str::<Value>(text).is_ok_and(|v| v["type"] == "ping")
}

/// Creates a room; returns `(room_id, token, device_id)`.
pub async fn create_room(ws: &mut Ws, name: &str) -> (String, String, String) {
    send_json(ws, &json!({"type": "create-room", "deviceName": name})).await;
    let created = recv_type(ws, "room-created").await;
    assert_eq!(created["role"], "host");
    (
        created["roomId"].as_str().unwrap().to_string(),
        created["token"].as_str().unwrap().to_string(),
        created["deviceId"].as_str().unwrap().to_string(),
    )
}

/// A host and guest that both saw `peer-joining`.
pub struct Joined {
    pub host: Ws,
    pub guest: Ws,
    pub room_id: String,
    pub host_id: String,
    pub guest_id: String,
}

/// Connects two clients and joins them, without waiting for the handshake.
pub async fn join_pair(addr: SocketAddr) -> Joined {
    let mut host = connect(addr).await;
    let mut guest = connect(addr).await;
    let (room_id, token, host_id) = create_room(&mut host, "Host").await;

    send_json(
        &mut guest,
        &json!({"type": "join-room", "roomId": room_id, "token": token, "deviceName": "Guest"}),
    )
    .await;
    let to_guest = recv_type(&mut guest, "peer-joining").await;
    assert_eq!(to_guest["peerId"], host_id.as_str());
    let to_host = recv_type(&mut host, "peer-joining").await;
    let guest_id = to_host["peerId"].as_str().unwrap().to_string();

    Joined {
        host,
        guest,
        room_id,
        host_id,
        guest_id,
    }
}

/// Connects two clients and waits until the room is connected.
pub async fn connected_pair(addr: SocketAddr) -> Joined {
    let mut pair = join_pair(addr).await;
    recv_type(&mut pair.host, "connection-established").await;
    recv_type(&mut pair.guest, "connection-established").await;
    pair
}
