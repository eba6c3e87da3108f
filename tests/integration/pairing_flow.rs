// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

//! Integration tests for room pairing: create, join, handshake, and
//! departure, driven over real WebSocket connections.

mod support;

use std::time::Duration;

use fluxsend_proto::room::{RoomCode, RoomStatus};
use futures_util::SinkExt;
use serde_json::json;
use support::{
    Joined, connect, connected_pair, create_room, expect_silence, fast_config, join_pair,
    recv_close, recv_error, recv_type, send_json, start,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn create_join_share_and_disconnect() {
    let (addr, state) = start(fast_config()).await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;

    let (room_id, token, a_id) = create_room(&mut a, "A").await;
    assert_eq!(room_id.len(), 6);
    assert_eq!(token.len(), 12);

    send_json(
        &mut b,
        &json!({"type": "join-room", "roomId": room_id, "token": token, "deviceName": "B"}),
    )
    .await;

    let to_b = recv_type(&mut b, "peer-joining").await;
    assert_eq!(to_b["roomId"], room_id.as_str());
    assert_eq!(to_b["peerId"], a_id.as_str());
    assert_eq!(to_b["peerName"], "A");
    assert_eq!(to_b["role"], "guest");

    let to_a = recv_type(&mut a, "peer-joining").await;
    assert_eq!(to_a["peerName"], "B");
    assert_eq!(to_a["role"], "host");
    let b_id = to_a["peerId"].as_str().unwrap().to_string();

    let established = recv_type(&mut a, "connection-established").await;
    assert_eq!(established["peerId"], b_id.as_str());
    let established = recv_type(&mut b, "connection-established").await;
    assert_eq!(established["peerName"], "A");

    let code = RoomCode::parse(&room_id).unwrap();
    let room = state.rooms.get_by_id(&code).unwrap();
    assert_eq!(room.status(), RoomStatus::Connected);
    assert_eq!(room.ready_peers().len(), 2);

    send_json(&mut a, &json!({"type": "text-share", "text": "hello"})).await;
    let shared = recv_type(&mut b, "text-share").await;
    assert_eq!(shared["text"], "hello");
    assert_eq!(shared["from"], a_id.as_str());
    assert!(shared["timestamp"].as_u64().unwrap() > 0);

    b.close(None).await.unwrap();
    let gone = recv_type(&mut a, "peer-disconnected").await;
    assert_eq!(gone["peerId"], b_id.as_str());
    assert_eq!(gone["peerName"], "B");

    let room = state.rooms.get_by_id(&code).unwrap();
    assert_eq!(room.status(), RoomStatus::Waiting);
    assert_eq!(room.guest(), None);
    assert!(room.ready_peers().is_empty());
}

#[tokio::test]
async fn mutual_peer_ready_connects_before_timer() {
    let mut config = fast_config();
    config.timing.handshake_delay = Duration::from_secs(30);
    let (addr, state) = start(config).await;
    let mut pair = join_pair(addr).await;

    send_json(&mut pair.host, &json!({"type": "peer-ready"})).await;
    expect_silence(&mut pair.guest, Duration::from_millis(100)).await;
    send_json(&mut pair.guest, &json!({"type": "peer-ready"})).await;

    recv_type(&mut pair.host, "connection-established").await;
    recv_type(&mut pair.guest, "connection-established").await;

    let room = state
        .rooms
        .get_by_id(&RoomCode::parse(&pair.room_id).unwrap())
        .unwrap();
    assert_eq!(room.status(), RoomStatus::Connected);
    assert_eq!(room.ready_peers().len(), 2);

    // A late acknowledgment does not announce the connection twice.
    send_json(&mut pair.host, &json!({"type": "peer-ready"})).await;
    expect_silence(&mut pair.guest, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn timer_and_peer_ready_announce_once() {
    let (addr, _state) = start(fast_config()).await;
    let mut pair = join_pair(addr).await;

    send_json(&mut pair.host, &json!({"type": "peer-ready"})).await;
    send_json(&mut pair.guest, &json!({"type": "peer-ready"})).await;

    recv_type(&mut pair.host, "connection-established").await;
    recv_type(&mut pair.guest, "connection-established").await;
    expect_silence(&mut pair.host, Duration::from_millis(300)).await;
    expect_silence(&mut pair.guest, Duration::from_millis(50)).await;
}

#[tokio::test]
async fn tokenless_join_is_accepted() {
    let (addr, _state) = start(fast_config()).await;
    let mut host = connect(addr).await;
    let mut guest = connect(addr).await;
    let (room_id, _token, _) = create_room(&mut host, "Host").await;

    send_json(
        &mut guest,
        &json!({"type": "join-room", "roomId": room_id.to_lowercase(), "deviceName": "Guest"}),
    )
    .await;
    recv_type(&mut guest, "peer-joining").await;
    recv_type(&mut host, "peer-joining").await;
}

#[tokio::test]
async fn join_rejections_are_indistinguishable() {
    let (addr, state) = start(fast_config()).await;
    let mut host = connect(addr).await;
    let (room_id, _token, _) = create_room(&mut host, "Host").await;

    let mut wrong_token = connect(addr).await;
    send_json(
        &mut wrong_token,
        &json!({"type": "join-room", "roomId": room_id, "token": "AAAAAAAAAAAA", "deviceName": "X"}),
    )
    .await;
    let bad_token = recv_error(&mut wrong_token, "invalid-room").await;

    let mut unknown = connect(addr).await;
    send_json(
        &mut unknown,
        &json!({"type": "join-room", "roomId": "ZZZZZZ", "deviceName": "Y"}),
    )
    .await;
    let bad_room = recv_error(&mut unknown, "invalid-room").await;

    assert_eq!(bad_token, bad_room);
    // Rejected joiners are not registered and the room is untouched.
    assert_eq!(state.devices.len(), 1);
    let room = state
        .rooms
        .get_by_id(&RoomCode::parse(&room_id).unwrap())
        .unwrap();
    assert_eq!(room.status(), RoomStatus::Waiting);

    // A rejected connection stays usable.
    create_room(&mut unknown, "Y").await;
}

#[tokio::test]
async fn second_guest_is_rejected() {
    let (addr, _state) = start(fast_config()).await;
    let pair = join_pair(addr).await;

    let mut third = connect(addr).await;
    send_json(
        &mut third,
        &json!({"type": "join-room", "roomId": pair.room_id, "deviceName": "Third"}),
    )
    .await;
    recv_error(&mut third, "invalid-room").await;
}

#[tokio::test]
async fn host_departure_destroys_room() {
    let (addr, state) = start(fast_config()).await;
    let Joined {
        mut host,
        mut guest,
        room_id,
        host_id,
        ..
    } = connected_pair(addr).await;

    host.close(None).await.unwrap();
    let gone = recv_type(&mut guest, "peer-disconnected").await;
    assert_eq!(gone["peerId"], host_id.as_str());
    assert!(state
        .rooms
        .get_by_id(&RoomCode::parse(&room_id).unwrap())
        .is_none());

    // The guest is still connected but has nowhere to send.
    send_json(&mut guest, &json!({"type": "text-share", "text": "anyone?"})).await;
    recv_error(&mut guest, "not-connected").await;
}

#[tokio::test]
async fn host_can_take_a_new_guest_after_guest_leaves() {
    let (addr, _state) = start(fast_config()).await;
    let Joined {
        mut host,
        guest,
        room_id,
        ..
    } = connected_pair(addr).await;

    drop(guest);
    recv_type(&mut host, "peer-disconnected").await;

    let mut newcomer = connect(addr).await;
    send_json(
        &mut newcomer,
        &json!({"type": "join-room", "roomId": room_id, "deviceName": "Newcomer"}),
    )
    .await;
    recv_type(&mut newcomer, "peer-joining").await;
    let joining = recv_type(&mut host, "peer-joining").await;
    assert_eq!(joining["peerName"], "Newcomer");
    recv_type(&mut host, "connection-established").await;
    recv_type(&mut newcomer, "connection-established").await;
}

#[tokio::test]
async fn inline_encryption_key_reaches_host() {
    let (addr, _state) = start(fast_config()).await;
    let mut host = connect(addr).await;
    let mut guest = connect(addr).await;
    let (room_id, token, _) = create_room(&mut host, "Host").await;

    send_json(
        &mut guest,
        &json!({
            "type": "join-room",
            "roomId": room_id,
            "token": token,
            "deviceName": "Guest",
            "encryptionKey": {"kty": "OKP", "x": "abc"}
        }),
    )
    .await;
    let joining = recv_type(&mut host, "peer-joining").await;
    let key = recv_type(&mut host, "key-exchange").await;
    assert_eq!(key["key"], json!({"kty": "OKP", "x": "abc"}));
    assert_eq!(key["from"], joining["peerId"]);
}

#[tokio::test]
async fn graceful_disconnect_notifies_peer_and_closes_normally() {
    let (addr, _state) = start(fast_config()).await;
    let mut pair = connected_pair(addr).await;

    send_json(
        &mut pair.guest,
        &json!({"type": "graceful-disconnect", "reason": "done"}),
    )
    .await;
    assert_eq!(recv_close(&mut pair.guest).await, 1000);

    let leaving = recv_type(&mut pair.host, "peer-disconnecting").await;
    assert_eq!(leaving["peerId"], pair.guest_id.as_str());
    assert_eq!(leaving["reason"], "done");
    let gone = recv_type(&mut pair.host, "peer-disconnected").await;
    assert_eq!(gone["peerId"], pair.guest_id.as_str());
}

#[tokio::test]
async fn guest_is_torn_down_when_host_vanishes_mid_handshake() {
    let mut config = fast_config();
    config.timing.handshake_delay = Duration::from_millis(400);
    let (addr, state) = start(config).await;
    let Joined {
        host,
        mut guest,
        room_id,
        ..
    } = join_pair(addr).await;

    drop(host);
    recv_type(&mut guest, "peer-disconnected").await;
    recv_error(&mut guest, "peer-unavailable").await;
    assert_eq!(recv_close(&mut guest).await, 4003);

    assert!(state
        .rooms
        .get_by_id(&RoomCode::parse(&room_id).unwrap())
        .is_none());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(state.devices.is_empty());
}

#[tokio::test]
async fn health_and_stats_endpoints() {
    let (addr, _state) = start(fast_config()).await;
    let _pair = connected_pair(addr).await;

    let health = http_get(addr, "/health").await;
    assert!(health.contains("\"status\":\"ok\""), "got: {health}");
    assert!(health.contains("uptimeSecs"));

    let stats = http_get(addr, "/stats").await;
    assert!(stats.contains("\"totalRooms\":1"), "got: {stats}");
    assert!(stats.contains("\"activeConnections\":1"));
    assert!(stats.contains("\"name\":\"Host\""));
    assert!(stats.contains("\"name\":\"Guest\""));
}

async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    response
}
