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

//! Integration tests for per-connection guards: authentication, malformed
//! input, size and rate ceilings, and keepalive.

mod support;

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::json;
use support::{
    connect, connected_pair, create_room, expect_silence, fast_config, join_pair, recv_close,
    recv_error, recv_type, send_binary, send_json, send_raw, start,
};
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn message_before_authentication_closes_unauthorized() {
    let (addr, state) = start(fast_config()).await;
    let mut ws = connect(addr).await;

    send_json(&mut ws, &json!({"type": "text-share", "text": "sneaky"})).await;
    assert_eq!(recv_close(&mut ws).await, 4001);
    assert!(state.devices.is_empty());
}

#[tokio::test]
async fn peer_ready_before_authentication_closes_unauthorized() {
    let (addr, _state) = start(fast_config()).await;
    let mut ws = connect(addr).await;

    send_json(&mut ws, &json!({"type": "peer-ready"})).await;
    assert_eq!(recv_close(&mut ws).await, 4001);
}

#[tokio::test]
async fn binary_before_authentication_closes_unauthorized() {
    let (addr, _state) = start(fast_config()).await;
    let mut ws = connect(addr).await;

    send_binary(&mut ws, vec![1, 2, 3]).await;
    assert_eq!(recv_close(&mut ws).await, 4001);
}

#[tokio::test]
async fn unknown_type_before_authentication_is_ignored() {
    let (addr, _state) = start(fast_config()).await;
    let mut ws = connect(addr).await;

    send_json(&mut ws, &json!({"type": "hello-from-the-future"})).await;
    expect_silence(&mut ws, Duration::from_millis(100)).await;
    create_room(&mut ws, "Still here").await;
}

#[tokio::test]
async fn malformed_frames_report_invalid_message() {
    let (addr, _state) = start(fast_config()).await;
    let mut ws = connect(addr).await;

    send_raw(&mut ws, "{not json").await;
    recv_error(&mut ws, "invalid-message").await;
    send_raw(&mut ws, "[1,2,3]").await;
    recv_error(&mut ws, "invalid-message").await;
    send_raw(&mut ws, r#"{"text":"no type"}"#).await;
    recv_error(&mut ws, "invalid-message").await;

    create_room(&mut ws, "Recovered").await;
}

#[tokio::test]
async fn create_room_requires_display_name() {
    let (addr, state) = start(fast_config()).await;
    let mut ws = connect(addr).await;

    send_json(&mut ws, &json!({"type": "create-room"})).await;
    recv_error(&mut ws, "invalid-message").await;
    send_json(&mut ws, &json!({"type": "create-room", "deviceName": "   "})).await;
    recv_error(&mut ws, "invalid-message").await;
    assert!(state.rooms.is_empty());
}

#[tokio::test]
async fn long_display_names_are_truncated() {
    let (addr, state) = start(fast_config()).await;
    let mut ws = connect(addr).await;

    create_room(&mut ws, &"n".repeat(80)).await;
    let devices = state.list_devices();
    assert_eq!(devices[0].name.chars().count(), 50);
}

#[tokio::test]
async fn join_requires_room_id() {
    let (addr, _state) = start(fast_config()).await;
    let mut ws = connect(addr).await;

    send_json(&mut ws, &json!({"type": "join-room", "deviceName": "Guest"})).await;
    recv_error(&mut ws, "invalid-message").await;
}

#[tokio::test]
async fn authenticated_connection_cannot_create_again() {
    let (addr, state) = start(fast_config()).await;
    let mut ws = connect(addr).await;
    create_room(&mut ws, "Host").await;

    send_json(&mut ws, &json!({"type": "create-room", "deviceName": "Host"})).await;
    recv_error(&mut ws, "already-in-room").await;
    send_json(
        &mut ws,
        &json!({"type": "join-room", "roomId": "ABCDEF", "deviceName": "Host"}),
    )
    .await;
    recv_error(&mut ws, "already-in-room").await;
    assert_eq!(state.rooms.len(), 1);
}

#[tokio::test]
async fn relay_before_handshake_is_refused() {
    let mut config = fast_config();
    config.timing.handshake_delay = Duration::from_secs(30);
    let (addr, _state) = start(config).await;
    let mut pair = join_pair(addr).await;

    send_json(&mut pair.host, &json!({"type": "text-share", "text": "too early"})).await;
    recv_error(&mut pair.host, "not-connected").await;
    send_json(&mut pair.host, &json!({"type": "file-offer", "name": "a.bin"})).await;
    recv_error(&mut pair.host, "not-connected").await;
    expect_silence(&mut pair.guest, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn oversized_text_share_is_rejected() {
    let mut config = fast_config();
    config.limits.max_text_share = 16;
    let (addr, _state) = start(config).await;
    let mut pair = connected_pair(addr).await;

    send_json(&mut pair.host, &json!({"type": "text-share", "text": "x".repeat(17)})).await;
    recv_error(&mut pair.host, "payload-too-large").await;

    send_json(&mut pair.host, &json!({"type": "text-share", "text": "fits"})).await;
    let shared = recv_type(&mut pair.guest, "text-share").await;
    assert_eq!(shared["text"], "fits");
}

#[tokio::test]
async fn oversized_clipboard_is_rejected() {
    let mut config = fast_config();
    config.limits.max_clipboard = 8;
    let (addr, _state) = start(config).await;
    let mut pair = connected_pair(addr).await;

    send_json(
        &mut pair.guest,
        &json!({"type": "clipboard-share", "content": "123456789"}),
    )
    .await;
    recv_error(&mut pair.guest, "payload-too-large").await;

    send_json(&mut pair.guest, &json!({"type": "clipboard-share", "content": "1234"})).await;
    let shared = recv_type(&mut pair.host, "clipboard-share").await;
    assert_eq!(shared["content"], "1234");
    assert_eq!(shared["from"], pair.guest_id.as_str());
}

#[tokio::test]
async fn oversized_text_frame_is_rejected() {
    let mut config = fast_config();
    config.limits.max_text_frame = 64;
    let (addr, _state) = start(config).await;
    let mut ws = connect(addr).await;

    let padding = "p".repeat(100);
    send_json(&mut ws, &json!({"type": "create-room", "deviceName": padding})).await;
    recv_error(&mut ws, "payload-too-large").await;
}

#[tokio::test]
async fn text_frames_are_rate_limited() {
    let mut config = fast_config();
    config.limits.rate_limit_per_minute = 5;
    let (addr, _state) = start(config).await;
    let mut pair = connected_pair(addr).await;

    // create-room already used one frame of the budget.
    for _ in 0..4 {
        send_json(&mut pair.host, &json!({"type": "pong"})).await;
    }
    send_json(&mut pair.host, &json!({"type": "text-share", "text": "over"})).await;
    recv_error(&mut pair.host, "rate-limited").await;
    expect_silence(&mut pair.guest, Duration::from_millis(100)).await;

    // Binary chunks are exempt.
    send_binary(&mut pair.host, vec![7; 8]).await;
    match support::recv_frame(&mut pair.guest).await {
        Message::Binary(data) => assert_eq!(&data[..], &[7u8; 8]),
        other => panic!("expected binary, got {other:?}"),
    }
}

#[tokio::test]
async fn rate_window_resets() {
    let mut config = fast_config();
    config.limits.rate_limit_per_minute = 2;
    config.timing.rate_window = Duration::from_secs(1);
    let (addr, _state) = start(config).await;
    let mut ws = connect(addr).await;
    create_room(&mut ws, "Host").await;

    send_json(&mut ws, &json!({"type": "pong"})).await;
    send_json(&mut ws, &json!({"type": "create-room", "deviceName": "Host"})).await;
    recv_error(&mut ws, "rate-limited").await;

    tokio::time::sleep(Duration::from_millis(1200)).await;
    send_json(&mut ws, &json!({"type": "create-room", "deviceName": "Host"})).await;
    recv_error(&mut ws, "already-in-room").await;
}

#[tokio::test]
async fn silent_connection_is_terminated() {
    let mut config = fast_config();
    config.timing.ping_interval = Duration::from_millis(100);
    config.timing.liveness_timeout = Duration::from_millis(250);
    let (addr, _state) = start(config).await;
    let mut ws = connect(addr).await;

    // Read pings but never answer them.
    assert_eq!(recv_close(&mut ws).await, 4002);
}

#[tokio::test]
async fn pong_keeps_connection_alive() {
    let mut config = fast_config();
    config.timing.ping_interval = Duration::from_millis(100);
    config.timing.liveness_timeout = Duration::from_millis(250);
    let (addr, _state) = start(config).await;
    let mut ws = connect(addr).await;

    let deadline = tokio::time::Instant::now() + Duration::from_millis(800);
    let mut pings = 0;
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => break,
            Ok(Some(Ok(Message::Text(text)))) => {
                let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                assert_eq!(value["type"], "ping");
                assert!(value["timestamp"].is_u64());
                pings += 1;
                send_json(&mut ws, &json!({"type": "pong"})).await;
            }
            Ok(other) => panic!("unexpected frame: {other:?}"),
        }
    }
    assert!(pings >= 3, "only {pings} pings");
    create_room(&mut ws, "Alive").await;
}

#[tokio::test]
async fn closed_session_leaves_no_state_behind() {
    let (addr, state) = start(fast_config()).await;
    let pair = connected_pair(addr).await;
    assert_eq!(state.devices.len(), 2);

    drop(pair);
    for _ in 0..50 {
        if state.devices.is_empty() && state.rooms.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "state not cleaned up: {} devices, {} rooms",
        state.devices.len(),
        state.rooms.len()
    );
}
