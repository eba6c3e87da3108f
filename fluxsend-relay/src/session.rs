//! Per-connection session: authentication, dispatch, timers, and cleanup.
//!
//! Each accepted WebSocket gets one session task. The task owns the read
//! half of the socket and processes inbound frames, keepalive ticks,
//! rate-window resets and handshake timer events one at a time from a single
//! `select!` loop, so no two events of the same connection are handled
//! concurrently. A separate writer task drains the connection's outbound
//! channel, as everywhere else in the relay.
//!
//! Lifecycle:
//! 1. Unauthenticated: only `create-room` and `join-room` are accepted.
//!    Frames that need a room close the connection with 4001; unknown types
//!    are ignored.
//! 2. Authenticated: payloads are relayed to the peer once the room is
//!    connected.
//! 3. Closed: the peer is told, the device leaves the registry and its room,
//!    and every timer is cancelled. This runs exactly once, after the loop.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use fluxsend_proto::codec::{self, Inbound};
use fluxsend_proto::device::{DeviceId, normalize_display_name};
use fluxsend_proto::message::{
    CLOSE_HANDSHAKE_FAILED, CLOSE_KEEPALIVE_TIMEOUT, CLOSE_NORMAL, CLOSE_UNAUTHORIZED,
    ClipboardShareRequest, CreateRoomRequest, ErrorCode, GracefulDisconnectRequest,
    JoinRoomRequest, KeyExchangeRequest, MessageKind, ServerMessage, TextShareRequest, Timestamp,
};
use fluxsend_proto::room::{Role, RoomCode, RoomStatus};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::devices::ConnectionHandle;
use crate::rooms::{HandshakeOutcome, HandshakeTrigger, Room};
use crate::server::RelayState;

/// How long the writer gets to flush the final close frame.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Events raised by this session's own timers.
#[derive(Debug)]
enum SessionEvent {
    /// The fixed handshake delay after a join has elapsed.
    HandshakeElapsed { code: RoomCode },
}

/// Whether the session loop keeps running after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Authentication state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unauthenticated,
    Authenticated,
}

/// Runs a session over an upgraded WebSocket until the connection ends.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (handle, mut rx) = ConnectionHandle::channel();
    let id = DeviceId::new();

    tracing::info!(device_id = %id, "connection accepted");

    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::debug!(device_id = %id, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut session = Session::new(id, handle, state, events_tx);

    let timing = session.state.config.timing;
    let mut keepalive =
        tokio::time::interval_at(Instant::now() + timing.ping_interval, timing.ping_interval);
    let mut rate_window =
        tokio::time::interval_at(Instant::now() + timing.rate_window, timing.rate_window);

    let mut writer_done = false;
    loop {
        let flow = tokio::select! {
            frame = ws_receiver.next() => match frame {
                Some(Ok(msg)) => session.on_frame(msg),
                Some(Err(e)) => {
                    tracing::debug!(device_id = %id, error = %e, "WebSocket read failed");
                    Flow::Close
                }
                None => Flow::Close,
            },
            Some(event) = events_rx.recv() => session.on_event(event),
            _ = keepalive.tick() => session.on_keepalive(),
            _ = rate_window.tick() => {
                session.frames_in_window = 0;
                Flow::Continue
            }
            _ = &mut write_task, if !writer_done => {
                tracing::debug!(device_id = %id, "writer finished");
                writer_done = true;
                Flow::Close
            }
        };
        if flow == Flow::Close {
            break;
        }
    }

    session.cleanup();
    drop(session);

    if !writer_done
        && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut write_task)
            .await
            .is_err()
    {
        write_task.abort();
    }
    tracing::info!(device_id = %id, "connection closed");
}

/// State owned by one connection's session task.
struct Session {
    id: DeviceId,
    handle: ConnectionHandle,
    state: Arc<RelayState>,
    phase: Phase,
    last_seen: Instant,
    frames_in_window: u32,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    timers: Vec<JoinHandle<()>>,
    cleaned_up: bool,
}

impl Session {
    fn new(
        id: DeviceId,
        handle: ConnectionHandle,
        state: Arc<RelayState>,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            id,
            handle,
            state,
            phase: Phase::Unauthenticated,
            last_seen: Instant::now(),
            frames_in_window: 0,
            events_tx,
            timers: Vec::new(),
            cleaned_up: false,
        }
    }

    // --- inbound frames ---

    fn on_frame(&mut self, msg: Message) -> Flow {
        self.last_seen = Instant::now();
        match msg {
            Message::Text(text) => self.on_text(text),
            Message::Binary(data) => self.on_binary(data),
            Message::Ping(_) | Message::Pong(_) => Flow::Continue,
            Message::Close(frame) => {
                tracing::info!(
                    device_id = %self.id,
                    code = frame.as_ref().map(|f| f.code),
                    "received close frame"
                );
                self.handle.mark_closed();
                Flow::Close
            }
        }
    }

    fn on_text(&mut self, text: Utf8Bytes) -> Flow {
        let limits = self.state.config.limits;

        if self.frames_in_window >= limits.rate_limit_per_minute {
            tracing::warn!(device_id = %self.id, "rate limit exceeded");
            self.reply_error(ErrorCode::RateLimited, "too many messages, slow down");
            return Flow::Continue;
        }
        self.frames_in_window += 1;

        let size = text.as_str().len();
        if size > limits.max_text_frame {
            tracing::warn!(
                device_id = %self.id,
                size,
                max = limits.max_text_frame,
                "text frame exceeds size limit"
            );
            self.reply_error(
                ErrorCode::PayloadTooLarge,
                format!("message too large: {size} bytes (max {})", limits.max_text_frame),
            );
            return Flow::Continue;
        }

        let inbound = match codec::decode(text.as_str()) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::warn!(device_id = %self.id, error = %e, "failed to decode message");
                self.reply_error(ErrorCode::InvalidMessage, e.to_string());
                return Flow::Continue;
            }
        };

        tracing::debug!(device_id = %self.id, kind = %inbound.kind, "dispatching message");
        match self.phase {
            Phase::Unauthenticated => self.dispatch_unauthenticated(&inbound),
            Phase::Authenticated => self.dispatch_authenticated(&inbound, text),
        }
    }

    fn on_binary(&self, data: Bytes) -> Flow {
        if self.phase == Phase::Unauthenticated {
            return self.reject_unauthorized("binary frame");
        }
        let max = self.state.config.limits.max_binary_chunk;
        if data.len() > max {
            tracing::warn!(device_id = %self.id, size = data.len(), max, "binary chunk exceeds size limit");
            self.reply_error(
                ErrorCode::PayloadTooLarge,
                format!("chunk too large: {} bytes (max {max})", data.len()),
            );
            return Flow::Continue;
        }
        let _ = self.state.relay.relay(&self.id, Message::Binary(data));
        Flow::Continue
    }

    fn dispatch_unauthenticated(&mut self, inbound: &Inbound) -> Flow {
        match &inbound.kind {
            MessageKind::CreateRoom => self.create_room(inbound),
            MessageKind::JoinRoom => self.join_room(inbound),
            MessageKind::Pong => Flow::Continue,
            MessageKind::GracefulDisconnect => {
                self.handle.close(CLOSE_NORMAL, "graceful disconnect");
                Flow::Close
            }
            MessageKind::Other(ty) => {
                tracing::debug!(device_id = %self.id, kind = %ty, "ignoring unknown message before authentication");
                Flow::Continue
            }
            kind => self.reject_unauthorized(kind.as_str()),
        }
    }

    fn dispatch_authenticated(&self, inbound: &Inbound, original: Utf8Bytes) -> Flow {
        let relay = &self.state.relay;
        match &inbound.kind {
            MessageKind::CreateRoom | MessageKind::JoinRoom => {
                self.reply_error(ErrorCode::AlreadyInRoom, "connection already belongs to a room");
            }
            MessageKind::PeerReady => self.peer_ready(),
            MessageKind::TextShare => {
                let Some(req) = self.parse_body::<TextShareRequest>(inbound) else {
                    return Flow::Continue;
                };
                if self.check_size("text", req.text.len(), self.state.config.limits.max_text_share) {
                    let msg = ServerMessage::TextShare {
                        text: req.text,
                        from: self.id,
                        timestamp: Timestamp::now(),
                    };
                    let _ = relay.relay_message(&self.id, &msg);
                }
            }
            MessageKind::ClipboardShare => {
                let Some(req) = self.parse_body::<ClipboardShareRequest>(inbound) else {
                    return Flow::Continue;
                };
                if self.check_size(
                    "clipboard",
                    req.content.len(),
                    self.state.config.limits.max_clipboard,
                ) {
                    let msg = ServerMessage::ClipboardShare {
                        content: req.content,
                        from: self.id,
                        timestamp: Timestamp::now(),
                    };
                    let _ = relay.relay_message(&self.id, &msg);
                }
            }
            MessageKind::KeyExchange => {
                let Some(req) = self.parse_body::<KeyExchangeRequest>(inbound) else {
                    return Flow::Continue;
                };
                let msg = ServerMessage::KeyExchange {
                    key: req.key,
                    from: self.id,
                };
                let _ = relay.relay_message(&self.id, &msg);
            }
            MessageKind::GracefulDisconnect => return self.graceful_disconnect(inbound),
            MessageKind::Pong => {}
            kind if kind.is_opaque() => {
                let _ = relay.relay(&self.id, Message::Text(original));
            }
            kind => {
                tracing::error!(device_id = %self.id, kind = %kind, "no handler for message kind");
                self.reply_error(ErrorCode::InternalError, "message could not be handled");
            }
        }
        Flow::Continue
    }

    // --- authentication ---

    fn create_room(&mut self, inbound: &Inbound) -> Flow {
        let Some(req) = self.parse_body::<CreateRoomRequest>(inbound) else {
            return Flow::Continue;
        };
        let Some(name) = req.device_name.as_deref().and_then(normalize_display_name) else {
            self.reply_error(ErrorCode::InvalidMessage, "deviceName is required");
            return Flow::Continue;
        };

        self.state
            .devices
            .register(self.id, self.handle.clone(), name.as_str());
        let room = self.state.rooms.create_room(self.id);
        self.phase = Phase::Authenticated;

        tracing::info!(device_id = %self.id, room_id = %room.code(), name = %name, "room created");
        self.reply(&ServerMessage::RoomCreated {
            room_id: room.code().clone(),
            token: room.token().clone(),
            role: Role::Host,
            device_id: self.id,
            expires_in_secs: self.state.rooms.timeouts().waiting.as_secs(),
        });
        Flow::Continue
    }

    fn join_room(&mut self, inbound: &Inbound) -> Flow {
        let Some(req) = self.parse_body::<JoinRoomRequest>(inbound) else {
            return Flow::Continue;
        };
        let Some(raw_code) = req.room_id.as_deref() else {
            self.reply_error(ErrorCode::InvalidMessage, "roomId is required");
            return Flow::Continue;
        };
        let Some(name) = req.device_name.as_deref().and_then(normalize_display_name) else {
            self.reply_error(ErrorCode::InvalidMessage, "deviceName is required");
            return Flow::Continue;
        };
        let Some(code) = RoomCode::parse(raw_code) else {
            tracing::warn!(device_id = %self.id, "join with unparseable room code");
            self.reply_error(ErrorCode::InvalidRoom, "invalid or expired room");
            return Flow::Continue;
        };

        let devices = &self.state.devices;
        devices.register(self.id, self.handle.clone(), name.as_str());
        let room = match self
            .state
            .rooms
            .join_room(&code, req.token.as_deref(), self.id)
        {
            Ok(room) => room,
            Err(reason) => {
                devices.remove(&self.id);
                tracing::warn!(device_id = %self.id, room_id = %code, reason = %reason, "join rejected");
                self.reply_error(ErrorCode::InvalidRoom, "invalid or expired room");
                return Flow::Continue;
            }
        };
        self.phase = Phase::Authenticated;

        let host = room.host();
        let host_name = devices.name_of(&host).unwrap_or_default();
        tracing::info!(device_id = %self.id, room_id = %code, host_id = %host, "guest joined room");

        let relay = &self.state.relay;
        relay.send_to(
            &host,
            &ServerMessage::PeerJoining {
                room_id: code.clone(),
                peer_id: self.id,
                peer_name: name,
                role: Role::Host,
            },
        );
        self.reply(&ServerMessage::PeerJoining {
            room_id: code.clone(),
            peer_id: host,
            peer_name: host_name,
            role: Role::Guest,
        });
        if let Some(key) = req.encryption_key {
            relay.send_to(&host, &ServerMessage::KeyExchange { key, from: self.id });
        }

        self.start_handshake_timer(code);
        Flow::Continue
    }

    // --- handshake ---

    fn start_handshake_timer(&mut self, code: RoomCode) {
        let delay = self.state.config.timing.handshake_delay;
        let events = self.events_tx.clone();
        self.timers.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(SessionEvent::HandshakeElapsed { code });
        }));
    }

    fn on_event(&self, event: SessionEvent) -> Flow {
        match event {
            SessionEvent::HandshakeElapsed { code } => self.on_handshake_elapsed(&code),
        }
    }

    /// Promotes the room once the handshake delay passed with both sides
    /// still connected; tears this guest down if the host is gone.
    fn on_handshake_elapsed(&self, code: &RoomCode) -> Flow {
        let rooms = &self.state.rooms;
        let room = rooms
            .get_by_id(code)
            .filter(|room| room.guest() == Some(self.id));

        let Some(room) = room else {
            return self.fail_handshake(code);
        };
        if room.status() == RoomStatus::Connected {
            return Flow::Continue;
        }
        if !self.state.devices.is_online(&room.host()) {
            return self.fail_handshake(code);
        }
        if !self.handle.is_open() {
            return Flow::Close;
        }

        match rooms.try_complete_handshake(code, self.id, HandshakeTrigger::Timer) {
            HandshakeOutcome::Completed(room) => self.announce_connected(&room),
            outcome => {
                tracing::debug!(device_id = %self.id, room_id = %code, ?outcome, "handshake timer found nothing to do");
            }
        }
        Flow::Continue
    }

    fn fail_handshake(&self, code: &RoomCode) -> Flow {
        tracing::warn!(device_id = %self.id, room_id = %code, "peer vanished during handshake");
        self.reply_error(ErrorCode::PeerUnavailable, "peer left before the connection was established");
        self.handle.close(CLOSE_HANDSHAKE_FAILED, "handshake failed");
        Flow::Close
    }

    fn peer_ready(&self) {
        let rooms = &self.state.rooms;
        let Some(room) = rooms.mark_ready(&self.id) else {
            self.reply_error(ErrorCode::NotConnected, "no peer to acknowledge");
            return;
        };
        let Some(guest) = room.guest() else {
            return;
        };
        match rooms.try_complete_handshake(room.code(), guest, HandshakeTrigger::PeerReady) {
            HandshakeOutcome::Completed(room) => self.announce_connected(&room),
            outcome => {
                tracing::debug!(device_id = %self.id, room_id = %room.code(), ?outcome, "peer ready recorded");
            }
        }
    }

    /// Tells both occupants the room is connected.
    fn announce_connected(&self, room: &Room) {
        tracing::info!(room_id = %room.code(), "handshake complete");
        let devices = &self.state.devices;
        for occupant in room.occupants() {
            let Some(peer) = room.peer_of(&occupant) else {
                continue;
            };
            let msg = ServerMessage::ConnectionEstablished {
                room_id: room.code().clone(),
                peer_id: peer,
                peer_name: devices.name_of(&peer).unwrap_or_default(),
            };
            self.state.relay.send_to(&occupant, &msg);
        }
    }

    // --- disconnect and liveness ---

    fn graceful_disconnect(&self, inbound: &Inbound) -> Flow {
        let req: GracefulDisconnectRequest = inbound.body().unwrap_or_default();
        tracing::info!(device_id = %self.id, reason = ?req.reason, "graceful disconnect");
        if let Some(peer) = self
            .state
            .rooms
            .get_by_device(&self.id)
            .and_then(|room| room.peer_of(&self.id))
        {
            self.state.relay.send_to(
                &peer,
                &ServerMessage::PeerDisconnecting {
                    peer_id: self.id,
                    reason: req.reason,
                },
            );
        }
        self.handle.close(CLOSE_NORMAL, "graceful disconnect");
        Flow::Close
    }

    fn on_keepalive(&self) -> Flow {
        let silent_for = self.last_seen.elapsed();
        if silent_for > self.state.config.timing.liveness_timeout {
            tracing::warn!(
                device_id = %self.id,
                silent_secs = silent_for.as_secs(),
                "no activity within liveness timeout, terminating"
            );
            self.handle.close(CLOSE_KEEPALIVE_TIMEOUT, "keepalive timeout");
            return Flow::Close;
        }
        self.reply(&ServerMessage::Ping {
            timestamp: Timestamp::now(),
        });
        Flow::Continue
    }

    fn reject_unauthorized(&self, what: &str) -> Flow {
        tracing::warn!(device_id = %self.id, kind = %what, "message before authentication");
        self.handle.close(CLOSE_UNAUTHORIZED, "unauthorized");
        Flow::Close
    }

    /// Notifies the peer, then removes the device from the registry and its
    /// room, then cancels timers. Runs once.
    fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;

        for timer in self.timers.drain(..) {
            timer.abort();
        }
        self.handle.mark_closed();

        let name = self
            .state
            .devices
            .remove(&self.id)
            .map(|device| device.name)
            .unwrap_or_default();
        for departure in self.state.rooms.remove_device(&self.id) {
            tracing::info!(
                device_id = %self.id,
                room_id = %departure.code,
                role = %departure.role,
                destroyed = departure.destroyed,
                "device left room"
            );
            if let Some(peer) = departure.remaining {
                self.state.relay.send_to(
                    &peer,
                    &ServerMessage::PeerDisconnected {
                        peer_id: self.id,
                        peer_name: name.clone(),
                    },
                );
            }
        }
    }

    // --- helpers ---

    fn parse_body<T: serde::de::DeserializeOwned>(&self, inbound: &Inbound) -> Option<T> {
        match inbound.body() {
            Ok(body) => Some(body),
            Err(e) => {
                tracing::warn!(device_id = %self.id, error = %e, "invalid message body");
                self.reply_error(ErrorCode::InvalidMessage, e.to_string());
                None
            }
        }
    }

    /// Replies `payload-too-large` and returns `false` if `len` exceeds `max`.
    fn check_size(&self, what: &str, len: usize, max: usize) -> bool {
        if len <= max {
            return true;
        }
        tracing::warn!(device_id = %self.id, what, size = len, max, "payload exceeds size limit");
        self.reply_error(
            ErrorCode::PayloadTooLarge,
            format!("{what} too large: {len} bytes (max {max})"),
        );
        false
    }

    fn reply(&self, msg: &ServerMessage) {
        if let Err(e) = self.handle.send_message(msg) {
            tracing::debug!(device_id = %self.id, error = %e, "reply dropped");
        }
    }

    fn reply_error(&self, code: ErrorCode, message: impl Into<String>) {
        self.reply(&ServerMessage::error(code, message));
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cleanup();
    }
}
