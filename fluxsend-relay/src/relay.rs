//! Relay engine: forwards payloads between the two occupants of a room.
//!
//! The engine never caches connection handles. Each send resolves the
//! sender's room through the [`RoomStore`] and the peer's handle through the
//! [`DeviceRegistry`], then writes to the peer's outbound channel with no
//! lock held.

use std::sync::Arc;

use axum::extract::ws::Message;
use fluxsend_proto::codec;
use fluxsend_proto::device::DeviceId;
use fluxsend_proto::message::{ErrorCode, ServerMessage};
use fluxsend_proto::room::{RoomCode, RoomStatus};

use crate::devices::{DeviceRegistry, TransportError};
use crate::rooms::RoomStore;

/// Reasons a payload was not forwarded.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The sender does not occupy a room.
    #[error("not in a room")]
    NoRoom,
    /// The room has not finished its handshake.
    #[error("room is {0}, not connected")]
    NotConnected(RoomStatus),
    /// The room has no other occupant.
    #[error("no peer in room")]
    NoPeer,
    /// The peer id is no longer registered.
    #[error("peer is not registered")]
    PeerOffline,
    /// The peer connection is closing.
    #[error("peer connection is not writable")]
    PeerNotWritable,
    /// Writing to the peer failed.
    #[error("peer unstable: {0}")]
    Transport(#[from] TransportError),
}

impl RelayError {
    /// Error code reported to the sender.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NoRoom | Self::NotConnected(_) => ErrorCode::NotConnected,
            Self::NoPeer | Self::PeerOffline => ErrorCode::PeerUnavailable,
            Self::PeerNotWritable | Self::Transport(_) => ErrorCode::PeerUnstable,
        }
    }
}

/// Forwards frames between paired devices.
#[derive(Clone)]
pub struct Relay {
    rooms: Arc<RoomStore>,
    devices: Arc<DeviceRegistry>,
}

impl Relay {
    /// Creates a relay over shared stores.
    #[must_use]
    pub const fn new(rooms: Arc<RoomStore>, devices: Arc<DeviceRegistry>) -> Self {
        Self { rooms, devices }
    }

    /// Forwards `payload` unchanged to the sender's peer.
    ///
    /// On success the room's activity and transfer count are updated and the
    /// peer id is returned. Nothing is mutated on failure.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError`] if the sender has no connected room or the
    /// peer cannot be written to.
    pub fn forward(&self, sender: &DeviceId, payload: Message) -> Result<DeviceId, RelayError> {
        let room = self.rooms.get_by_device(sender).ok_or(RelayError::NoRoom)?;
        if room.status() != RoomStatus::Connected {
            return Err(RelayError::NotConnected(room.status()));
        }
        let peer_id = room.peer_of(sender).ok_or(RelayError::NoPeer)?;
        let peer = self.devices.get(&peer_id).ok_or(RelayError::PeerOffline)?;
        if !peer.connection.is_open() {
            return Err(RelayError::PeerNotWritable);
        }
        peer.connection.send(payload)?;
        self.rooms.record_transfer(room.code());
        Ok(peer_id)
    }

    /// Like [`Relay::forward`], but reports failures back to the sender as
    /// an `error` message.
    ///
    /// # Errors
    ///
    /// Returns the [`RelayError`] after it has been reported.
    pub fn relay(&self, sender: &DeviceId, payload: Message) -> Result<DeviceId, RelayError> {
        self.forward(sender, payload).inspect_err(|e| {
            tracing::warn!(device_id = %sender, error = %e, "relay refused");
            self.send_to(sender, &ServerMessage::error(e.code(), e.to_string()));
        })
    }

    /// Encodes a server message and relays it to the sender's peer.
    ///
    /// # Errors
    ///
    /// See [`Relay::relay`].
    pub fn relay_message(
        &self,
        sender: &DeviceId,
        msg: &ServerMessage,
    ) -> Result<DeviceId, RelayError> {
        match codec::encode(msg) {
            Ok(text) => self.relay(sender, Message::Text(text.into())),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode relayed message");
                let err = RelayError::Transport(TransportError::Encode(e));
                self.send_to(sender, &ServerMessage::error(ErrorCode::InternalError, err.to_string()));
                Err(err)
            }
        }
    }

    /// Sends `payload` to every occupant of `code` except `exclude`.
    ///
    /// Best effort: failures are logged and skipped. Returns the number of
    /// occupants reached.
    pub fn broadcast(&self, code: &RoomCode, payload: &Message, exclude: Option<&DeviceId>) -> usize {
        let Some(room) = self.rooms.get_by_id(code) else {
            return 0;
        };
        self.deliver_all(&room.occupants(), payload, exclude)
    }

    /// Encodes a server message and broadcasts it to a room.
    pub fn broadcast_message(
        &self,
        code: &RoomCode,
        msg: &ServerMessage,
        exclude: Option<&DeviceId>,
    ) -> usize {
        match codec::encode(msg) {
            Ok(text) => self.broadcast(code, &Message::Text(text.into()), exclude),
            Err(e) => {
                tracing::error!(room_id = %code, error = %e, "failed to encode broadcast");
                0
            }
        }
    }

    /// Sends `payload` to each listed device except `exclude`.
    pub fn deliver_all(
        &self,
        recipients: &[DeviceId],
        payload: &Message,
        exclude: Option<&DeviceId>,
    ) -> usize {
        let mut delivered = 0;
        for id in recipients.iter().filter(|id| Some(*id) != exclude) {
            let Some(device) = self.devices.get(id) else {
                tracing::debug!(device_id = %id, "broadcast recipient not registered");
                continue;
            };
            match device.connection.send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(device_id = %id, error = %e, "broadcast delivery failed"),
            }
        }
        delivered
    }

    /// Sends a server message straight to one device.
    ///
    /// Returns `false` if the device is unknown or the write failed.
    pub fn send_to(&self, device: &DeviceId, msg: &ServerMessage) -> bool {
        let Some(target) = self.devices.get(device) else {
            return false;
        };
        match target.connection.send_message(msg) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(device_id = %device, error = %e, "direct send failed");
                false
            }
        }
    }
}
