//! Device registry: maps a connection identity to its live handle and name.
//!
//! The registry is the only owner of [`Device`] records. Rooms refer to
//! devices by [`DeviceId`] and every sender re-resolves the id here, so a
//! handle is never used after its device was removed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::ws::{CloseFrame, Message};
use fluxsend_proto::codec::{self, CodecError};
use fluxsend_proto::device::{DeviceId, DeviceSummary};
use fluxsend_proto::message::ServerMessage;
use parking_lot::RwLock;
use tokio::sync::mpsc;

/// Errors raised when writing to a connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection is closing or its writer task has exited.
    #[error("connection is closed")]
    Closed,
    /// The outbound message could not be encoded.
    #[error(transparent)]
    Encode(#[from] CodecError),
}

/// Write side of one WebSocket connection.
///
/// Frames are pushed onto an unbounded channel drained by the connection's
/// writer task, so sending never blocks on the network. Clones share the
/// same open/closed flag.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
}

impl ConnectionHandle {
    /// Wraps the sender half of a writer channel.
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            tx,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Creates a handle together with the receiver its writer should drain.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Whether frames sent now can still reach the socket.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Queues a raw frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if the connection is closing.
    pub fn send(&self, msg: Message) -> Result<(), TransportError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.tx.send(msg).map_err(|_| TransportError::Closed)
    }

    /// Encodes and queues a server message as a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if encoding fails or the connection is
    /// closing.
    pub fn send_message(&self, msg: &ServerMessage) -> Result<(), TransportError> {
        let text = codec::encode(msg)?;
        self.send(Message::Text(text.into()))
    }

    /// Queues a close frame and marks the handle closed.
    ///
    /// Returns `false` if the handle was already closed, in which case
    /// nothing is sent.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        if self.open.swap(false, Ordering::AcqRel) {
            let frame = CloseFrame {
                code,
                reason: reason.to_string().into(),
            };
            let _ = self.tx.send(Message::Close(Some(frame)));
            true
        } else {
            false
        }
    }

    /// Marks the handle closed without sending anything.
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }
}

/// A registered device.
#[derive(Debug, Clone)]
pub struct Device {
    /// Identity assigned at connection time.
    pub id: DeviceId,
    /// Display name, already normalized.
    pub name: String,
    /// Write side of the device's connection.
    pub connection: ConnectionHandle,
}

/// Thread-safe table of live devices.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<DeviceId, Device>>,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites the entry for `id`.
    pub fn register(&self, id: DeviceId, connection: ConnectionHandle, name: impl Into<String>) {
        let device = Device {
            id,
            name: name.into(),
            connection,
        };
        self.devices.write().insert(id, device);
    }

    /// Removes the entry for `id`, returning it if present.
    pub fn remove(&self, id: &DeviceId) -> Option<Device> {
        self.devices.write().remove(id)
    }

    /// Looks up a device.
    #[must_use]
    pub fn get(&self, id: &DeviceId) -> Option<Device> {
        self.devices.read().get(id).cloned()
    }

    /// Returns the display name of a device, if registered.
    #[must_use]
    pub fn name_of(&self, id: &DeviceId) -> Option<String> {
        self.devices.read().get(id).map(|d| d.name.clone())
    }

    /// Whether `id` is registered with an open connection.
    #[must_use]
    pub fn is_online(&self, id: &DeviceId) -> bool {
        self.devices
            .read()
            .get(id)
            .is_some_and(|d| d.connection.is_open())
    }

    /// Lists every registered device.
    #[must_use]
    pub fn list(&self) -> Vec<DeviceSummary> {
        self.devices
            .read()
            .values()
            .map(|d| DeviceSummary {
                id: d.id,
                name: d.name.clone(),
            })
            .collect()
    }

    /// Number of registered devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    /// Whether no devices are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Sends a close frame to every registered device.
    pub fn close_all(&self, code: u16, reason: &str) {
        let handles: Vec<(DeviceId, ConnectionHandle)> = self
            .devices
            .read()
            .values()
            .map(|d| (d.id, d.connection.clone()))
            .collect();
        for (id, handle) in handles {
            tracing::info!(device_id = %id, "sending close frame to device");
            handle.close(code, reason);
        }
    }
}
