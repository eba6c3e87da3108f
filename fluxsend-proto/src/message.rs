//! Wire format message types for the Fluxsend relay protocol.
//!
//! Text frames are JSON objects discriminated by a kebab-case `type` field,
//! with camelCase field names. Clients speak the request types in this
//! module; the server answers with [`ServerMessage`]. File-transfer messages
//! are not modelled here at all: the relay forwards them byte-for-byte.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::device::DeviceId;
use crate::room::{Role, RoomCode, RoomToken};

/// Maximum size of a single structured (text) frame, 10 MiB.
pub const MAX_TEXT_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Maximum size of a single binary chunk, 64 MiB.
pub const MAX_BINARY_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Maximum `text-share` payload, 1 MiB.
pub const MAX_TEXT_SHARE_SIZE: usize = 1024 * 1024;

/// Maximum `clipboard-share` payload, 512 KiB.
pub const MAX_CLIPBOARD_SIZE: usize = 512 * 1024;

/// Normal closure, used after `graceful-disconnect`.
pub const CLOSE_NORMAL: u16 = 1000;

/// The relay is shutting down.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// A message that needs an authenticated connection arrived first.
pub const CLOSE_UNAUTHORIZED: u16 = 4001;

/// No inbound activity within the liveness ceiling.
pub const CLOSE_KEEPALIVE_TIMEOUT: u16 = 4002;

/// The peer vanished while the join handshake was pending.
pub const CLOSE_HANDSHAKE_FAILED: u16 = 4003;

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// The `type` discriminator of an inbound client frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Open a new room as host.
    CreateRoom,
    /// Join an existing room as guest.
    JoinRoom,
    /// Acknowledge reachability during the handshake.
    PeerReady,
    /// Share a text snippet.
    TextShare,
    /// Share clipboard contents.
    ClipboardShare,
    /// Opaque key material for end-to-end encryption.
    KeyExchange,
    /// File transfer negotiation and data messages, relayed untouched.
    FileOffer,
    /// See [`MessageKind::FileOffer`].
    FileAccept,
    /// See [`MessageKind::FileOffer`].
    FileReject,
    /// See [`MessageKind::FileOffer`].
    FileMeta,
    /// Text-framed file chunk.
    FileChunk,
    /// See [`MessageKind::FileOffer`].
    FileComplete,
    /// Flow control for an ongoing transfer.
    TransferPause,
    /// See [`MessageKind::TransferPause`].
    TransferResume,
    /// Client is leaving on purpose.
    GracefulDisconnect,
    /// Keepalive reply.
    Pong,
    /// Anything this server version does not know.
    Other(String),
}

impl MessageKind {
    /// Maps a wire discriminator to a kind.
    #[must_use]
    pub fn from_type(ty: &str) -> Self {
        match ty {
            "create-room" => Self::CreateRoom,
            "join-room" => Self::JoinRoom,
            "peer-ready" => Self::PeerReady,
            "text-share" => Self::TextShare,
            "clipboard-share" => Self::ClipboardShare,
            "key-exchange" => Self::KeyExchange,
            "file-offer" => Self::FileOffer,
            "file-accept" => Self::FileAccept,
            "file-reject" => Self::FileReject,
            "file-meta" => Self::FileMeta,
            "file-chunk" => Self::FileChunk,
            "file-complete" => Self::FileComplete,
            "transfer-pause" => Self::TransferPause,
            "transfer-resume" => Self::TransferResume,
            "graceful-disconnect" => Self::GracefulDisconnect,
            "pong" => Self::Pong,
            other => Self::Other(other.to_string()),
        }
    }

    /// Returns the wire discriminator.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::CreateRoom => "create-room",
            Self::JoinRoom => "join-room",
            Self::PeerReady => "peer-ready",
            Self::TextShare => "text-share",
            Self::ClipboardShare => "clipboard-share",
            Self::KeyExchange => "key-exchange",
            Self::FileOffer => "file-offer",
            Self::FileAccept => "file-accept",
            Self::FileReject => "file-reject",
            Self::FileMeta => "file-meta",
            Self::FileChunk => "file-chunk",
            Self::FileComplete => "file-complete",
            Self::TransferPause => "transfer-pause",
            Self::TransferResume => "transfer-resume",
            Self::GracefulDisconnect => "graceful-disconnect",
            Self::Pong => "pong",
            Self::Other(ty) => ty,
        }
    }

    /// Whether this kind authenticates a connection.
    #[must_use]
    pub const fn is_authenticating(&self) -> bool {
        matches!(self, Self::CreateRoom | Self::JoinRoom)
    }

    /// Whether the relay forwards this kind verbatim without inspecting it.
    #[must_use]
    pub const fn is_opaque(&self) -> bool {
        matches!(
            self,
            Self::FileOffer
                | Self::FileAccept
                | Self::FileReject
                | Self::FileMeta
                | Self::FileChunk
                | Self::FileComplete
                | Self::TransferPause
                | Self::TransferResume
                | Self::Other(_)
        )
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of a `create-room` request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    /// Display name for the host device.
    #[serde(default)]
    pub device_name: Option<String>,
}

/// Body of a `join-room` request.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomRequest {
    /// Code of the room to join.
    #[serde(default)]
    pub room_id: Option<String>,
    /// Secret from the host's share link. Manual entry omits it.
    #[serde(default)]
    pub token: Option<String>,
    /// Display name for the guest device.
    #[serde(default)]
    pub device_name: Option<String>,
    /// Optional inline key material forwarded to the host.
    #[serde(default)]
    pub encryption_key: Option<Value>,
}

/// Body of a `text-share` request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TextShareRequest {
    /// Shared text.
    pub text: String,
}

/// Body of a `clipboard-share` request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClipboardShareRequest {
    /// Clipboard contents.
    pub content: String,
}

/// Body of a `key-exchange` request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct KeyExchangeRequest {
    /// Opaque key payload.
    pub key: Value,
}

/// Body of a `graceful-disconnect` request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct GracefulDisconnectRequest {
    /// Optional human-readable reason.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Machine-readable error category carried by [`ServerMessage::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// Malformed frame or missing/invalid field.
    InvalidMessage,
    /// Join rejected. Deliberately does not say why.
    InvalidRoom,
    /// Connection already belongs to a room.
    AlreadyInRoom,
    /// Payload exceeds a configured ceiling.
    PayloadTooLarge,
    /// Per-minute message budget exhausted.
    RateLimited,
    /// Sender is not in a connected room.
    NotConnected,
    /// Peer is missing or not registered.
    PeerUnavailable,
    /// Peer connection is closing or the write failed.
    PeerUnstable,
    /// Unexpected server fault while dispatching.
    InternalError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InvalidMessage => "invalid-message",
            Self::InvalidRoom => "invalid-room",
            Self::AlreadyInRoom => "already-in-room",
            Self::PayloadTooLarge => "payload-too-large",
            Self::RateLimited => "rate-limited",
            Self::NotConnected => "not-connected",
            Self::PeerUnavailable => "peer-unavailable",
            Self::PeerUnstable => "peer-unstable",
            Self::InternalError => "internal-error",
        };
        f.write_str(s)
    }
}

/// Messages originated by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Reply to `create-room`.
    #[serde(rename_all = "camelCase")]
    RoomCreated {
        /// Shareable room code.
        room_id: RoomCode,
        /// Secret for share links.
        token: RoomToken,
        /// Always [`Role::Host`].
        role: Role,
        /// Identity assigned to this connection.
        device_id: DeviceId,
        /// Seconds until an unjoined room expires.
        expires_in_secs: u64,
    },

    /// Sent to both sides after a successful join.
    #[serde(rename_all = "camelCase")]
    PeerJoining {
        /// Room being joined.
        room_id: RoomCode,
        /// The other side's identity.
        peer_id: DeviceId,
        /// The other side's display name.
        peer_name: String,
        /// The recipient's own role.
        role: Role,
    },

    /// Handshake complete; payload relay is now enabled.
    #[serde(rename_all = "camelCase")]
    ConnectionEstablished {
        /// The connected room.
        room_id: RoomCode,
        /// The other side's identity.
        peer_id: DeviceId,
        /// The other side's display name.
        peer_name: String,
    },

    /// Text relayed from the peer.
    TextShare {
        /// Shared text.
        text: String,
        /// Sender identity.
        from: DeviceId,
        /// Server receive time.
        timestamp: Timestamp,
    },

    /// Clipboard contents relayed from the peer.
    ClipboardShare {
        /// Clipboard contents.
        content: String,
        /// Sender identity.
        from: DeviceId,
        /// Server receive time.
        timestamp: Timestamp,
    },

    /// Opaque key material relayed from the peer.
    KeyExchange {
        /// Key payload, untouched.
        key: Value,
        /// Sender identity.
        from: DeviceId,
    },

    /// The peer announced it is leaving.
    #[serde(rename_all = "camelCase")]
    PeerDisconnecting {
        /// Departing device.
        peer_id: DeviceId,
        /// Reason given by the departing client, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// The peer's connection is gone.
    #[serde(rename_all = "camelCase")]
    PeerDisconnected {
        /// Departed device.
        peer_id: DeviceId,
        /// Its display name.
        peer_name: String,
    },

    /// The room was removed by the expiry sweep.
    #[serde(rename_all = "camelCase")]
    RoomExpired {
        /// Expired room.
        room_id: RoomCode,
    },

    /// Keepalive probe; clients answer with `pong`.
    Ping {
        /// Server send time.
        timestamp: Timestamp,
    },

    /// Request could not be honoured.
    Error {
        /// Error category.
        code: ErrorCode,
        /// Human-readable description.
        message: String,
    },
}

impl ServerMessage {
    /// Builds an [`ServerMessage::Error`].
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}
