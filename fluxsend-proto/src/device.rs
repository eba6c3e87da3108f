//! Device identity types.
//!
//! Every accepted connection is assigned a fresh [`DeviceId`]. The relay
//! never trusts a client-supplied identity; the id is server-minted and
//! echoed to peers so they can attribute forwarded messages.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum display name length in characters. Longer names are truncated.
pub const MAX_DISPLAY_NAME_CHARS: usize = 50;

/// Server-assigned identity for one connection, based on UUID v7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(Uuid);

impl DeviceId {
    /// Creates a new time-ordered device identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `DeviceId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Public view of a registered device, as reported to the stats surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    /// Device identity.
    pub id: DeviceId,
    /// Display name chosen by the client.
    pub name: String,
}

/// Normalizes a client-supplied display name.
///
/// Surrounding whitespace is trimmed and the result is truncated to
/// [`MAX_DISPLAY_NAME_CHARS`] characters. Returns `None` when nothing is
/// left, since an empty name is a protocol error.
#[must_use]
pub fn normalize_display_name(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let truncated: String = trimmed.chars().take(MAX_DISPLAY_NAME_CHARS).collect();
    Some(truncated.trim_end().to_string())
}
