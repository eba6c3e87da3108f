//! Room identity types: shareable codes, secret tokens, roles and status.
//!
//! Room codes are meant to be read aloud or typed by hand, so they are drawn
//! from an alphabet without visually confusable characters (`0`/`O`, `1`/`I`).
//! Tokens use the same alphabet but are longer and only ever leave the
//! server in the `room-created` reply.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Uppercase letters and digits minus `0`, `O`, `1` and `I`.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of a freshly generated room code.
pub const ROOM_CODE_LEN: usize = 6;

/// Maximum number of suffix characters appended on persistent collisions.
pub const ROOM_CODE_MAX_SUFFIX: usize = 4;

/// Length of a room token.
pub const ROOM_TOKEN_LEN: usize = 12;

fn random_string(rng: &mut impl Rng, len: usize) -> String {
    (0..len)
        .map(|_| char::from(CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())]))
        .collect()
}

fn in_alphabet(c: char) -> bool {
    c.is_ascii() && CODE_ALPHABET.contains(&(c as u8))
}

/// Short human-shareable room identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomCode(String);

impl RoomCode {
    /// Generates a random six-character code.
    #[must_use]
    pub fn generate(rng: &mut impl Rng) -> Self {
        Self(random_string(rng, ROOM_CODE_LEN))
    }

    /// Parses user input into a room code.
    ///
    /// Input is trimmed and uppercased, so `" x7k2qm"` parses as `X7K2QM`.
    /// Returns `None` if the length is out of range or any character falls
    /// outside [`CODE_ALPHABET`].
    #[must_use]
    pub fn parse(input: &str) -> Option<Self> {
        let normalized = input.trim().to_ascii_uppercase();
        let len = normalized.chars().count();
        if !(ROOM_CODE_LEN..=ROOM_CODE_LEN + ROOM_CODE_MAX_SUFFIX).contains(&len) {
            return None;
        }
        normalized.chars().all(in_alphabet).then_some(Self(normalized))
    }

    /// Returns a copy of this code with a suffix derived from `seed`.
    ///
    /// Used when random generation keeps colliding with live rooms. The
    /// suffix is [`ROOM_CODE_MAX_SUFFIX`] alphabet characters.
    #[must_use]
    pub fn with_suffix(&self, seed: u64) -> Self {
        let base = CODE_ALPHABET.len() as u64;
        let mut value = seed;
        let mut code = self.0.clone();
        for _ in 0..ROOM_CODE_MAX_SUFFIX {
            // base is 32, so the remainder always indexes the alphabet
            #[allow(clippy::cast_possible_truncation)]
            let idx = (value % base) as usize;
            code.push(char::from(CODE_ALPHABET[idx]));
            value /= base;
        }
        Self(code)
    }

    /// Returns the code as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Secret that proves a joiner obtained the code from the host.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomToken(String);

impl RoomToken {
    /// Generates a random twelve-character token.
    #[must_use]
    pub fn generate(rng: &mut impl Rng) -> Self {
        Self(random_string(rng, ROOM_TOKEN_LEN))
    }

    /// Compares a client-supplied token without short-circuiting on the
    /// first differing byte.
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        let expected = self.0.as_bytes();
        let given = candidate.as_bytes();
        if expected.len() != given.len() {
            return false;
        }
        expected
            .iter()
            .zip(given)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    /// Returns the token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for RoomToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RoomToken(<redacted>)")
    }
}

/// Which side of a room a device is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The device that created the room.
    Host,
    /// The device that joined with the code.
    Guest,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Guest => write!(f, "guest"),
        }
    }
}

/// Externally visible room status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    /// Host alone, waiting for a guest.
    Waiting,
    /// Guest joined, handshake in progress.
    Connecting,
    /// Both sides confirmed; payload relay enabled.
    Connected,
}

impl std::fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}
