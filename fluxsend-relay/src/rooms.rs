//! Room store for the relay server.
//!
//! Maintains the in-memory table of pairing rooms keyed by [`RoomCode`].
//! A room is created by a host, joined by at most one guest, and promoted to
//! `connected` once the handshake completes. Every operation runs under a
//! single mutex so check-then-act sequences (join's slot and token checks,
//! departure's host/guest split) cannot interleave with each other or with
//! the reaper.
//!
//! Rooms are ephemeral and lost on restart, same as the device registry.

use std::collections::HashMap;
use std::time::Duration;

use fluxsend_proto::device::DeviceId;
use fluxsend_proto::message::Timestamp;
use fluxsend_proto::room::{Role, RoomCode, RoomStatus, RoomToken};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

/// Random code draws before falling back to a suffixed code.
const MAX_CODE_ATTEMPTS: usize = 10;

/// Expiry windows applied at each stage of a room's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomTimeouts {
    /// Lifetime of a room nobody has joined (also applied after a guest leaves).
    pub waiting: Duration,
    /// Window for a joined room to finish its handshake; also the inactivity
    /// ceiling for `connecting` rooms.
    pub handshake: Duration,
    /// Active-transfer window; also the inactivity ceiling for `connected`
    /// rooms.
    pub active: Duration,
}

impl Default for RoomTimeouts {
    fn default() -> Self {
        Self {
            waiting: Duration::from_secs(5 * 60),
            handshake: Duration::from_secs(2 * 60),
            active: Duration::from_secs(30 * 60),
        }
    }
}

/// Who is in a room besides the host, and how far the handshake got.
///
/// A waiting room has no guest; a guest implies `connecting` or
/// `connected`. Readiness only exists while connecting, and a connected room
/// counts both sides as ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupancy {
    /// Host alone.
    Waiting,
    /// Guest joined; handshake pending.
    Connecting {
        /// Guest device.
        guest: DeviceId,
        /// Host sent `peer-ready`.
        host_ready: bool,
        /// Guest sent `peer-ready`.
        guest_ready: bool,
    },
    /// Handshake complete.
    Connected {
        /// Guest device.
        guest: DeviceId,
    },
}

/// A pairing room.
#[derive(Debug, Clone)]
pub struct Room {
    code: RoomCode,
    token: RoomToken,
    host: DeviceId,
    occupancy: Occupancy,
    created_at: Instant,
    last_activity: Instant,
    expires_at: Instant,
    transfer_count: u64,
}

impl Room {
    fn new(code: RoomCode, token: RoomToken, host: DeviceId, now: Instant, ttl: Duration) -> Self {
        Self {
            code,
            token,
            host,
            occupancy: Occupancy::Waiting,
            created_at: now,
            last_activity: now,
            expires_at: now + ttl,
            transfer_count: 0,
        }
    }

    /// Room code.
    #[must_use]
    pub const fn code(&self) -> &RoomCode {
        &self.code
    }

    /// Join secret.
    #[must_use]
    pub const fn token(&self) -> &RoomToken {
        &self.token
    }

    /// Device that created the room.
    #[must_use]
    pub const fn host(&self) -> DeviceId {
        self.host
    }

    /// Current occupancy and handshake progress.
    #[must_use]
    pub const fn occupancy(&self) -> Occupancy {
        self.occupancy
    }

    /// Guest device, if any.
    #[must_use]
    pub const fn guest(&self) -> Option<DeviceId> {
        match self.occupancy {
            Occupancy::Waiting => None,
            Occupancy::Connecting { guest, .. } | Occupancy::Connected { guest } => Some(guest),
        }
    }

    /// Externally visible status.
    #[must_use]
    pub const fn status(&self) -> RoomStatus {
        match self.occupancy {
            Occupancy::Waiting => RoomStatus::Waiting,
            Occupancy::Connecting { .. } => RoomStatus::Connecting,
            Occupancy::Connected { .. } => RoomStatus::Connected,
        }
    }

    /// Host first, then the guest if present.
    #[must_use]
    pub fn occupants(&self) -> Vec<DeviceId> {
        let mut ids = vec![self.host];
        ids.extend(self.guest());
        ids
    }

    /// Devices that have confirmed reachability.
    #[must_use]
    pub fn ready_peers(&self) -> Vec<DeviceId> {
        match self.occupancy {
            Occupancy::Waiting => Vec::new(),
            Occupancy::Connecting {
                guest,
                host_ready,
                guest_ready,
            } => {
                let mut ids = Vec::with_capacity(2);
                if host_ready {
                    ids.push(self.host);
                }
                if guest_ready {
                    ids.push(guest);
                }
                ids
            }
            Occupancy::Connected { guest } => vec![self.host, guest],
        }
    }

    /// Whether `id` occupies this room.
    #[must_use]
    pub fn contains(&self, id: &DeviceId) -> bool {
        self.host == *id || self.guest().as_ref() == Some(id)
    }

    /// The role `id` plays in this room.
    #[must_use]
    pub fn role_of(&self, id: &DeviceId) -> Option<Role> {
        if self.host == *id {
            Some(Role::Host)
        } else if self.guest().as_ref() == Some(id) {
            Some(Role::Guest)
        } else {
            None
        }
    }

    /// The other occupant, seen from `id`.
    #[must_use]
    pub fn peer_of(&self, id: &DeviceId) -> Option<DeviceId> {
        match self.role_of(id)? {
            Role::Host => self.guest(),
            Role::Guest => Some(self.host),
        }
    }

    /// When the room was created.
    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Last join, handshake, or relay activity.
    #[must_use]
    pub const fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Current expiry deadline.
    #[must_use]
    pub const fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Number of payloads relayed through this room.
    #[must_use]
    pub const fn transfer_count(&self) -> u64 {
        self.transfer_count
    }

    /// Whether the expiry deadline has passed.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Whether the reaper should delete this room.
    fn is_abandoned(&self, now: Instant, timeouts: &RoomTimeouts) -> bool {
        let idle = now.saturating_duration_since(self.last_activity);
        match self.occupancy {
            Occupancy::Waiting => self.is_expired(now),
            Occupancy::Connecting { .. } => idle > timeouts.handshake,
            Occupancy::Connected { .. } => idle > timeouts.active,
        }
    }
}

/// Why a join was refused. Never shown to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum JoinRejected {
    /// No live room has this code.
    #[error("room not found")]
    UnknownRoom,
    /// The room expired; it has been deleted.
    #[error("room expired")]
    Expired,
    /// A guest already occupies the room.
    #[error("room is full")]
    Full,
    /// The host tried to join its own room.
    #[error("host cannot join its own room")]
    SelfJoin,
    /// The joining device already occupies another room.
    #[error("device already occupies a room")]
    AlreadyInRoom,
    /// A token was supplied and did not match.
    #[error("token mismatch")]
    TokenMismatch,
}

/// Which path is trying to finish the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeTrigger {
    /// The fixed handshake delay elapsed with both connections open.
    Timer,
    /// A `peer-ready` acknowledgment arrived.
    PeerReady,
}

/// Result of [`RoomStore::try_complete_handshake`].
#[derive(Debug, Clone)]
pub enum HandshakeOutcome {
    /// This call promoted the room to `connected`.
    Completed(Room),
    /// The other path already completed the handshake.
    AlreadyConnected,
    /// Waiting for the other side's `peer-ready`.
    Pending,
    /// The room is gone or its guest changed since the handshake started.
    Stale,
}

/// What happened to a room when a device left it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    /// Affected room.
    pub code: RoomCode,
    /// Role the departing device had.
    pub role: Role,
    /// Occupant still connected to the room, to be notified.
    pub remaining: Option<DeviceId>,
    /// Whether the room was deleted.
    pub destroyed: bool,
}

/// Per-room line of the stats snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomDetail {
    /// Room code.
    pub room_id: RoomCode,
    /// Current status.
    pub status: RoomStatus,
    /// Number of occupants (1 or 2).
    pub occupants: usize,
    /// Seconds since creation.
    pub age_secs: u64,
    /// Seconds since last activity.
    pub inactive_secs: u64,
    /// Payloads relayed so far.
    pub transfer_count: u64,
}

/// Read-only snapshot for the stats surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    /// All live rooms.
    pub total_rooms: usize,
    /// Rooms in `connected` state.
    pub active_connections: usize,
    /// Rooms in `waiting` state.
    pub waiting_rooms: usize,
    /// Rooms in `connecting` state.
    pub connecting_rooms: usize,
    /// Per-room detail.
    pub rooms: Vec<RoomDetail>,
}

/// Draws codes until one is free, then falls back to suffixed codes.
fn allocate_code(
    taken: impl Fn(&RoomCode) -> bool,
    mut generate: impl FnMut() -> RoomCode,
) -> RoomCode {
    for _ in 0..MAX_CODE_ATTEMPTS {
        let candidate = generate();
        if !taken(&candidate) {
            return candidate;
        }
    }
    let mut seed = Timestamp::now().as_millis();
    loop {
        let candidate = generate().with_suffix(seed);
        if !taken(&candidate) {
            tracing::warn!(room_id = %candidate, "room code space congested, using suffixed code");
            return candidate;
        }
        seed = seed.wrapping_add(1);
    }
}

/// In-memory table of pairing rooms.
pub struct RoomStore {
    rooms: Mutex<HashMap<RoomCode, Room>>,
    timeouts: RoomTimeouts,
}

impl Default for RoomStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomStore {
    /// Creates an empty store with default timeouts.
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeouts(RoomTimeouts::default())
    }

    /// Creates an empty store with custom timeouts.
    #[must_use]
    pub fn with_timeouts(timeouts: RoomTimeouts) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            timeouts,
        }
    }

    /// Configured timeouts.
    #[must_use]
    pub const fn timeouts(&self) -> RoomTimeouts {
        self.timeouts
    }

    /// Creates a room hosted by `host`. Always succeeds.
    pub fn create_room(&self, host: DeviceId) -> Room {
        let now = Instant::now();
        let mut rooms = self.rooms.lock();
        let mut rng = rand::rng();
        let code = allocate_code(|c| rooms.contains_key(c), || RoomCode::generate(&mut rng));
        let token = RoomToken::generate(&mut rng);
        let room = Room::new(code.clone(), token, host, now, self.timeouts.waiting);
        rooms.insert(code, room.clone());
        drop(rooms);
        room
    }

    /// Adds `guest` to the room with `code`.
    ///
    /// A missing token is accepted; a supplied token must match.
    ///
    /// # Errors
    ///
    /// Returns [`JoinRejected`] describing why the join failed. An expired
    /// room is deleted as a side effect.
    pub fn join_room(
        &self,
        code: &RoomCode,
        token: Option<&str>,
        guest: DeviceId,
    ) -> Result<Room, JoinRejected> {
        let now = Instant::now();
        let mut rooms = self.rooms.lock();

        let room = rooms.get(code).ok_or(JoinRejected::UnknownRoom)?;
        if room.is_expired(now) {
            rooms.remove(code);
            return Err(JoinRejected::Expired);
        }
        if room.guest().is_some() {
            return Err(JoinRejected::Full);
        }
        if room.host == guest {
            return Err(JoinRejected::SelfJoin);
        }
        if token.is_some_and(|t| !room.token.matches(t)) {
            return Err(JoinRejected::TokenMismatch);
        }
        if rooms.values().any(|r| r.contains(&guest)) {
            return Err(JoinRejected::AlreadyInRoom);
        }

        let room = rooms.get_mut(code).ok_or(JoinRejected::UnknownRoom)?;
        room.occupancy = Occupancy::Connecting {
            guest,
            host_ready: false,
            guest_ready: false,
        };
        room.last_activity = now;
        room.expires_at = now + self.timeouts.handshake;
        Ok(room.clone())
    }

    /// Promotes a joined room to `connected`.
    ///
    /// Returns the updated room, or `None` if the room does not exist or has
    /// no guest.
    pub fn mark_connected(&self, code: &RoomCode) -> Option<Room> {
        let now = Instant::now();
        let mut rooms = self.rooms.lock();
        let room = rooms.get_mut(code)?;
        let guest = room.guest()?;
        room.occupancy = Occupancy::Connected { guest };
        room.last_activity = now;
        room.expires_at = now + self.timeouts.active;
        Some(room.clone())
    }

    /// Records a `peer-ready` from `device`.
    ///
    /// Returns the room after the update, or `None` if the device is not in
    /// a room with a guest.
    pub fn mark_ready(&self, device: &DeviceId) -> Option<Room> {
        let mut rooms = self.rooms.lock();
        let room = rooms.values_mut().find(|r| r.contains(device))?;
        let is_host = room.host == *device;
        match &mut room.occupancy {
            Occupancy::Waiting => return None,
            Occupancy::Connecting {
                host_ready,
                guest_ready,
                ..
            } => {
                if is_host {
                    *host_ready = true;
                } else {
                    *guest_ready = true;
                }
            }
            Occupancy::Connected { .. } => {}
        }
        Some(room.clone())
    }

    /// Completes the handshake for `code` if `trigger` allows it.
    ///
    /// Both the handshake timer and the `peer-ready` handler call this. The
    /// first caller to succeed gets [`HandshakeOutcome::Completed`]; later
    /// callers see [`HandshakeOutcome::AlreadyConnected`] and must not
    /// announce the connection again. `expected_guest` guards against a
    /// timer firing after its guest left and another joined.
    pub fn try_complete_handshake(
        &self,
        code: &RoomCode,
        expected_guest: DeviceId,
        trigger: HandshakeTrigger,
    ) -> HandshakeOutcome {
        let mut rooms = self.rooms.lock();
        let Some(room) = rooms.get_mut(code) else {
            return HandshakeOutcome::Stale;
        };
        let occupancy = room.occupancy;
        match occupancy {
            Occupancy::Connecting {
                guest,
                host_ready,
                guest_ready,
            } if guest == expected_guest => {
                if trigger == HandshakeTrigger::PeerReady && !(host_ready && guest_ready) {
                    return HandshakeOutcome::Pending;
                }
                let now = Instant::now();
                room.occupancy = Occupancy::Connected { guest };
                room.last_activity = now;
                room.expires_at = now + self.timeouts.active;
                HandshakeOutcome::Completed(room.clone())
            }
            Occupancy::Connected { guest } if guest == expected_guest => {
                HandshakeOutcome::AlreadyConnected
            }
            _ => HandshakeOutcome::Stale,
        }
    }

    /// Finds the room `device` occupies. Linear in the number of rooms.
    #[must_use]
    pub fn get_by_device(&self, device: &DeviceId) -> Option<Room> {
        self.rooms
            .lock()
            .values()
            .find(|r| r.contains(device))
            .cloned()
    }

    /// Looks up a room by code.
    #[must_use]
    pub fn get_by_id(&self, code: &RoomCode) -> Option<Room> {
        self.rooms.lock().get(code).cloned()
    }

    /// Counts a relayed payload and refreshes the room's activity.
    ///
    /// Returns `false` if the room no longer exists.
    pub fn record_transfer(&self, code: &RoomCode) -> bool {
        let now = Instant::now();
        let mut rooms = self.rooms.lock();
        let Some(room) = rooms.get_mut(code) else {
            return false;
        };
        room.transfer_count += 1;
        room.last_activity = now;
        if room.status() == RoomStatus::Connected {
            room.expires_at = now + self.timeouts.active;
        }
        true
    }

    /// Removes `device` from every room it occupies.
    ///
    /// A departing host destroys the room even if a guest is present. A
    /// departing guest resets the room to `waiting` with a fresh waiting
    /// expiry so the host can accept a new join.
    pub fn remove_device(&self, device: &DeviceId) -> Vec<Departure> {
        let now = Instant::now();
        let mut rooms = self.rooms.lock();
        let mut departures = Vec::new();

        for room in rooms.values_mut() {
            match room.role_of(device) {
                Some(Role::Host) => departures.push(Departure {
                    code: room.code.clone(),
                    role: Role::Host,
                    remaining: room.guest(),
                    destroyed: true,
                }),
                Some(Role::Guest) => {
                    room.occupancy = Occupancy::Waiting;
                    room.last_activity = now;
                    room.expires_at = now + self.timeouts.waiting;
                    departures.push(Departure {
                        code: room.code.clone(),
                        role: Role::Guest,
                        remaining: Some(room.host),
                        destroyed: false,
                    });
                }
                None => {}
            }
        }

        for departure in departures.iter().filter(|d| d.destroyed) {
            rooms.remove(&departure.code);
        }
        drop(rooms);

        if departures.len() > 1 {
            tracing::warn!(device_id = %device, rooms = departures.len(), "device occupied several rooms");
        }
        departures
    }

    /// Deletes rooms the expiry policy considers abandoned, as of `now`.
    ///
    /// Waiting rooms go once their expiry passes, connecting rooms after the
    /// handshake inactivity ceiling, connected rooms after the active
    /// inactivity ceiling.
    pub fn reap_expired_at(&self, now: Instant) -> Vec<Room> {
        let mut rooms = self.rooms.lock();
        let expired: Vec<RoomCode> = rooms
            .values()
            .filter(|r| r.is_abandoned(now, &self.timeouts))
            .map(|r| r.code.clone())
            .collect();
        expired.iter().filter_map(|code| rooms.remove(code)).collect()
    }

    /// Deletes abandoned rooms as of now.
    pub fn reap_expired(&self) -> Vec<Room> {
        self.reap_expired_at(Instant::now())
    }

    /// Snapshot of room counts and per-room detail.
    #[must_use]
    pub fn stats(&self) -> RoomStats {
        let now = Instant::now();
        let rooms = self.rooms.lock();
        let mut stats = RoomStats {
            total_rooms: rooms.len(),
            active_connections: 0,
            waiting_rooms: 0,
            connecting_rooms: 0,
            rooms: Vec::with_capacity(rooms.len()),
        };
        for room in rooms.values() {
            match room.status() {
                RoomStatus::Waiting => stats.waiting_rooms += 1,
                RoomStatus::Connecting => stats.connecting_rooms += 1,
                RoomStatus::Connected => stats.active_connections += 1,
            }
            stats.rooms.push(RoomDetail {
                room_id: room.code.clone(),
                status: room.status(),
                occupants: room.occupants().len(),
                age_secs: now.saturating_duration_since(room.created_at).as_secs(),
                inactive_secs: now.saturating_duration_since(room.last_activity).as_secs(),
                transfer_count: room.transfer_count,
            });
        }
        drop(rooms);
        stats
    }

    /// Number of live rooms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.lock().len()
    }

    /// Whether there are no live rooms.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.lock().is_empty()
    }
}
