//! Relay server shell: shared state, HTTP routes, and the room reaper.
//!
//! `/ws` upgrades to a [`session`](crate::session) task per connection.
//! `/health` and `/stats` are read-only views for monitoring and never
//! mutate the stores.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use fluxsend_proto::codec;
use fluxsend_proto::device::DeviceSummary;
use fluxsend_proto::message::{CLOSE_GOING_AWAY, ServerMessage};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::RelayConfig;
use crate::devices::DeviceRegistry;
use crate::relay::Relay;
use crate::rooms::{RoomStats, RoomStore};
use crate::session;

/// Slack the WebSocket layer allows above the binary chunk ceiling, so an
/// oversized chunk reaches the session and gets an error reply.
const FRAME_HEADROOM: usize = 16 * 1024 * 1024;

/// Shared state handed to every session and HTTP handler.
pub struct RelayState {
    /// Live devices.
    pub devices: Arc<DeviceRegistry>,
    /// Pairing rooms.
    pub rooms: Arc<RoomStore>,
    /// Payload forwarding over the two stores.
    pub relay: Relay,
    /// Resolved configuration.
    pub config: RelayConfig,
    started_at: Instant,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates state with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RelayConfig::default())
    }

    /// Creates state using the limits and timers of `config`.
    #[must_use]
    pub fn with_config(config: RelayConfig) -> Self {
        let devices = Arc::new(DeviceRegistry::new());
        let rooms = Arc::new(RoomStore::with_timeouts(config.timing.rooms));
        Self {
            relay: Relay::new(Arc::clone(&rooms), Arc::clone(&devices)),
            devices,
            rooms,
            config,
            started_at: Instant::now(),
        }
    }

    /// Registered devices, for the stats surface.
    #[must_use]
    pub fn list_devices(&self) -> Vec<DeviceSummary> {
        self.devices.list()
    }

    /// Room counts and per-room detail, for the stats surface.
    #[must_use]
    pub fn room_stats(&self) -> RoomStats {
        self.rooms.stats()
    }

    /// Seconds since the state was created.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Runs one reaper sweep and tells remaining occupants their room expired.
    ///
    /// Returns the number of rooms removed.
    pub fn sweep_expired_rooms(&self) -> usize {
        let reaped = self.rooms.reap_expired();
        for room in &reaped {
            tracing::info!(
                room_id = %room.code(),
                status = %room.status(),
                transfers = room.transfer_count(),
                "room expired"
            );
            let notice = ServerMessage::RoomExpired {
                room_id: room.code().clone(),
            };
            match codec::encode(&notice) {
                Ok(text) => {
                    self.relay
                        .deliver_all(&room.occupants(), &Message::Text(text.into()), None);
                }
                Err(e) => tracing::error!(room_id = %room.code(), error = %e, "failed to encode expiry notice"),
            }
        }
        reaped.len()
    }

    /// Sends `1001` to every registered device so sessions wind down.
    pub fn close_all_connections(&self) {
        tracing::info!(devices = self.devices.len(), "closing all connections");
        self.devices.close_all(CLOSE_GOING_AWAY, "server shutting down");
    }
}

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Health {
    status: &'static str,
    uptime_secs: u64,
}

/// Body of `GET /stats`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Stats {
    devices: Vec<DeviceSummary>,
    rooms: RoomStats,
}

/// Builds the axum router over `state`.
pub fn router(state: Arc<RelayState>) -> axum::Router {
    axum::Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

/// Spawns the periodic expiry sweep.
pub fn spawn_reaper(state: Arc<RelayState>) -> JoinHandle<()> {
    let period = state.config.timing.reaper_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let removed = state.sweep_expired_rooms();
            if removed > 0 {
                tracing::debug!(removed, remaining = state.rooms.len(), "reaper sweep done");
            }
        }
    })
}

/// Starts the relay server on the given address and returns the bound address
/// and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay server with a pre-configured [`RelayState`].
///
/// The reaper runs for as long as the server task does.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    let app = router(Arc::clone(&state));

    let handle = tokio::spawn(async move {
        let reaper = spawn_reaper(state);
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
        reaper.abort();
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket session.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    let max_message = state
        .config
        .limits
        .max_binary_chunk
        .saturating_add(FRAME_HEADROOM);
    ws.max_message_size(max_message)
        .max_frame_size(max_message)
        .on_upgrade(move |socket| session::handle_socket(socket, state))
}

async fn health_handler(State(state): State<Arc<RelayState>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        uptime_secs: state.uptime_secs(),
    })
}

async fn stats_handler(State(state): State<Arc<RelayState>>) -> Json<Stats> {
    Json(Stats {
        devices: state.list_devices(),
        rooms: state.room_stats(),
    })
}
