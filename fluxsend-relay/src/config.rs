//! Configuration system for the Fluxsend relay server.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/fluxsend-relay/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;
use std::time::Duration;

use fluxsend_proto::message::{
    MAX_BINARY_CHUNK_SIZE, MAX_CLIPBOARD_SIZE, MAX_TEXT_FRAME_SIZE, MAX_TEXT_SHARE_SIZE,
};

use crate::rooms::RoomTimeouts;

/// Errors that can occur when loading relay configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A value is out of its allowed range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure for the relay.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RelayConfigFile {
    server: ServerFileConfig,
    limits: LimitsFileConfig,
    timing: TimingFileConfig,
}

/// `[server]` section of the relay config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
}

/// `[limits]` section of the relay config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct LimitsFileConfig {
    max_text_frame: Option<usize>,
    max_binary_chunk: Option<usize>,
    max_text_share: Option<usize>,
    max_clipboard: Option<usize>,
    rate_limit_per_minute: Option<u32>,
}

/// `[timing]` section of the relay config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TimingFileConfig {
    handshake_delay_ms: Option<u64>,
    ping_interval_secs: Option<u64>,
    liveness_timeout_secs: Option<u64>,
    reaper_interval_secs: Option<u64>,
    waiting_room_secs: Option<u64>,
    handshake_window_secs: Option<u64>,
    active_window_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the relay server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Fluxsend pairing relay server")]
pub struct RelayCliArgs {
    /// Address to bind the relay server to.
    #[arg(short, long, env = "FLUXSEND_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/fluxsend-relay/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Maximum binary chunk size in bytes.
    #[arg(long)]
    pub max_binary_chunk: Option<usize>,

    /// Text messages allowed per connection per minute.
    #[arg(long)]
    pub rate_limit: Option<u32>,

    /// Delay before a joined room is promoted to connected, in milliseconds.
    #[arg(long)]
    pub handshake_delay_ms: Option<u64>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "FLUXSEND_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Size and rate ceilings enforced per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Largest accepted text frame in bytes.
    pub max_text_frame: usize,
    /// Largest accepted binary chunk in bytes.
    pub max_binary_chunk: usize,
    /// Largest `text-share` payload in bytes.
    pub max_text_share: usize,
    /// Largest `clipboard-share` payload in bytes.
    pub max_clipboard: usize,
    /// Text frames allowed per rate window.
    pub rate_limit_per_minute: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_text_frame: MAX_TEXT_FRAME_SIZE,
            max_binary_chunk: MAX_BINARY_CHUNK_SIZE,
            max_text_share: MAX_TEXT_SHARE_SIZE,
            max_clipboard: MAX_CLIPBOARD_SIZE,
            rate_limit_per_minute: 1000,
        }
    }
}

/// Timer periods for sessions, rooms, and the reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Delay between a join and timer-driven promotion to connected.
    pub handshake_delay: Duration,
    /// Keepalive ping period.
    pub ping_interval: Duration,
    /// Silence after which a connection is terminated.
    pub liveness_timeout: Duration,
    /// Length of the rate-limit window.
    pub rate_window: Duration,
    /// Period of the expiry sweep.
    pub reaper_interval: Duration,
    /// Room expiry windows.
    pub rooms: RoomTimeouts,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            handshake_delay: Duration::from_millis(500),
            ping_interval: Duration::from_secs(10),
            liveness_timeout: Duration::from_secs(30),
            rate_window: Duration::from_secs(60),
            reaper_interval: Duration::from_secs(30),
            rooms: RoomTimeouts::default(),
        }
    }
}

/// Fully resolved relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:4000`).
    pub bind_addr: String,
    /// Per-connection ceilings.
    pub limits: Limits,
    /// Timer periods.
    pub timing: Timing,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:4000".to_string(),
            limits: Limits::default(),
            timing: Timing::default(),
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and missing file
    /// is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or a resolved value is out of range.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, &file);
        config.validate()?;
        Ok(config)
    }

    /// Resolve a `RelayConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &RelayCliArgs, file: &RelayConfigFile) -> Self {
        let defaults = Self::default();
        let limits = &file.limits;
        let timing = &file.timing;
        let secs = |value: Option<u64>, default: Duration| value.map_or(default, Duration::from_secs);

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            limits: Limits {
                max_text_frame: limits
                    .max_text_frame
                    .unwrap_or(defaults.limits.max_text_frame),
                max_binary_chunk: cli
                    .max_binary_chunk
                    .or(limits.max_binary_chunk)
                    .unwrap_or(defaults.limits.max_binary_chunk),
                max_text_share: limits
                    .max_text_share
                    .unwrap_or(defaults.limits.max_text_share),
                max_clipboard: limits
                    .max_clipboard
                    .unwrap_or(defaults.limits.max_clipboard),
                rate_limit_per_minute: cli
                    .rate_limit
                    .or(limits.rate_limit_per_minute)
                    .unwrap_or(defaults.limits.rate_limit_per_minute),
            },
            timing: Timing {
                handshake_delay: cli
                    .handshake_delay_ms
                    .or(timing.handshake_delay_ms)
                    .map_or(defaults.timing.handshake_delay, Duration::from_millis),
                ping_interval: secs(timing.ping_interval_secs, defaults.timing.ping_interval),
                liveness_timeout: secs(
                    timing.liveness_timeout_secs,
                    defaults.timing.liveness_timeout,
                ),
                rate_window: defaults.timing.rate_window,
                reaper_interval: secs(timing.reaper_interval_secs, defaults.timing.reaper_interval),
                rooms: RoomTimeouts {
                    waiting: secs(timing.waiting_room_secs, defaults.timing.rooms.waiting),
                    handshake: secs(timing.handshake_window_secs, defaults.timing.rooms.handshake),
                    active: secs(timing.active_window_secs, defaults.timing.rooms.active),
                },
            },
            log_level: cli.log_level.clone(),
        }
    }

    /// Rejects combinations the session loop cannot honour.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.timing.liveness_timeout <= self.timing.ping_interval {
            return Err(ConfigError::Invalid(format!(
                "liveness timeout ({:?}) must exceed ping interval ({:?})",
                self.timing.liveness_timeout, self.timing.ping_interval
            )));
        }
        if self.timing.ping_interval.is_zero() || self.timing.reaper_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "timer periods must be non-zero".to_string(),
            ));
        }
        if self.limits.rate_limit_per_minute == 0 {
            return Err(ConfigError::Invalid(
                "rate limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file for the relay.
fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<RelayConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(RelayConfigFile::default());
        };
        config_dir.join("fluxsend-relay").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RelayConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
