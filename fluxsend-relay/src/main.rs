//! Fluxsend relay server: pairs two devices by room code and relays their
//! payloads.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:4000
//! cargo run --bin fluxsend-relay
//!
//! # Run on custom address
//! cargo run --bin fluxsend-relay -- --bind 127.0.0.1:8080
//!
//! # Or via environment variable
//! FLUXSEND_ADDR=127.0.0.1:8080 cargo run --bin fluxsend-relay
//! ```

use std::sync::Arc;

use clap::Parser;
use fluxsend_relay::config::{RelayCliArgs, RelayConfig};
use fluxsend_relay::server::{self, RelayState};

/// Time sessions get to flush close frames on shutdown.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_millis(500);

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(
        addr = %config.bind_addr,
        max_binary_chunk = config.limits.max_binary_chunk,
        rate_limit = config.limits.rate_limit_per_minute,
        "starting fluxsend relay server"
    );

    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(RelayState::with_config(config));

    match server::start_server_with_state(&bind_addr, Arc::clone(&state)).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "relay server listening");
            tokio::select! {
                result = handle => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "relay server task failed");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown requested");
                    state.close_all_connections();
                    tokio::time::sleep(SHUTDOWN_GRACE).await;
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay server");
            std::process::exit(1);
        }
    }
}
