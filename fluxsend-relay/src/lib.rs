//! Fluxsend relay server library.
//!
//! Pairs two devices through a short-lived room and relays payloads between
//! them. Exposed as a library for the binary, integration tests, and
//! embedding.

pub mod config;
pub mod devices;
pub mod relay;
pub mod rooms;
pub mod server;
pub mod session;
