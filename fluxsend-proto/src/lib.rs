//! Shared protocol definitions for the Fluxsend relay wire format.

pub mod codec;
pub mod device;
pub mod message;
pub mod room;
