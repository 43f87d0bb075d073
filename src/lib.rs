//! Room-based WebRTC signaling and peer-to-peer file transfer.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod negotiation;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod sweeper;
pub mod transfer;
