//! Transport layer between GhostText and the session bridge.
//!
//! Provides:
//! - Wire protocol (JSON snapshots + discovery greeting)
//! - Server configuration
//! - WebSocket server and channel adapters (feature: websocket)

pub mod config;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use config::ServerConfig;
pub use protocol::{Greeting, PROTOCOL_VERSION, ProtocolError};
