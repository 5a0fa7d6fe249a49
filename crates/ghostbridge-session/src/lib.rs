//! Session lifecycle and synchronization for the GhostText bridge.
//!
//! Provides:
//! - `SessionBridge` - Open one session per accepted connection
//! - Inbound sync and outbound publish flows
//! - In-memory surface and channel pipe (feature: memory)

pub mod bridge;
pub mod inbound;
pub mod options;
pub mod outbound;
pub mod surface;

#[cfg(feature = "memory")]
pub mod pipe;

pub use bridge::{Session, SessionBridge, SessionEnd, SessionError};
pub use options::SessionOptions;
