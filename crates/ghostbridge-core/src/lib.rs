//! Core abstractions for the GhostText bridge.
//!
//! This crate provides the fundamental building blocks:
//! - `DocumentSnapshot` / `SelectionRange` - The document model exchanged with the browser
//! - `ClientInfo` - Per-connection diagnostic context
//! - `Surface` / `SurfaceFactory` - The local editable surface contract
//! - `SnapshotSource` / `SnapshotSink` - The duplex channel contract

pub mod channel;
pub mod context;
pub mod snapshot;
pub mod traits;

pub use channel::{RecvError, SendError, SnapshotSink, SnapshotSource};
pub use context::ClientInfo;
pub use snapshot::{DocumentSnapshot, SelectionRange};
pub use traits::{Address, Surface, SurfaceError, SurfaceEvent, SurfaceEvents, SurfaceFactory};
