//! Surface implementations.

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "memory")]
pub use memory::{MemoryEvent, MemorySurface, MemorySurfaceFactory};
