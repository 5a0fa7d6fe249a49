//! acme windows as editable surfaces.
//!
//! Provides:
//! - `AcmeFactory` / `AcmeWindow` - The `Surface` implementation
//! - A multiplexed 9P2000 client for the acme file server
//! - Event file parsing
//! - plan9port namespace discovery

pub mod client;
pub mod event;
pub mod fcall;
pub mod namespace;
pub mod window;

pub use client::{Client, File, NinepError};
pub use event::{AcmeEvent, EventDecoder};
pub use namespace::{acme_socket, namespace};
pub use window::{AcmeFactory, AcmeWindow};
