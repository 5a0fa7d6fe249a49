//! Core traits for the local editable surface.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

/// An address within a surface's text, in character offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    /// The entire current extent of the text.
    Whole,
    /// The half-open character range `[start, end)`.
    Chars { start: usize, end: usize },
    /// The active selection.
    Dot,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Whole => f.write_str(","),
            Self::Chars { start, end } => write!(f, "#{start},#{end}"),
            Self::Dot => f.write_str("."),
        }
    }
}

/// Structural event emitted by a surface.
///
/// `E` is the backend's raw event, carried unchanged so that events the
/// session does not handle can be handed back via [`Surface::forward`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceEvent<E> {
    /// The user executed a command.
    CommandExecuted { command: String, event: E },
    /// Anything else: edits, look/plumb actions, cursor motion.
    Other(E),
}

impl<E> SurfaceEvent<E> {
    /// Recover the raw event.
    pub fn into_raw(self) -> E {
        match self {
            Self::CommandExecuted { event, .. } | Self::Other(event) => event,
        }
    }
}

/// Lazy event sequence of a surface. Ends when the surface is closed.
pub type SurfaceEvents<E> = BoxStream<'static, SurfaceEvent<E>>;

/// Surface error.
#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("Surface unavailable: {0}")]
    Unavailable(String),
    #[error("Surface closed")]
    Closed,
    #[error("Surface has unsaved changes")]
    Unsaved,
    #[error("Event stream already taken")]
    EventsTaken,
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Surface I/O error: {0}")]
    Io(String),
}

impl SurfaceError {
    /// Whether the error means the surface no longer exists.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// A local, interactively editable text surface.
///
/// Implementations serialize their own operations; a surface is driven
/// concurrently by the inbound and outbound halves of one session.
#[async_trait]
pub trait Surface: Send + Sync + 'static {
    /// Backend-specific raw event.
    type Event: Send + 'static;

    /// Set the display label.
    async fn set_name(&self, name: &str) -> Result<(), SurfaceError>;

    /// Write to the auxiliary control/tag region.
    async fn write_tag(&self, text: &str) -> Result<(), SurfaceError>;

    /// Set the current address.
    async fn set_addr(&self, addr: Address) -> Result<(), SurfaceError>;

    /// Read the current address as `(start, end)` character offsets.
    async fn read_addr(&self) -> Result<(usize, usize), SurfaceError>;

    /// Make the current address the active selection.
    async fn select_addr(&self) -> Result<(), SurfaceError>;

    /// Replace the addressed text.
    async fn replace(&self, text: &str) -> Result<(), SurfaceError>;

    /// Read the whole text.
    async fn read_body(&self) -> Result<String, SurfaceError>;

    /// Set or clear the dirty indicator.
    async fn set_dirty(&self, dirty: bool) -> Result<(), SurfaceError>;

    /// Take the event sequence. May only be called once.
    async fn events(&self) -> Result<SurfaceEvents<Self::Event>, SurfaceError>;

    /// Hand an event back to the surface's default processing.
    async fn forward(&self, event: Self::Event) -> Result<(), SurfaceError>;

    /// Delete the surface. With `discard` unsaved changes are dropped;
    /// without it the surface may refuse with [`SurfaceError::Unsaved`].
    async fn delete(&self, discard: bool) -> Result<(), SurfaceError>;

    /// Release any held resource handles.
    async fn close(&self);
}

/// Creates one fresh surface per session.
#[async_trait]
pub trait SurfaceFactory: Send + Sync + 'static {
    type Surface: Surface;

    /// Create a new surface.
    async fn create(&self) -> Result<Self::Surface, SurfaceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display() {
        assert_eq!(Address::Whole.to_string(), ",");
        assert_eq!(Address::Chars { start: 3, end: 7 }.to_string(), "#3,#7");
        assert_eq!(Address::Dot.to_string(), ".");
    }

    #[test]
    fn test_into_raw() {
        let event = SurfaceEvent::CommandExecuted {
            command: "Put".to_string(),
            event: 7,
        };
        assert_eq!(event.into_raw(), 7);
        assert_eq!(SurfaceEvent::Other(3).into_raw(), 3);
    }
}
