//! Duplex channel contract.
//!
//! A session owns both halves of one channel: the inbound flow reads
//! snapshots from a [`SnapshotSource`], the outbound flow writes them to a
//! [`SnapshotSink`].

use async_trait::async_trait;
use thiserror::Error;

use crate::DocumentSnapshot;

/// Why a snapshot could not be read.
#[derive(Debug, Error)]
pub enum RecvError {
    /// The remote side ended the session deliberately.
    #[error("Connection closed")]
    Closed,
    /// The remote side closed with an abnormal status.
    #[error("Connection closed abnormally (code {code}): {reason}")]
    AbnormalClose { code: u16, reason: String },
    /// The payload was not a valid snapshot.
    #[error("Malformed message: {0}")]
    Malformed(String),
    /// The underlying transport failed.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl RecvError {
    /// Whether this is an orderly end of the session rather than a failure.
    #[must_use]
    pub const fn is_expected(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl From<serde_json::Error> for RecvError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// Why a snapshot could not be written.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("Channel closed")]
    ChannelClosed,
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Read side of the duplex channel.
#[async_trait]
pub trait SnapshotSource: Send {
    /// Block until a full snapshot arrives or the channel ends.
    ///
    /// Must be cancel safe: dropping the future loses no message.
    async fn recv(&mut self) -> Result<DocumentSnapshot, RecvError>;
}

/// Write side of the duplex channel.
#[async_trait]
pub trait SnapshotSink: Send {
    /// Encode and send one snapshot.
    async fn send(&mut self, snapshot: &DocumentSnapshot) -> Result<(), SendError>;

    /// Close the channel from this side.
    async fn close(&mut self) -> Result<(), SendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_closed_is_expected() {
        assert!(RecvError::Closed.is_expected());
        assert!(!RecvError::Malformed("x".into()).is_expected());
        assert!(!RecvError::Transport("reset".into()).is_expected());
        assert!(
            !RecvError::AbnormalClose {
                code: 1011,
                reason: String::new()
            }
            .is_expected()
        );
    }

    #[test]
    fn test_json_error_is_malformed() {
        let err = serde_json::from_str::<DocumentSnapshot>("{").unwrap_err();
        assert!(matches!(RecvError::from(err), RecvError::Malformed(_)));
    }
}
