//! GhostText wire protocol.
//!
//! Every WebSocket message in either direction is one JSON-encoded
//! [`DocumentSnapshot`]. Before upgrading, the browser fetches a
//! [`Greeting`] over plain HTTP to learn where to connect.

use ghostbridge_core::{DocumentSnapshot, RecvError, SendError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol version announced in the greeting.
pub const PROTOCOL_VERSION: u32 = 1;

/// Wire protocol error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid snapshot: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("Failed to encode: {0}")]
    Encode(#[source] serde_json::Error),
}

impl From<ProtocolError> for RecvError {
    fn from(err: ProtocolError) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl From<ProtocolError> for SendError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Encode(e) | ProtocolError::Decode(e) => Self::Encode(e),
        }
    }
}

/// Decode one inbound message.
///
/// Missing fields take their defaults; unknown fields are ignored.
///
/// # Errors
/// Returns error if `text` is not a JSON snapshot object.
pub fn decode_snapshot(text: &str) -> Result<DocumentSnapshot, ProtocolError> {
    serde_json::from_str(text).map_err(ProtocolError::Decode)
}

/// Encode one outbound message.
///
/// # Errors
/// Returns error if serialization fails.
pub fn encode_snapshot(snapshot: &DocumentSnapshot) -> Result<String, ProtocolError> {
    serde_json::to_string(snapshot).map_err(ProtocolError::Encode)
}

/// Discovery response to a plain HTTP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Greeting {
    pub web_socket_port: u16,
    pub protocol_version: u32,
}

impl Greeting {
    /// Greeting pointing at `port`.
    #[must_use]
    pub const fn new(port: u16) -> Self {
        Self {
            web_socket_port: port,
            protocol_version: PROTOCOL_VERSION,
        }
    }

    /// Response body: the JSON object followed by a newline.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_body(&self) -> Result<String, ProtocolError> {
        let mut body = serde_json::to_string(self).map_err(ProtocolError::Encode)?;
        body.push('\n');
        Ok(body)
    }
}
