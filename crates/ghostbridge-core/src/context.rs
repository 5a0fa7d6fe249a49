//! Per-connection diagnostic context.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies the remote end of a session in logs.
///
/// Nothing in the session logic depends on these values; they only make
/// unexpected disconnects diagnosable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Unique session identifier.
    pub session_id: Uuid,

    /// Peer socket address, when the listener exposes it.
    #[serde(default)]
    pub peer: Option<SocketAddr>,

    /// `User-Agent` header of the upgrade request.
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl ClientInfo {
    /// Create context for a new session with no client details.
    #[must_use]
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            peer: None,
            user_agent: None,
        }
    }

    /// Attach the peer address.
    #[must_use]
    pub const fn with_peer(mut self, peer: Option<SocketAddr>) -> Self {
        self.peer = peer;
        self
    }

    /// Attach the user agent.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: Option<String>) -> Self {
        self.user_agent = user_agent;
        self
    }

    /// User agent for logging, `-` when unknown.
    #[must_use]
    pub fn user_agent_or_dash(&self) -> &str {
        self.user_agent.as_deref().unwrap_or("-")
    }
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self::new()
    }
}
