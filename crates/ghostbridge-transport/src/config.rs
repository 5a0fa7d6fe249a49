//! Server configuration.

use ghostbridge_session::SessionOptions;

/// Port the GhostText extension connects to by default.
pub const DEFAULT_PORT: u16 = 4001;

/// Listener and per-connection settings, fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub max_message_size: usize,
    /// Origins allowed to open a session. Empty accepts any origin.
    pub allowed_origins: Vec<String>,
    pub session: SessionOptions,
}

impl ServerConfig {
    /// `host:port` to bind.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether an upgrade carrying `origin` may proceed.
    #[must_use]
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        self.allowed_origins.is_empty()
            || origin.is_some_and(|o| self.allowed_origins.iter().any(|a| a == o))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            read_buffer_size: 1024,
            write_buffer_size: 1024,
            max_message_size: 64 << 20,
            allowed_origins: Vec::new(),
            session: SessionOptions::default(),
        }
    }
}
