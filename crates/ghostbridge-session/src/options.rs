//! Per-session behavior knobs.

/// Command that sends the surface's text back to the browser.
pub const PUBLISH_COMMAND: &str = "Put";

/// Label prefix of every bridged surface.
pub const NAME_PREFIX: &str = "/Ghost/";

/// Options shared read-only by every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Prefix joined with the page URL to label the surface.
    pub name_prefix: String,
    /// Initial contents of the surface's tag region.
    pub tag: String,
    /// Command that triggers a publish.
    pub publish_command: String,
    /// Delete the surface even if it holds unsaved edits once the
    /// connection is gone.
    pub discard_on_disconnect: bool,
}

impl SessionOptions {
    /// Label for a surface editing `url`.
    #[must_use]
    pub fn surface_name(&self, url: &str) -> String {
        format!("{}{url}", self.name_prefix)
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            name_prefix: NAME_PREFIX.to_string(),
            tag: format!("Undo Redo {PUBLISH_COMMAND}"),
            publish_command: PUBLISH_COMMAND.to_string(),
            discard_on_disconnect: true,
        }
    }
}
