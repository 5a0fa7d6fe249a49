//! Document snapshot exchanged in both directions.

use serde::{Deserialize, Serialize};

/// A contiguous range of character offsets into a document's text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub start: usize,
    pub end: usize,
}

impl SelectionRange {
    /// Create a new selection range.
    #[must_use]
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Clamp the range so that `0 <= start <= end <= len`.
    #[must_use]
    pub fn clamped(self, len: usize) -> Self {
        let end = self.end.min(len);
        let start = self.start.min(end);
        Self { start, end }
    }

    /// Whether the range is empty (a cursor rather than a selection).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Text, selections and page metadata of one browser text field.
///
/// Inbound, this is the state the local surface should take on. Outbound,
/// only `text` and `selections` are meaningful.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    /// Selection ranges; only the first one is honored.
    #[serde(default)]
    pub selections: Vec<SelectionRange>,
    /// Syntax hint supplied by the browser.
    #[serde(default)]
    pub syntax: String,
    /// Page title.
    #[serde(default)]
    pub title: String,
    /// Full text of the field.
    #[serde(default)]
    pub text: String,
    /// URL of the page the field lives on.
    #[serde(default)]
    pub url: String,
}

impl DocumentSnapshot {
    /// Build an outbound snapshot from captured surface state.
    #[must_use]
    pub fn captured(text: String, selection: SelectionRange) -> Self {
        Self {
            selections: vec![selection],
            text,
            ..Self::default()
        }
    }

    /// The selection this implementation honors, clamped to the text.
    #[must_use]
    pub fn primary_selection(&self) -> Option<SelectionRange> {
        self.selections
            .first()
            .map(|sel| sel.clamped(self.text.chars().count()))
    }
}
