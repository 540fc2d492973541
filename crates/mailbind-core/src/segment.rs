//! Thread segmentation.
//!
//! A reply thread exported from a mail client is one long body in which every
//! quoted message starts with a header block such as:
//!
//! ```text
//! From: Jane Doe <jane@example.com>
//! Sent: Monday, 3 June 2024 09:12
//! ```
//!
//! The [`Segmenter`] finds every line that starts with the boundary field
//! (`From:` by default, case-insensitive, leading whitespace allowed) and
//! returns the text between the first and the second boundary.
//!
//! # Example
//!
//! ```rust
//! use mailbind_core::segment::segment_thread;
//!
//! let body = "Thanks!\n\nFrom: Ops\nPlease see DO24-00123.\n\nFrom: Desk\nOriginal request";
//! assert_eq!(segment_thread(body).unwrap(), "From: Ops\nPlease see DO24-00123.");
//! ```

use regex::Regex;
use thiserror::Error;

/// Field name that opens each message of a thread.
pub const DEFAULT_MARKER: &str = "From";

/// Segmentation failure. Reported per container; never fatal for a batch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SegmentError {
    #[error("thread does not contain a second message ({found} boundary marker(s) found)")]
    MissingSecondMessage { found: usize },

    #[error("invalid boundary marker field: {0:?}")]
    InvalidMarker(String),
}

/// Locates message boundaries inside a thread body.
#[derive(Debug, Clone)]
pub struct Segmenter {
    boundary: Regex,
}

impl Segmenter {
    /// Builds a segmenter for the given boundary field name (without the colon).
    ///
    /// The field is matched literally and case-insensitively at the start of
    /// any line, after optional spaces, tabs, or other horizontal whitespace.
    pub fn new(field: &str) -> Result<Self, SegmentError> {
        let field = field.trim();
        if field.is_empty() || field.contains(':') || field.contains('\n') {
            return Err(SegmentError::InvalidMarker(field.to_string()));
        }
        let pattern = format!(r"(?im)^[\t\p{{Zs}}]*{}:", regex::escape(field));
        let boundary =
            Regex::new(&pattern).map_err(|_| SegmentError::InvalidMarker(field.to_string()))?;
        Ok(Self { boundary })
    }

    /// Returns the message between the first and second boundary, trimmed.
    ///
    /// Fails with [`SegmentError::MissingSecondMessage`] when the body holds
    /// fewer than two boundary lines.
    pub fn segment<'a>(&self, body: &'a str) -> Result<&'a str, SegmentError> {
        let mut starts = self.boundary.find_iter(body).map(|m| m.start());
        let first = starts.next();
        let second = starts.next();
        match (first, second) {
            (Some(first), Some(second)) => Ok(body[first..second].trim()),
            (first, _) => Err(SegmentError::MissingSecondMessage {
                found: usize::from(first.is_some()),
            }),
        }
    }
}

impl Default for Segmenter {
    fn default() -> Self {
        Self::new(DEFAULT_MARKER).expect("default boundary marker is valid")
    }
}

/// Segments `body` with the default `From:` boundary.
pub fn segment_thread(body: &str) -> Result<&str, SegmentError> {
    Segmenter::default().segment(body)
}
