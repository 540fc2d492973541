//! Error kinds for the conversion pipeline.
//!
//! Two levels are kept apart:
//!
//! - [`ContainerError`]: something went wrong with one uploaded container.
//!   The batch catches these and, by default, carries on without it.
//! - [`BatchError`]: the request as a whole cannot produce output.
//!
//! None of the `Display` strings include filesystem paths, so they can be
//! returned to HTTP clients unchanged.

use std::io;
use thiserror::Error;

use mailbind_core::segment::SegmentError;

/// Failure opening or reading a mail container.
#[derive(Debug, Error)]
pub enum MailError {
    #[error("not a readable mail container: {0}")]
    Format(String),

    #[error("I/O error reading mail container: {}", .0.kind())]
    Io(#[from] io::Error),
}

/// Failure turning markup into a document.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("render command could not be started: {0}")]
    Spawn(String),

    #[error("render command exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("render command timed out after {0}s")]
    Timeout(u64),

    #[error("renderer produced no output")]
    NoOutput,

    #[error("invalid markup: {0}")]
    Markup(String),

    #[error("PDF layout failed: {0}")]
    Pdf(String),

    #[error("I/O error while rendering: {}", .0.kind())]
    Io(#[from] io::Error),
}

/// Failure concatenating documents.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("nothing to merge")]
    Empty,

    /// `index` is the position of the offending input in append order.
    #[error("input #{index} is not a valid PDF: {reason}")]
    InvalidInput { index: usize, reason: String },

    #[error("merged document is malformed: {0}")]
    Structure(String),

    #[error("could not write merged document: {}", .0.kind())]
    Io(#[from] io::Error),
}

/// Failure building the batch archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive write failed: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("I/O error while archiving: {}", .0.kind())]
    Io(#[from] io::Error),
}

/// Per-container failure. Caught by the batch orchestrator.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error(transparent)]
    Open(#[from] MailError),

    #[error(transparent)]
    Segmentation(#[from] SegmentError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("I/O error: {}", .0.kind())]
    Io(#[from] io::Error),
}

impl ContainerError {
    /// Short machine-readable label used in logs and summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            ContainerError::Open(_) => "open",
            ContainerError::Segmentation(_) => "segmentation",
            ContainerError::Render(_) => "render",
            ContainerError::Merge(_) => "merge",
            ContainerError::Io(_) => "io",
        }
    }
}

/// Request rejected before any container was processed.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("no files uploaded")]
    NoFiles,

    #[error("upload exceeds the {limit} byte limit")]
    TooLarge { limit: usize },

    #[error("malformed upload: {0}")]
    Malformed(String),
}

/// Request-level failure.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Input(#[from] InputError),

    /// `attempted` counts the containers that had the right extension.
    #[error("no valid input: none of the {attempted} uploaded container(s) produced a document")]
    NoValidInput { attempted: usize },

    #[error("{name}: {source}")]
    Aborted {
        name: String,
        #[source]
        source: ContainerError,
    },

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("I/O error: {}", .0.kind())]
    Io(#[from] io::Error),
}
