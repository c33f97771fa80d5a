//! Errors that can abort the processing of a single archive.
//!
//! Anything in [`PipelineError`] is recoverable at the batch level: the
//! orchestrator records it in the status file and moves on to the next
//! archive. Conditions that should stop the whole run (such as being unable to
//! write the status file) are reported as [`anyhow::Error`] instead.

use std::io;

use thiserror::Error;

use crate::prelude::*;

/// Per-archive and per-image failures.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The archive is corrupt or could not be read.
    #[error("cannot extract archive {path:?}: {message}")]
    Archive { path: PathBuf, message: String },

    /// The OCR engine failed on one image.
    #[error("OCR failed for {path:?}: {message}")]
    Ocr { path: PathBuf, message: String },

    /// The OCR engine returned geometry we cannot lay out.
    #[error("bad OCR geometry for {path:?}: {message}")]
    Layout { path: PathBuf, message: String },

    /// The source raster is missing or cannot be decoded.
    #[error("cannot read image {path:?}: {message}")]
    Image { path: PathBuf, message: String },

    /// Hashing or other file-system access failed.
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl PipelineError {
    /// Build an [`PipelineError::Archive`].
    pub fn archive(path: &Path, message: impl ToString) -> Self {
        Self::Archive {
            path: path.to_owned(),
            message: message.to_string(),
        }
    }

    /// Build an [`PipelineError::Ocr`].
    pub fn ocr(path: &Path, message: impl ToString) -> Self {
        Self::Ocr {
            path: path.to_owned(),
            message: message.to_string(),
        }
    }

    /// Build an [`PipelineError::Layout`].
    pub fn layout(path: &Path, message: impl ToString) -> Self {
        Self::Layout {
            path: path.to_owned(),
            message: message.to_string(),
        }
    }

    /// Build an [`PipelineError::Image`].
    pub fn image(path: &Path, message: impl ToString) -> Self {
        Self::Image {
            path: path.to_owned(),
            message: message.to_string(),
        }
    }

    /// Build an [`PipelineError::Io`].
    pub fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_owned(),
            source,
        }
    }

    /// A short name for the kind of error, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Archive { .. } => "archive",
            Self::Ocr { .. } => "ocr",
            Self::Layout { .. } => "layout",
            Self::Image { .. } => "image",
            Self::Io { .. } => "io",
        }
    }
}
