//! Error types for datalib.
//!
//! Library crates use [`DatalibError`] via `thiserror`. Incomplete input is
//! never an error: readers report it through their own suspension signals.

use std::path::PathBuf;

/// Top-level error type for all datalib operations.
#[derive(Debug, thiserror::Error)]
pub enum DatalibError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error while setting up a client.
    #[error("network error: {0}")]
    Network(String),

    /// Hard parse error (malformed syntax or unexpected document structure).
    #[error("parse error: {message}")]
    Parse { message: String },

    /// A named stream stage failed; the whole chain halts.
    #[error("stage `{stage}` failed: {message}")]
    Stream { stage: String, message: String },

    /// The content-store writer rejected an entity.
    #[error("writer failed on entity #{position}: {message}")]
    Writer { position: u64, message: String },

    /// A pause/resume checkpoint could not be produced or applied.
    #[error("cursor error: {0}")]
    Cursor(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (invalid URL, unsupported cursor version, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, DatalibError>;

impl DatalibError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a cursor error from any displayable message.
    pub fn cursor(msg: impl Into<String>) -> Self {
        Self::Cursor(msg.into())
    }

    /// Attribute a failure to a named stream stage.
    pub fn stream(stage: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Stream {
            stage: stage.into(),
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
