//! Error types for dump, cache and merge operations.
//!
//! All fallible functions in this crate return [`Result<T>`], which uses [`Error`]
//! as the error type. External error types (`std::io::Error`, `serde_json::Error`,
//! TOML and image errors) are automatically converted via `From` impls.

use camino::Utf8PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while dumping, caching or combining mods.
#[derive(Error, Debug)]
pub enum Error {
    /// Filesystem I/O failed (reading trees, writing the merged output, etc.).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse or serialize JSON (hash cache snapshot).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The configuration file is not valid TOML for [`CombinerConfig`](crate::CombinerConfig).
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    /// An image could not be decoded.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// No output location is configured. Nothing can run without one.
    #[error("Output directory is not configured")]
    MissingOutputDir,

    /// The source binary for a (chapter, slot) pair does not exist.
    #[error("Source binary not found: {0}")]
    MissingSourceBinary(Utf8PathBuf),

    /// An external executable could not be started because it was not found.
    #[error("Tool not found: {program}")]
    ToolNotFound { program: String },

    /// An external executable exited unsuccessfully.
    #[error("Tool '{program}' failed with exit code {code:?}: {stderr}")]
    ToolFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    /// An external executable did not finish within its time budget and was killed.
    #[error("Tool '{program}' timed out after {timeout:?}")]
    ToolTimeout { program: String, timeout: Duration },

    /// A cache stamp file exists but holds no usable `pre` digest.
    #[error("Invalid cache stamp: {0}")]
    InvalidStamp(Utf8PathBuf),

    /// Computing a content digest failed.
    #[error("Failed to hash '{path}': {message}")]
    Hash { path: Utf8PathBuf, message: String },

    /// A path on disk is not valid UTF-8.
    #[error("Non UTF-8 path: {0}")]
    NonUtf8Path(std::path::PathBuf),

    /// Catch-all for errors from collaborators and other sources.
    #[error("{0}")]
    Other(String),
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<walkdir::Error> for Error {
    fn from(e: walkdir::Error) -> Self {
        match e.into_io_error() {
            Some(io) => Error::Io(io),
            None => Error::Other("filesystem loop detected while walking directory".to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Other(format!("worker task failed: {e}"))
    }
}
