//! Centralized error types for the message storage engine.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the msgstore library.
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O error with the associated file path.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The blob store returned fewer bytes than the location promised.
    #[error("Short read at key {key}: expected {expected} bytes, got {actual}")]
    ShortRead { key: u32, expected: u32, actual: u32 },

    /// A single-file body region is not framed by the expected separators.
    #[error("Corrupt message frame at offset {offset}")]
    CorruptFrame { offset: u32 },

    /// A key does not address a live allocation in the blob store.
    #[error("Invalid key {key} in blob store '{store}'")]
    InvalidKey { store: String, key: u32 },

    /// An index record could not be framed.
    #[error("Invalid index record at key {key}: {reason}")]
    InvalidRecord { key: u32, reason: String },

    /// The folder file is corrupt or was written with an incompatible version.
    #[error("Corrupt or incompatible folder file '{path}': {reason}")]
    InvalidFolder { path: PathBuf, reason: String },

    /// The header of a message could not be re-read during a consistency check.
    #[error("Cannot read header of message #{position}: {reason}")]
    HeaderUnreadable { position: usize, reason: String },

    /// The requested operation is not available for this storage layout.
    #[error("Operation not supported by the {0} layout")]
    Unsupported(&'static str),

    /// No message with the given identifier exists in the folder.
    #[error("No such message: {0}")]
    MessageNotFound(u64),

    /// A location without a body was passed where body bytes are required.
    #[error("Message has no stored body")]
    NoBody,

    /// The caller cancelled a long-running operation.
    #[error("Operation cancelled by user")]
    Cancelled,
}

/// Convenience alias for `Result<T, StoreError>`.
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Allow `?` on `std::io::Error` when no path context is available
/// (rare; prefer `StoreError::io`).
impl From<std::io::Error> for StoreError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::from("<unknown>"),
            source,
        }
    }
}
