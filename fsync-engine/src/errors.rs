//! Error types for sync operations

use std::path::PathBuf;

use fsync_shared::ContentHash;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// A local path became unreadable. Collected per entry, never fatal to a
    /// whole walk or session.
    #[error("access error at {path}: {source}")]
    Access {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed or out-of-order message. Fatal to the session.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Connection lost. The session aborts but is resumable on reconnect.
    #[error("transport error: {0}")]
    Transport(String),

    /// Reassembled content did not match the expected hash.
    #[error("integrity error at {path}: expected {expected}, got {actual}")]
    Integrity {
        path: String,
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("snapshot store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timeout waiting for {0}")]
    Timeout(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("invalid ignore pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
}

impl From<fsync_shared::WireError> for SyncError {
    fn from(e: fsync_shared::WireError) -> Self {
        SyncError::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
