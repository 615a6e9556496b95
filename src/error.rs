//! AVALON - Custom Error Types
//! Defines the error hierarchy for the segment store.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Custom Result type for the Avalon engine.
pub type Result<T> = std::result::Result<T, AvalonError>;

/// Error types for the Avalon storage engine.
#[derive(Error, Debug)]
pub enum AvalonError {
    /// I/O errors from file operations (segments, directory scans).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected (bad magic, CRC mismatch, broken tree links).
    #[error("Data corruption detected: {0}")]
    Corruption(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The storage directory could not be created or is not a directory.
    #[error("Storage directory {path:?} unusable: {reason}")]
    StorageDir { path: PathBuf, reason: String },

    /// A new segment file could not be created.
    #[error("Cannot create segment file {path:?}: {source}")]
    SegmentCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A retired memtable could not be persisted as a segment.
    /// The store rejects writes until `flush` resubmits the failed memtables.
    #[error("Flush of segment {index} failed: {source}")]
    FlushFailed {
        index: u64,
        /// Shared so every rejected call can report the same cause.
        #[source]
        source: Arc<AvalonError>,
    },

    /// The background flush worker is no longer receiving work.
    #[error("Flush worker stopped")]
    WorkerStopped,
}

impl From<bincode::Error> for AvalonError {
    fn from(err: bincode::Error) -> Self {
        AvalonError::Serialization(err.to_string())
    }
}
