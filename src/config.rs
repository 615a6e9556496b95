//! AVALON - Engine Configuration
//! Defines tunable parameters for the segment store.

use std::path::PathBuf;

use crate::error::{AvalonError, Result};

/// Configuration for the Avalon storage engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the segment files.
    pub data_dir: PathBuf,

    /// Number of live entries in the memtable that triggers a flush.
    pub memtable_capacity: usize,

    /// Segment files are named `{segment_prefix}{index}`.
    pub segment_prefix: String,

    /// Retired memtables that may wait for the flush worker before `put` blocks.
    pub flush_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            memtable_capacity: 1024,
            segment_prefix: String::from("segment_"),
            flush_queue_depth: 100,
        }
    }
}

impl Config {
    /// Create a new Config with a custom data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Set the live-entry count at which the memtable is flushed.
    pub fn with_memtable_capacity(mut self, capacity: usize) -> Self {
        self.memtable_capacity = capacity;
        self
    }

    /// Set the segment file name prefix.
    pub fn with_segment_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.segment_prefix = prefix.into();
        self
    }

    /// Set the depth of the flush hand-off queue.
    pub fn with_flush_queue_depth(mut self, depth: usize) -> Self {
        self.flush_queue_depth = depth;
        self
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.memtable_capacity == 0 {
            return Err(AvalonError::Config(
                "memtable_capacity must be at least 1".into(),
            ));
        }
        if self.segment_prefix.is_empty() {
            return Err(AvalonError::Config("segment_prefix must not be empty".into()));
        }
        if self
            .segment_prefix
            .chars()
            .any(std::path::is_separator)
        {
            return Err(AvalonError::Config(format!(
                "segment_prefix {:?} must be a plain file name",
                self.segment_prefix
            )));
        }
        Ok(())
    }

    /// Ensure the data directory exists.
    pub fn ensure_dirs(&self) -> Result<()> {
        if self.data_dir.exists() && !self.data_dir.is_dir() {
            return Err(AvalonError::StorageDir {
                path: self.data_dir.clone(),
                reason: "path exists and is not a directory".into(),
            });
        }
        std::fs::create_dir_all(&self.data_dir).map_err(|e| AvalonError::StorageDir {
            path: self.data_dir.clone(),
            reason: e.to_string(),
        })
    }
}
