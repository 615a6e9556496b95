//! AVALON - Engine Metrics & Observability
//! Atomic counters shared by the caller threads and the flush worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Atomic operation counters for the Avalon engine.
///
/// All counters use `Ordering::Relaxed`; they are read for reporting only.
#[derive(Debug)]
pub struct EngineMetrics {
    /// Total number of `put` operations.
    pub puts: AtomicU64,
    /// Total number of `get` operations.
    pub gets: AtomicU64,
    /// Total number of `delete` operations.
    pub deletes: AtomicU64,
    /// Memtables handed to the flush worker.
    pub rotations: AtomicU64,
    /// Segments successfully written.
    pub flushes: AtomicU64,
    /// Flushes that could not be persisted.
    pub flush_failures: AtomicU64,
    /// Segments whose body was read during a lookup.
    pub segments_probed: AtomicU64,
    /// Segments skipped because the key was outside their range.
    pub segments_pruned: AtomicU64,
    /// Segment reads that failed and were skipped.
    pub segment_read_errors: AtomicU64,
    /// Total bytes written to segment files.
    pub bytes_flushed: AtomicU64,
    /// Timestamp when the engine was opened.
    engine_started: Instant,
}

impl EngineMetrics {
    /// Create a new metrics instance with all counters at zero.
    pub fn new() -> Self {
        Self {
            puts: AtomicU64::new(0),
            gets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            rotations: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
            segments_probed: AtomicU64::new(0),
            segments_pruned: AtomicU64::new(0),
            segment_read_errors: AtomicU64::new(0),
            bytes_flushed: AtomicU64::new(0),
            engine_started: Instant::now(),
        }
    }

    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_get(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rotation(&self) {
        self.rotations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a segment written to disk.
    pub fn record_flush(&self, file_size: u64) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.bytes_flushed.fetch_add(file_size, Ordering::Relaxed);
    }

    pub fn record_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_segment_probe(&self) {
        self.segments_probed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_segment_pruned(&self) {
        self.segments_pruned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_segment_read_error(&self) {
        self.segment_read_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get engine uptime in seconds.
    pub fn uptime_secs(&self) -> f64 {
        self.engine_started.elapsed().as_secs_f64()
    }

    /// Get total number of client operations (puts + gets + deletes).
    pub fn total_ops(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
            + self.gets.load(Ordering::Relaxed)
            + self.deletes.load(Ordering::Relaxed)
    }

    /// Format metrics as a human-readable report.
    pub fn report(&self) -> String {
        format!(
            "\n═══ AVALON Engine Metrics ═══\n\
             Operations:\n\
               puts:      {}\n\
               gets:      {}\n\
               deletes:   {}\n\
             Flushes:\n\
               rotations: {}\n\
               flushed:   {}\n\
               failed:    {}\n\
               written:   {} bytes\n\
             Read path:\n\
               probed:    {}\n\
               pruned:    {}\n\
               errors:    {}\n\
             Uptime: {:.2}s",
            self.puts.load(Ordering::Relaxed),
            self.gets.load(Ordering::Relaxed),
            self.deletes.load(Ordering::Relaxed),
            self.rotations.load(Ordering::Relaxed),
            self.flushes.load(Ordering::Relaxed),
            self.flush_failures.load(Ordering::Relaxed),
            self.bytes_flushed.load(Ordering::Relaxed),
            self.segments_probed.load(Ordering::Relaxed),
            self.segments_pruned.load(Ordering::Relaxed),
            self.segment_read_errors.load(Ordering::Relaxed),
            self.uptime_secs(),
        )
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
