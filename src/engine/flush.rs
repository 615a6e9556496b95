//! AVALON - Flush Worker
//! Background thread that turns retired memtables into segment files.
//!
//! Retired memtables arrive over a bounded channel in retirement order,
//! so segment indices follow the age of their data. The worker writes
//! files without holding any engine lock and only takes the tier lock to
//! swap the finished segment in for its pending memtable.
//!
//! After a failure the worker halts: later memtables are skipped, not
//! written, so no segment can ever be newer than data still in memory.

use std::path::PathBuf;
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::error::{AvalonError, Result};
use crate::types::Storable;

use super::memtable::MemTable;
use super::metrics::EngineMetrics;
use super::segment::Segment;
use super::{lock, Halt, Tier, Tiers};

/// Work items for the flush worker.
pub(crate) enum FlushCommand<K, V, C> {
    /// Persist a retired memtable. `seq` identifies it in the pending tier.
    Flush {
        seq: u64,
        table: Arc<MemTable<K, V, C>>,
    },
    /// Acknowledge once every command queued before it has been handled.
    Barrier(SyncSender<()>),
}

pub(crate) struct FlushWorker<K, V, C> {
    pub(crate) dir: PathBuf,
    pub(crate) prefix: String,
    pub(crate) next_index: u64,
    pub(crate) tiers: Arc<Mutex<Tiers<K, V, C>>>,
    pub(crate) metrics: Arc<EngineMetrics>,
    pub(crate) rx: Receiver<FlushCommand<K, V, C>>,
}

impl<K, V, C> FlushWorker<K, V, C>
where
    K: Storable,
    V: Storable,
    C: Send + Sync + 'static,
{
    pub(crate) fn spawn(self) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("avalon-flush".into())
            .spawn(move || self.run())
            .map_err(AvalonError::from)
    }

    /// Runs until every sender is gone; commands already queued are still handled.
    fn run(mut self) {
        log::debug!("Flush worker started for {:?}", self.dir);
        while let Ok(command) = self.rx.recv() {
            match command {
                FlushCommand::Flush { seq, table } => self.flush(seq, &table),
                FlushCommand::Barrier(ack) => {
                    let _ = ack.send(());
                }
            }
        }
        log::debug!("Flush worker for {:?} stopped", self.dir);
    }

    fn flush(&mut self, seq: u64, table: &MemTable<K, V, C>) {
        if !lock(&self.tiers).accepts(seq) {
            // halted behind an earlier failure, or already persisted by a resubmission
            log::debug!("Skipping memtable #{}", seq);
            return;
        }

        let index = self.next_index;
        // a failed attempt may leave the name taken, never reuse it
        self.next_index += 1;

        match Segment::create(&self.dir, &self.prefix, index, table) {
            Ok(segment) => {
                log::info!(
                    "Flushed memtable #{} to segment {} ({} live, {} tombstoned, {} bytes)",
                    seq,
                    index,
                    table.len(),
                    table.hidden_len() - table.len(),
                    segment.file_size()
                );
                self.metrics.record_flush(segment.file_size());
                lock(&self.tiers).publish(seq, Tier::Segment(Arc::new(segment)));
            }
            Err(err) => {
                log::error!(
                    "Flush of memtable #{} to segment {} failed, halting flushes: {}",
                    seq,
                    index,
                    err
                );
                self.metrics.record_flush_failure();
                lock(&self.tiers).halted = Some(Halt {
                    index,
                    cause: Arc::new(err),
                });
            }
        }
    }
}
