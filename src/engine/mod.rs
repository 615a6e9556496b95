//! AVALON - Storage Engine Module
//! Ties the memtable, the flush worker and the on-disk segments into one store.

pub mod avl;
mod flush;
pub mod memtable;
pub mod metrics;
pub mod segment;

use std::mem;
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use crate::config::Config;
use crate::error::{AvalonError, Result};
use crate::types::{KeyOrder, Lookup, NaturalOrder, Storable};

use self::flush::{FlushCommand, FlushWorker};
use self::memtable::MemTable;
use self::metrics::EngineMetrics;
use self::segment::{Discovery, Segment};

/// Locks a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One layer of data older than the active memtable.
pub(crate) enum Tier<K, V, C> {
    /// Retired memtable the worker has not persisted (yet, or ever if its flush failed).
    Pending {
        seq: u64,
        table: Arc<MemTable<K, V, C>>,
    },
    Segment(Arc<Segment<K>>),
}

/// The failed flush that stopped the worker.
pub(crate) struct Halt {
    index: u64,
    cause: Arc<AvalonError>,
}

impl Halt {
    fn error(&self) -> AvalonError {
        AvalonError::FlushFailed {
            index: self.index,
            source: Arc::clone(&self.cause),
        }
    }
}

/// Everything behind the active memtable, shared with the flush worker.
pub(crate) struct Tiers<K, V, C> {
    /// Oldest first. A tier only ever changes in place, from pending to segment.
    levels: Vec<Tier<K, V, C>>,
    next_seq: u64,
    /// Set by a failed flush. Writes are rejected until `flush` resubmits.
    halted: Option<Halt>,
}

impl<K, V, C> Tiers<K, V, C> {
    fn position(&self, seq: u64) -> Option<usize> {
        self.levels
            .iter()
            .position(|t| matches!(t, Tier::Pending { seq: s, .. } if *s == seq))
    }

    /// True if memtable `seq` should be written now.
    fn accepts(&self, seq: u64) -> bool {
        self.halted.is_none() && self.position(seq).is_some()
    }

    fn publish(&mut self, seq: u64, tier: Tier<K, V, C>) {
        if let Some(pos) = self.position(seq) {
            self.levels[pos] = tier;
        }
    }

    fn check(&self) -> Result<()> {
        match &self.halted {
            Some(halt) => Err(halt.error()),
            None => Ok(()),
        }
    }
}

/// The Avalon segment store.
///
/// Writes land in an AVL memtable. Once it holds `memtable_capacity` live
/// entries it is retired and handed to a background worker that writes it
/// out as an immutable segment. Reads consult the active memtable, then
/// retired memtables and segments from newest to oldest; the first value
/// or tombstone found wins.
///
/// All public operations take `&self`; share the store across threads
/// with an `Arc`.
pub struct Avalon<K, V, C = NaturalOrder> {
    /// Engine-wide lock: held for the whole of every put, get and delete.
    active: Mutex<MemTable<K, V, C>>,
    tiers: Arc<Mutex<Tiers<K, V, C>>>,
    flush_tx: Option<SyncSender<FlushCommand<K, V, C>>>,
    worker: Option<JoinHandle<()>>,
    metrics: Arc<EngineMetrics>,
    order: C,
    config: Config,
}

impl<K, V> Avalon<K, V>
where
    K: Storable + Ord,
    V: Storable,
{
    /// Open or create a store at the configured path, ordering keys naturally.
    pub fn open(config: Config) -> Result<Self> {
        Self::open_with_order(config, NaturalOrder)
    }
}

impl<K, V, C> Avalon<K, V, C>
where
    K: Storable,
    V: Storable,
    C: KeyOrder<K> + Clone + Default + Send + Sync + 'static,
{
    /// Open or create a store whose keys are ordered by `order`.
    ///
    /// Existing segments under the configured prefix are picked up and new
    /// ones continue after the highest index found. Segments must have been
    /// written with the same order.
    pub fn open_with_order(config: Config, order: C) -> Result<Self> {
        config.validate()?;
        config.ensure_dirs()?;

        let Discovery {
            segments,
            next_index,
        } = segment::discover::<K>(&config.data_dir, &config.segment_prefix)?;

        log::info!(
            "Avalon engine opened at {:?} ({} segments, next index {})",
            config.data_dir,
            segments.len(),
            next_index
        );

        let tiers = Arc::new(Mutex::new(Tiers {
            levels: segments
                .into_iter()
                .map(|segment| Tier::Segment(Arc::new(segment)))
                .collect(),
            next_seq: 0,
            halted: None,
        }));
        let metrics = Arc::new(EngineMetrics::new());

        let (flush_tx, rx) = mpsc::sync_channel(config.flush_queue_depth);
        let worker = FlushWorker {
            dir: config.data_dir.clone(),
            prefix: config.segment_prefix.clone(),
            next_index,
            tiers: Arc::clone(&tiers),
            metrics: Arc::clone(&metrics),
            rx,
        }
        .spawn()?;

        Ok(Self {
            active: Mutex::new(MemTable::with_order(order.clone())),
            tiers,
            flush_tx: Some(flush_tx),
            worker: Some(worker),
            metrics,
            order,
            config,
        })
    }

    /// Insert or overwrite a key.
    ///
    /// If this fills the memtable it is retired for flushing. When the flush
    /// queue is full the call blocks until the worker catches up. Fails with
    /// `FlushFailed`, leaving the store untouched, while flushes are halted.
    pub fn put(&self, key: K, value: V) -> Result<()> {
        let mut active = lock(&self.active);
        lock(&self.tiers).check()?;
        active.insert(key, value);
        self.metrics.record_put();

        if active.len() >= self.config.memtable_capacity {
            self.retire(&mut active)?;
        }
        Ok(())
    }

    /// Look up a key across every tier, newest first.
    ///
    /// Segments that cannot be read are logged and skipped.
    pub fn get(&self, key: &K) -> Option<V> {
        let active = lock(&self.active);
        self.metrics.record_get();

        match active.lookup(key) {
            Lookup::Found(value) => Some(value.clone()),
            Lookup::Deleted => None,
            Lookup::Missing => self.lookup_tiers(key).found(),
        }
    }

    /// Delete a key.
    ///
    /// A key held only by an older tier gets a tombstone in the memtable so
    /// the deletion survives the next flush. Deleting an absent key is a no-op.
    pub fn delete(&self, key: K) -> Result<()> {
        let mut active = lock(&self.active);
        lock(&self.tiers).check()?;
        self.metrics.record_delete();

        match active.lookup(&key).map(|_| ()) {
            Lookup::Found(()) => {
                active.delete(&key);
            }
            Lookup::Deleted => {}
            Lookup::Missing => {
                if let Lookup::Found(shadowed) = self.lookup_tiers(&key) {
                    active.tombstone(key, shadowed);
                }
            }
        }
        Ok(())
    }

    /// Retire the memtable now, even below capacity. A no-op when it holds nothing.
    ///
    /// If a flush failed earlier, the memtables kept in memory are first
    /// resubmitted oldest first and writes are accepted again.
    pub fn flush(&self) -> Result<()> {
        let mut active = lock(&self.active);
        if lock(&self.tiers).halted.is_some() {
            self.resume()?;
        }
        if active.hidden_len() == 0 {
            return Ok(());
        }
        self.retire(&mut active)
    }

    /// Wait until every memtable retired so far has been handled by the worker.
    ///
    /// Returns the failure that halted flushing, if any. Memtables that were
    /// not written stay readable in memory.
    pub fn sync(&self) -> Result<()> {
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        {
            // ordered after every retirement that already holds its queue slot
            let _active = lock(&self.active);
            self.send(FlushCommand::Barrier(ack_tx))?;
        }
        ack_rx.recv().map_err(|_| AvalonError::WorkerStopped)?;
        lock(&self.tiers).check()
    }

    /// Wait for outstanding flushes, then stop the worker.
    ///
    /// The active memtable is not flushed; call `flush` first to persist it.
    pub fn close(mut self) -> Result<()> {
        let synced = self.sync();
        self.shutdown();
        synced
    }

    /// Handles to the persisted segments, oldest first.
    pub fn segments(&self) -> Vec<Arc<Segment<K>>> {
        lock(&self.tiers)
            .levels
            .iter()
            .filter_map(|tier| match tier {
                Tier::Segment(segment) => Some(Arc::clone(segment)),
                Tier::Pending { .. } => None,
            })
            .collect()
    }

    pub fn segment_count(&self) -> usize {
        lock(&self.tiers)
            .levels
            .iter()
            .filter(|tier| matches!(tier, Tier::Segment(_)))
            .count()
    }

    /// Retired memtables not yet persisted. No new ones are retired while
    /// flushes are halted.
    pub fn pending_flushes(&self) -> usize {
        lock(&self.tiers)
            .levels
            .iter()
            .filter(|tier| matches!(tier, Tier::Pending { .. }))
            .count()
    }

    /// Live entries in the active memtable.
    pub fn memtable_len(&self) -> usize {
        lock(&self.active).len()
    }

    /// Entries in the active memtable, tombstones included.
    pub fn memtable_hidden_len(&self) -> usize {
        lock(&self.active).hidden_len()
    }

    fn retire(&self, active: &mut MemTable<K, V, C>) -> Result<()> {
        let table = Arc::new(mem::replace(
            active,
            MemTable::with_order(self.order.clone()),
        ));

        let seq = {
            let mut tiers = lock(&self.tiers);
            let seq = tiers.next_seq;
            tiers.next_seq += 1;
            tiers.levels.push(Tier::Pending {
                seq,
                table: Arc::clone(&table),
            });
            seq
        };
        self.metrics.record_rotation();
        log::debug!(
            "Retired memtable #{} ({} live, {} total)",
            seq,
            table.len(),
            table.hidden_len()
        );

        // may block on a full queue; the worker never waits on `active`
        self.send(FlushCommand::Flush { seq, table })
    }

    /// Clear a halt and hand every unwritten memtable back to the worker.
    /// Called with `active` held.
    fn resume(&self) -> Result<()> {
        // the worker skips whatever was queued behind the failure
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        self.send(FlushCommand::Barrier(ack_tx))?;
        ack_rx.recv().map_err(|_| AvalonError::WorkerStopped)?;

        let pending: Vec<(u64, Arc<MemTable<K, V, C>>)> = {
            let mut tiers = lock(&self.tiers);
            tiers.halted = None;
            tiers
                .levels
                .iter()
                .filter_map(|tier| match tier {
                    Tier::Pending { seq, table } => Some((*seq, Arc::clone(table))),
                    Tier::Segment(_) => None,
                })
                .collect()
        };
        log::warn!("Resubmitting {} memtables after a failed flush", pending.len());
        for (seq, table) in pending {
            self.send(FlushCommand::Flush { seq, table })?;
        }
        Ok(())
    }

    /// Search everything older than the active memtable, newest first.
    fn lookup_tiers(&self, key: &K) -> Lookup<V> {
        let tiers = lock(&self.tiers);

        for tier in tiers.levels.iter().rev() {
            let found = match tier {
                Tier::Pending { table, .. } => table.lookup(key).map(V::clone),
                Tier::Segment(segment) => {
                    if !segment.may_contain(key, &self.order) {
                        self.metrics.record_segment_pruned();
                        continue;
                    }
                    self.metrics.record_segment_probe();
                    match segment.get::<V, C>(key, &self.order) {
                        Ok(found) => found,
                        Err(err) => {
                            self.metrics.record_segment_read_error();
                            log::warn!(
                                "Skipping unreadable segment {:?}: {}",
                                segment.path(),
                                err
                            );
                            continue;
                        }
                    }
                }
            };
            if found.is_settled() {
                return found;
            }
        }
        Lookup::Missing
    }
}

impl<K, V, C> Avalon<K, V, C> {
    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn order(&self) -> &C {
        &self.order
    }

    fn sender(&self) -> Result<&SyncSender<FlushCommand<K, V, C>>> {
        self.flush_tx.as_ref().ok_or(AvalonError::WorkerStopped)
    }

    fn send(&self, command: FlushCommand<K, V, C>) -> Result<()> {
        self.sender()?
            .send(command)
            .map_err(|_| AvalonError::WorkerStopped)
    }

    /// Disconnect the queue and wait for the worker to drain it.
    fn shutdown(&mut self) {
        self.flush_tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Flush worker panicked");
            }
        }
    }
}

impl<K, V, C> Drop for Avalon<K, V, C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
