//! AVALON - MemTable (In-Memory Write Buffer)
//! The MemTable accumulates recent writes before they are flushed to a segment.
//! Deletes are recorded as tombstones so a flushed buffer can shadow older segments.

use std::fmt::Display;
use std::io::{self, Write};

use serde::{Deserialize, Serialize};

use crate::types::{KeyOrder, Lookup, NaturalOrder};

use super::avl::{AvlTreeMap, Iter};

/// In-memory sorted write buffer backed by an AVL tree.
///
/// `len()` (live entries) drives the flush threshold; `hidden_len()`
/// also counts tombstones and is only reported, so a buffer full of
/// deletes does not flush early.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Serialize, V: Serialize",
    deserialize = "K: Deserialize<'de>, V: Deserialize<'de>, C: Default"
))]
pub struct MemTable<K, V, C = NaturalOrder> {
    tree: AvlTreeMap<K, V, C>,
}

impl<K: Ord, V> MemTable<K, V> {
    /// Create a new, empty MemTable.
    pub fn new() -> Self {
        Self::with_order(NaturalOrder)
    }
}

impl<K, V, C: Default> Default for MemTable<K, V, C> {
    fn default() -> Self {
        Self::with_order(C::default())
    }
}

impl<K, V, C> MemTable<K, V, C> {
    pub fn with_order(order: C) -> Self {
        Self {
            tree: AvlTreeMap::with_order(order),
        }
    }

    /// Returns the number of live entries in the MemTable.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Returns the number of entries including tombstones.
    pub fn hidden_len(&self) -> usize {
        self.tree.hidden_len()
    }

    /// Returns true if the MemTable holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn first_key(&self) -> Option<&K> {
        self.tree.first_key()
    }

    pub fn last_key(&self) -> Option<&K> {
        self.tree.last_key()
    }

    pub fn order(&self) -> &C {
        self.tree.order()
    }

    pub(crate) fn set_order(&mut self, order: C) {
        self.tree.set_order(order);
    }

    pub(crate) fn is_well_formed(&self) -> bool {
        self.tree.is_well_formed()
    }

    /// Clear all entries and tombstones.
    pub fn clear(&mut self) {
        self.tree.clear();
    }

    /// Live entries in key order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        self.tree.iter()
    }

    /// Write the tree breadth-first, one `level:{} key:{} value:{}` line per node.
    pub fn dump<W: Write>(&self, out: &mut W) -> io::Result<()>
    where
        K: Display,
        V: Display,
    {
        for entry in self.tree.level_order() {
            writeln!(
                out,
                "level:{} key:{} value:{}",
                entry.level, entry.key, entry.value
            )?;
        }
        Ok(())
    }
}

impl<K, V, C: KeyOrder<K>> MemTable<K, V, C> {
    /// Insert a key-value pair, reviving the key if it was tombstoned.
    /// Returns the previous live value.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.tree.put(key, value)
    }

    /// Get a value by key from the MemTable.
    /// Returns `None` if the key does not exist or has been deleted (tombstone).
    pub fn get(&self, key: &K) -> Option<&V> {
        self.tree.get(key)
    }

    pub fn lookup(&self, key: &K) -> Lookup<&V> {
        self.tree.lookup(key)
    }

    /// Check if a key exists in the MemTable (including tombstones).
    pub fn contains_key(&self, key: &K) -> bool {
        self.tree.contains_key(key)
    }

    /// Delete a key by marking its node as a tombstone.
    /// Returns true if a live entry was hidden.
    pub fn delete(&mut self, key: &K) -> bool {
        self.tree.mark_as_deleted(key)
    }

    /// Record a tombstone for a key whose live value sits in an older tier.
    /// `shadowed` is kept in the node like any other tombstoned value.
    pub fn tombstone(&mut self, key: K, shadowed: V) {
        self.tree.put_tombstone(key, shadowed);
    }

    /// Remove a key outright, tombstone and all.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.tree.remove(key)
    }
}
