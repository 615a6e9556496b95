//! AVALON - Core Type Definitions
//! Defines the key ordering and lookup types shared across the engine.

use std::cmp::Ordering;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A total order over keys, injected into every tree and store.
pub trait KeyOrder<K: ?Sized> {
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// Orders keys by their `Ord` implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NaturalOrder;

impl<K: Ord + ?Sized> KeyOrder<K> for NaturalOrder {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// Orders keys descending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReverseOrder;

impl<K: Ord + ?Sized> KeyOrder<K> for ReverseOrder {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        b.cmp(a)
    }
}

/// Keys and values the store can hand to its flush worker and persist.
pub trait Storable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Storable for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Outcome of probing a single tier for a key.
/// `Deleted` means a tombstone was found and older tiers must not be consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    Deleted,
    Missing,
}

impl<T> Lookup<T> {
    /// Returns the value, treating tombstones as absent.
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::Deleted | Lookup::Missing => None,
        }
    }

    /// True if this tier settled the lookup (value or tombstone).
    pub fn is_settled(&self) -> bool {
        !matches!(self, Lookup::Missing)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Lookup::Found(value) => Lookup::Found(f(value)),
            Lookup::Deleted => Lookup::Deleted,
            Lookup::Missing => Lookup::Missing,
        }
    }
}
