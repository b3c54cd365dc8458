//! Concurrent origin-key → mapper dictionary.
//!
//! The table guarantees at most one live mapper per origin: insertion is an
//! atomic insert-if-absent that hands back the pre-existing entry when two
//! first datagrams race, so both land on the same mapper instead of spawning
//! duplicates. Iteration works over a point-in-time snapshot, which keeps it
//! safe while the intake loop inserts and mapper teardowns remove.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Outcome of [`SessionTable::insert_if_absent`].
pub enum Insert<M> {
    /// The caller's entry was installed.
    Installed,
    /// Another entry was already live; the caller's value was discarded.
    Existing(M),
}

/// Concurrent map keyed by the textual form of an origin address.
#[derive(Debug)]
pub struct SessionTable<M> {
    inner: DashMap<String, M>,
}

impl<M: Clone> SessionTable<M> {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Atomically installs `value` under `key`, or returns the entry that
    /// beat it there. The sole way to register a mapper.
    pub fn insert_if_absent(&self, key: String, value: M) -> Insert<M> {
        match self.inner.entry(key) {
            Entry::Occupied(occupied) => Insert::Existing(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                vacant.insert(value);
                Insert::Installed
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<M> {
        self.inner.get(key).map(|entry| entry.value().clone())
    }

    /// Removes the entry if present. Idempotent.
    pub fn remove(&self, key: &str) {
        self.inner.remove(key);
    }

    /// Visits a snapshot of the current entries. The visitor returns `false`
    /// to stop early and may freely call [`SessionTable::remove`], including
    /// on the key it holds; entries inserted mid-visit may be missed.
    pub fn for_each(&self, mut visitor: impl FnMut(&str, &M) -> bool) {
        let snapshot: Vec<(String, M)> = self
            .inner
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (key, value) in &snapshot {
            if !visitor(key, value) {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<M: Clone> Default for SessionTable<M> {
    fn default() -> Self {
        Self::new()
    }
}
