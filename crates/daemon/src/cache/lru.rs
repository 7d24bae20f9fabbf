// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Anvil Contributors

//! In-memory LRU bookkeeping for the file cache.
//!
//! Not thread-safe; the file cache serializes every call under its own
//! mutex. Tracks per-entry (mtime, size) plus a running byte total so
//! eviction never has to stat the disk to find a victim.

use std::collections::{BTreeSet, HashMap};

/// Seconds since the epoch; the granularity of filesystem touches.
pub type Mtime = u64;

#[derive(Default)]
pub struct LruIndex {
    entries: HashMap<String, (Mtime, u64)>,
    /// Ordered by mtime, then size ascending: among equally old entries
    /// the smallest is evicted first.
    mtimes: BTreeSet<(Mtime, u64, String)>,
    cache_size: u64,
}

impl LruIndex {
    pub fn new() -> Self {
        LruIndex::default()
    }

    /// Register an entry. `size` must be non-zero; a zero-sized entry is a
    /// broken one and belongs to removal, not the index. Re-inserting an
    /// existing entry replaces its record.
    pub fn insert(&mut self, hash: &str, mtime: Mtime, size: u64) {
        debug_assert!(size > 0);
        self.remove(hash);
        self.entries.insert(hash.to_string(), (mtime, size));
        self.mtimes.insert((mtime, size, hash.to_string()));
        self.cache_size += size;
    }

    /// Drop an entry, returning its recorded size.
    pub fn remove(&mut self, hash: &str) -> Option<u64> {
        let (mtime, size) = self.entries.remove(hash)?;
        self.mtimes.remove(&(mtime, size, hash.to_string()));
        self.cache_size = self.cache_size.saturating_sub(size);
        Some(size)
    }

    /// Reposition an entry after a cache hit refreshed its mtime.
    pub fn touch(&mut self, hash: &str, new_mtime: Mtime) -> bool {
        let Some(&(old_mtime, size)) = self.entries.get(hash) else {
            return false;
        };
        self.mtimes.remove(&(old_mtime, size, hash.to_string()));
        self.mtimes.insert((new_mtime, size, hash.to_string()));
        self.entries.insert(hash.to_string(), (new_mtime, size));
        true
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn get(&self, hash: &str) -> Option<(Mtime, u64)> {
        self.entries.get(hash).copied()
    }

    /// The entry least recently used, if any.
    pub fn least_recent(&self) -> Option<&str> {
        self.mtimes.first().map(|(_, _, hash)| hash.as_str())
    }

    /// Entries ordered least-recent first; eviction walks this to skip
    /// victims it cannot lock.
    pub fn iter_least_recent(&self) -> impl Iterator<Item = &str> {
        self.mtimes.iter().map(|(_, _, hash)| hash.as_str())
    }

    pub fn total_size(&self) -> u64 {
        self.cache_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
#[path = "lru_tests.rs"]
mod tests;
