// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Anvil Contributors

//! Persistent direct-tier index: DirectHash -> HandledHash.
//!
//! A crash-safe embedded store under `$ROOT/direct/`. Lookups that fail
//! for any reason degrade to a miss; only opening the store is fatal.

use std::path::Path;

use crate::error::Result;

pub struct DirectIndex {
    db: sled::Db,
}

impl DirectIndex {
    pub fn open(cache_root: &Path) -> Result<Self> {
        let db = sled::open(cache_root.join("direct"))?;
        Ok(DirectIndex { db })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match self.db.get(key.as_bytes()) {
            Ok(Some(value)) => String::from_utf8(value.to_vec()).ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("direct index read failed for {}: {}", key, e);
                None
            }
        }
    }

    /// A successful set survives a process crash.
    pub fn set(&self, key: &str, value: &str) -> bool {
        if let Err(e) = self.db.insert(key.as_bytes(), value.as_bytes()) {
            tracing::warn!("direct index write failed for {}: {}", key, e);
            return false;
        }
        match self.db.flush() {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("direct index flush failed: {}", e);
                false
            }
        }
    }

    pub fn delete(&self, key: &str) -> bool {
        match self.db.remove(key.as_bytes()) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("direct index delete failed for {}: {}", key, e);
                false
            }
        }
    }
}

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
