// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Anvil Contributors

//! On-disk manifest records.
//!
//! One TOML document per cached entry. Version 2 documents carry either a
//! `[simple]` table (artifact flags plus the byte size used for eviction
//! accounting) or a `[direct]` table (the header list behind a direct-tier
//! key). Versions 0 and 1 are readable and upgraded on access; unknown
//! top-level keys survive a rewrite.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const MANIFEST_VERSION: i64 = 2;

/// Artifact record of the simple tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleManifest {
    #[serde(default)]
    pub obj: bool,
    #[serde(default)]
    pub dep: bool,
    #[serde(default)]
    pub err: bool,
    #[serde(default)]
    pub snappy: bool,
    /// Bytes used by object + deps + stderr.
    #[serde(default)]
    pub size: u64,
}

/// Header list of the direct tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectManifest {
    #[serde(default)]
    pub headers: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ManifestKind {
    Simple(SimpleManifest),
    Direct(DirectManifest),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub kind: ManifestKind,
    /// Unknown top-level keys, preserved verbatim on rewrite.
    extra: toml::Table,
}

/// Outcome of loading a manifest through the migration chain.
#[derive(Debug)]
pub enum Loaded {
    Manifest(Manifest),
    /// The record cannot be carried forward; the entry must be removed.
    Discard,
}

impl Manifest {
    pub fn simple(record: SimpleManifest) -> Self {
        Manifest {
            kind: ManifestKind::Simple(record),
            extra: toml::Table::new(),
        }
    }

    pub fn direct(headers: Vec<PathBuf>) -> Self {
        Manifest {
            kind: ManifestKind::Direct(DirectManifest { headers }),
            extra: toml::Table::new(),
        }
    }

    pub fn as_simple(&self) -> Option<&SimpleManifest> {
        match &self.kind {
            ManifestKind::Simple(record) => Some(record),
            ManifestKind::Direct(_) => None,
        }
    }

    pub fn as_direct(&self) -> Option<&DirectManifest> {
        match &self.kind {
            ManifestKind::Direct(record) => Some(record),
            ManifestKind::Simple(_) => None,
        }
    }

    /// Load a manifest, migrating older schema versions in place. `None`
    /// means unreadable (the caller treats the entry as broken);
    /// [`Loaded::Discard`] means readable but not upgradable.
    pub fn load(manifest_path: &Path, common_prefix: &Path) -> Option<Loaded> {
        let text = std::fs::read_to_string(manifest_path).ok()?;
        let mut table: toml::Table = text.parse().ok()?;

        let mut version = table
            .get("version")
            .and_then(toml::Value::as_integer)
            .unwrap_or(0);
        let mut modified = false;

        if version == 0 {
            migrate_0_to_1(&mut table, common_prefix)?;
            version = 1;
            modified = true;
        }
        if version == 1 {
            if table.contains_key("direct") {
                // Old direct records may hold absolute header paths; there
                // is no way to tell them apart, so all of them go.
                return Some(Loaded::Discard);
            }
            version = MANIFEST_VERSION;
            modified = true;
        }
        if version != MANIFEST_VERSION {
            return None;
        }

        let kind = if let Some(value) = table.remove("simple") {
            ManifestKind::Simple(value.try_into().ok()?)
        } else if let Some(value) = table.remove("direct") {
            ManifestKind::Direct(value.try_into().ok()?)
        } else {
            return None;
        };
        table.remove("version");

        let manifest = Manifest { kind, extra: table };
        if modified {
            if let Err(e) = manifest.save(manifest_path) {
                tracing::warn!(
                    "failed to rewrite migrated manifest {}: {}",
                    manifest_path.display(),
                    e
                );
            }
        }
        Some(Loaded::Manifest(manifest))
    }

    /// Serialize and atomically replace the document at `path`.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let mut table = self.extra.clone();
        table.insert("version".to_string(), toml::Value::Integer(MANIFEST_VERSION));
        let (key, value) = match &self.kind {
            ManifestKind::Simple(record) => ("simple", toml::Value::try_from(record)),
            ManifestKind::Direct(record) => ("direct", toml::Value::try_from(record)),
        };
        let value = value.map_err(std::io::Error::other)?;
        table.insert(key.to_string(), value);

        let text = toml::to_string(&table).map_err(std::io::Error::other)?;
        super::write_atomic(path, text.as_bytes())
    }
}

/// Restructure a flat version-0 document into the version-1 shape: header
/// lists move under `[direct]`, artifact flags under the simple record with
/// a size computed from the files actually present.
fn migrate_0_to_1(table: &mut toml::Table, common_prefix: &Path) -> Option<()> {
    let headers: Vec<PathBuf> = match table.remove("headers") {
        Some(value) => value.try_into().ok()?,
        None => Vec::new(),
    };
    let flag = |table: &toml::Table, key: &str| {
        table.get(key).and_then(toml::Value::as_bool).unwrap_or(false)
    };

    if !headers.is_empty() {
        let direct = toml::Value::try_from(DirectManifest { headers }).ok()?;
        table.insert("direct".to_string(), direct);
    } else {
        let mut record = SimpleManifest {
            obj: flag(table, "object"),
            dep: flag(table, "deps"),
            err: flag(table, "stderr"),
            snappy: flag(table, "snappy"),
            size: 0,
        };
        for (expected, ext) in [
            (record.obj, super::EXT_OBJECT),
            (record.dep, super::EXT_DEPS),
            (record.err, super::EXT_STDERR),
        ] {
            if expected {
                let path = super::append_ext(common_prefix, ext);
                record.size += std::fs::metadata(&path).ok()?.len();
            }
        }
        let simple = toml::Value::try_from(record).ok()?;
        table.insert("simple".to_string(), simple);
    }

    for key in ["object", "deps", "stderr", "snappy"] {
        table.remove(key);
    }
    Some(())
}

#[cfg(test)]
#[path = "manifest_tests.rs"]
mod tests;
