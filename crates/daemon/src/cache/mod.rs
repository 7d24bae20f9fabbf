// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Anvil Contributors

//! Two-tier on-disk artifact cache.
//!
//! The simple tier is the authoritative store: entries keyed by the hash
//! of preprocessed source + command line + version. The direct tier maps a
//! raw-source fingerprint through a header-content digest to a simple-tier
//! key, skipping preprocessing entirely on a hit.
//!
//! Entries live under `$ROOT/<h0>/<h1>/<rest>.{manifest,o,d,stderr}`.
//! Every find failure is silently a miss; every store is best-effort and
//! rolls back its partial files. Concurrency is mediated by non-blocking
//! per-manifest advisory locks: failing to lock is a miss (reads) or an
//! abandoned store (writes), never a stall.

pub mod index;
pub mod lru;
pub mod manifest;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use crossbeam_channel::{Receiver, Sender};
use regex::Regex;

use crate::error::{Error, Result};
use crate::hash::{self, HandledHash};
use index::DirectIndex;
use lru::{LruIndex, Mtime};
use manifest::{Loaded, Manifest, SimpleManifest};

pub const UNLIMITED: u64 = 0;

/// Tokens that keep a header out of the direct tier.
pub const DEFAULT_SKIP_LIST: &[&str] = &["__DATE__", "__TIME__"];

pub(crate) const EXT_MANIFEST: &str = "manifest";
pub(crate) const EXT_OBJECT: &str = "o";
pub(crate) const EXT_DEPS: &str = "d";
pub(crate) const EXT_STDERR: &str = "stderr";

/// One stored compilation result. Any field may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    pub object: Vec<u8>,
    pub deps: Vec<u8>,
    pub stderr: String,
}

/// Cache construction parameters.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub path: PathBuf,
    /// Byte budget; `UNLIMITED` disables eviction and the startup scan.
    pub max_size: u64,
    /// Store object bytes snappy-compressed.
    pub snappy: bool,
    /// Interval of the background refresh/eviction pass.
    pub clean_period: Duration,
    pub skip_list: Vec<String>,
}

impl CacheOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CacheOptions {
            path: path.into(),
            max_size: UNLIMITED,
            snappy: false,
            clean_period: Duration::from_secs(180),
            skip_list: DEFAULT_SKIP_LIST.iter().map(|t| t.to_string()).collect(),
        }
    }
}

pub(crate) fn append_ext(common: &Path, ext: &str) -> PathBuf {
    let mut name = common.as_os_str().to_os_string();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

/// Write through a sibling temp file and atomically rename into place, so
/// readers observe the pre-state or the post-state, never a torn write.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = append_ext(path, "tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

fn now_secs() -> Mtime {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

type RefreshEvent = (Mtime, String);

#[derive(Default)]
struct LockTable {
    readers: HashMap<PathBuf, u32>,
    writers: HashSet<PathBuf>,
}

pub struct FileCache {
    root: PathBuf,
    max_size: u64,
    snappy: bool,
    skip_list: Vec<String>,
    locks: Mutex<LockTable>,
    lru: Mutex<LruIndex>,
    index: DirectIndex,
    refresh_tx: Mutex<Option<Sender<RefreshEvent>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl FileCache {
    /// Open (creating if needed) the cache at `options.path`. With a
    /// bounded budget the on-disk tree is scanned into the LRU index and
    /// broken entries are removed.
    pub fn open(options: CacheOptions) -> Result<Arc<FileCache>> {
        std::fs::create_dir_all(&options.path)
            .map_err(|e| Error::io(options.path.clone(), e))?;
        let index = DirectIndex::open(&options.path)?;

        let (tx, rx) = crossbeam_channel::unbounded();
        let cache = Arc::new(FileCache {
            root: options.path,
            max_size: options.max_size,
            snappy: options.snappy,
            skip_list: options.skip_list,
            locks: Mutex::new(LockTable::default()),
            lru: Mutex::new(LruIndex::new()),
            index,
            refresh_tx: Mutex::new(Some(tx)),
            sweeper: Mutex::new(None),
        });

        if cache.max_size != UNLIMITED {
            cache.scan();
        }

        let weak = Arc::downgrade(&cache);
        let period = options.clean_period;
        let builder = std::thread::Builder::new().name("cache-sweeper".to_string());
        match builder.spawn(move || sweep(&weak, &rx, period)) {
            Ok(handle) => *lock(&cache.sweeper) = Some(handle),
            Err(e) => tracing::error!("failed to spawn cache sweeper: {}", e),
        }

        Ok(cache)
    }

    /// Look up a preprocessed source in the simple tier.
    pub fn find_simple(&self, source: &[u8], command_line: &str, version: &str) -> Option<Entry> {
        self.find_by_hash(&hash::hash_handled(source, command_line, version))
    }

    /// Look up a raw source in the direct tier: resolve its header list,
    /// digest the current header contents, and follow the index into the
    /// simple tier. Any failure along the way is a miss.
    pub fn find_direct(&self, raw_source: &[u8], command_line: &str, version: &str) -> Option<Entry> {
        let unhandled = hash::hash_unhandled(raw_source, command_line, version);
        let manifest_path = self.manifest_path(&unhandled.0);

        let headers = {
            let _lock = self.read_lock(&manifest_path)?;
            let manifest = self.load_manifest(&unhandled.0)?;
            let headers = manifest.as_direct()?.headers.clone();
            self.touch_and_refresh(&manifest_path, &unhandled.0);
            headers
        };

        let mut digests = Vec::with_capacity(headers.len());
        for header in &headers {
            digests.push(hash::hash_header_file(header, &[]).ok()??);
        }

        let direct_key = hash::hash_direct(&unhandled, &digests);
        let handled = self.index.get(&direct_key)?;
        self.find_by_hash(&HandledHash(handled))
    }

    /// Store a compilation result in the simple tier and trigger eviction.
    pub fn store_simple(&self, source: &[u8], command_line: &str, version: &str, entry: &Entry) {
        let hash = hash::hash_handled(source, command_line, version);
        self.store_by_hash(&hash, entry);
        self.clean();
    }

    /// Record a direct-tier entry: a manifest with the (absolute) header
    /// paths under the raw-source fingerprint, plus an index record from
    /// the header-content digest to `handled`. A skip-list refusal aborts
    /// the store silently.
    pub fn store_direct(
        &self,
        raw_source: &[u8],
        command_line: &str,
        version: &str,
        headers: &[PathBuf],
        handled: &HandledHash,
    ) {
        let unhandled = hash::hash_unhandled(raw_source, command_line, version);
        let manifest_path = self.manifest_path(&unhandled.0);
        {
            let Some(_lock) = self.write_lock(&manifest_path) else {
                tracing::debug!("failed to lock {} for writing", manifest_path.display());
                return;
            };
            if let Err(e) = std::fs::create_dir_all(self.second_path(&unhandled.0)) {
                tracing::warn!("failed to create cache directory: {}", e);
                return;
            }

            let mut digests = Vec::with_capacity(headers.len());
            for header in headers {
                match hash::hash_header_file(header, &self.skip_list) {
                    Ok(Some(digest)) => digests.push(digest),
                    Ok(None) => {
                        tracing::debug!(
                            "skipping direct entry, volatile header {}",
                            header.display()
                        );
                        return;
                    }
                    Err(e) => {
                        tracing::debug!("failed to hash {}: {}", header.display(), e);
                        return;
                    }
                }
            }

            let direct_key = hash::hash_direct(&unhandled, &digests);
            if !self.index.set(&direct_key, &handled.0) {
                return;
            }

            let manifest = Manifest::direct(headers.to_vec());
            if let Err(e) = manifest.save(&manifest_path) {
                tracing::warn!("failed to save manifest {}: {}", manifest_path.display(), e);
                self.index.delete(&direct_key);
                self.remove_entry_files(&unhandled.0);
                return;
            }
        }

        let size = std::fs::metadata(&manifest_path).map(|m| m.len()).unwrap_or(1);
        lock(&self.lru).insert(&unhandled.0, now_secs(), size);
        self.clean();
    }

    fn find_by_hash(&self, hash: &HandledHash) -> Option<Entry> {
        let manifest_path = self.manifest_path(&hash.0);
        let _lock = self.read_lock(&manifest_path)?;
        let record = self.load_manifest(&hash.0)?.as_simple()?.clone();

        self.touch_and_refresh(&manifest_path, &hash.0);

        let common = self.common_path(&hash.0);
        let mut entry = Entry::default();
        if record.err {
            let bytes = std::fs::read(append_ext(&common, EXT_STDERR)).ok()?;
            entry.stderr = String::from_utf8(bytes).ok()?;
        }
        if record.obj {
            let bytes = std::fs::read(append_ext(&common, EXT_OBJECT)).ok()?;
            entry.object = if record.snappy {
                match snap::raw::Decoder::new().decompress_vec(&bytes) {
                    Ok(unpacked) => unpacked,
                    Err(e) => {
                        tracing::warn!("failed to unpack object for {}: {}", hash.0, e);
                        return None;
                    }
                }
            } else {
                bytes
            };
        }
        if record.dep {
            entry.deps = std::fs::read(append_ext(&common, EXT_DEPS)).ok()?;
        }
        Some(entry)
    }

    fn store_by_hash(&self, hash: &HandledHash, entry: &Entry) {
        let manifest_path = self.manifest_path(&hash.0);
        let Some(_lock) = self.write_lock(&manifest_path) else {
            return;
        };
        if let Err(e) = std::fs::create_dir_all(self.second_path(&hash.0)) {
            tracing::warn!("failed to create cache directory: {}", e);
            return;
        }

        let common = self.common_path(&hash.0);
        let mut record = SimpleManifest::default();
        let mut artifact_size = 0u64;

        if !entry.stderr.is_empty() {
            let path = append_ext(&common, EXT_STDERR);
            if write_atomic(&path, entry.stderr.as_bytes()).is_err() {
                tracing::warn!("failed to save stderr to {}", path.display());
                self.remove_entry_files(&hash.0);
                return;
            }
            record.err = true;
            artifact_size += entry.stderr.len() as u64;
        }

        if !entry.object.is_empty() {
            let path = append_ext(&common, EXT_OBJECT);
            let bytes = if self.snappy {
                record.snappy = true;
                snap::raw::Encoder::new().compress_vec(&entry.object).ok()
            } else {
                Some(entry.object.clone())
            };
            let Some(bytes) = bytes else {
                tracing::warn!("failed to pack object for {}", path.display());
                self.remove_entry_files(&hash.0);
                return;
            };
            if write_atomic(&path, &bytes).is_err() {
                tracing::warn!("failed to save object to {}", path.display());
                self.remove_entry_files(&hash.0);
                return;
            }
            record.obj = true;
            artifact_size += bytes.len() as u64;
        }

        if !entry.deps.is_empty() {
            let path = append_ext(&common, EXT_DEPS);
            if write_atomic(&path, &entry.deps).is_err() {
                tracing::warn!("failed to save deps to {}", path.display());
                self.remove_entry_files(&hash.0);
                return;
            }
            record.dep = true;
            artifact_size += entry.deps.len() as u64;
        }

        record.size = artifact_size;
        if Manifest::simple(record).save(&manifest_path).is_err() {
            tracing::warn!("failed to save manifest {}", manifest_path.display());
            self.remove_entry_files(&hash.0);
            return;
        }
        drop(_lock);
        tracing::debug!("cached entry at {}", common.display());

        let size = if artifact_size > 0 {
            artifact_size
        } else {
            std::fs::metadata(&manifest_path).map(|m| m.len()).unwrap_or(1)
        };
        lock(&self.lru).insert(&hash.0, now_secs(), size);
    }

    /// Load a manifest through the migration chain. A record that cannot
    /// be carried forward is removed here; any failure is a miss.
    fn load_manifest(&self, hash: &str) -> Option<Manifest> {
        let manifest_path = self.manifest_path(hash);
        let common = self.common_path(hash);
        match Manifest::load(&manifest_path, &common)? {
            Loaded::Manifest(manifest) => Some(manifest),
            Loaded::Discard => {
                tracing::debug!("removing non-upgradable entry {}", hash);
                self.remove_entry_files(hash);
                lock(&self.lru).remove(hash);
                None
            }
        }
    }

    /// Refresh the manifest mtime on disk and queue the LRU update for the
    /// sweeper; hits stay cheap and the index catches up in the background.
    fn touch_and_refresh(&self, manifest_path: &Path, hash: &str) {
        let now = filetime::FileTime::now();
        let _ = filetime::set_file_mtime(manifest_path, now);
        if let Some(tx) = lock(&self.refresh_tx).as_ref() {
            let _ = tx.send((now.unix_seconds().max(0) as Mtime, hash.to_string()));
        }
    }

    /// Expected byte size of an entry, or `None` when the entry is broken
    /// (unreadable manifest or a missing artifact file).
    fn entry_size(&self, hash: &str) -> Option<u64> {
        let manifest = self.load_manifest(hash)?;
        let common = self.common_path(hash);
        match &manifest.kind {
            manifest::ManifestKind::Simple(record) => {
                for (expected, ext) in [
                    (record.obj, EXT_OBJECT),
                    (record.dep, EXT_DEPS),
                    (record.err, EXT_STDERR),
                ] {
                    if expected && !append_ext(&common, ext).exists() {
                        return None;
                    }
                }
                if record.size > 0 {
                    Some(record.size)
                } else {
                    self.manifest_len(hash)
                }
            }
            manifest::ManifestKind::Direct(_) => self.manifest_len(hash),
        }
    }

    fn manifest_len(&self, hash: &str) -> Option<u64> {
        std::fs::metadata(self.manifest_path(hash)).ok().map(|m| m.len().max(1))
    }

    /// Delete an entry's files. Index bookkeeping is the caller's problem.
    fn remove_entry_files(&self, hash: &str) -> bool {
        let common = self.common_path(hash);
        let mut removed = true;
        for ext in [EXT_OBJECT, EXT_DEPS, EXT_STDERR, EXT_MANIFEST] {
            let path = append_ext(&common, ext);
            if path.exists() && std::fs::remove_file(&path).is_err() {
                tracing::warn!("failed to delete {}", path.display());
                removed = false;
            }
        }
        removed
    }

    /// Evict least-recent entries until the budget holds, skipping any
    /// entry whose manifest is locked by a reader.
    fn clean(&self) {
        if self.max_size == UNLIMITED {
            return;
        }
        loop {
            let candidates: Vec<String> = {
                let lru = lock(&self.lru);
                if lru.total_size() <= self.max_size {
                    return;
                }
                lru.iter_least_recent().map(str::to_string).collect()
            };

            let mut removed_any = false;
            for hash in candidates {
                let manifest_path = self.manifest_path(&hash);
                let Some(guard) = self.write_lock(&manifest_path) else {
                    continue;
                };
                self.remove_entry_files(&hash);
                let mut lru = lock(&self.lru);
                lru.remove(&hash);
                tracing::debug!("evicted {}, cache at {} bytes", hash, lru.total_size());
                let done = lru.total_size() <= self.max_size;
                drop(lru);
                drop(guard);
                removed_any = true;
                if done {
                    return;
                }
            }
            if !removed_any {
                // Every remaining victim is being read; try again later.
                return;
            }
        }
    }

    /// Apply a batch of refresh events, then evict.
    fn apply_refresh(&self, batch: Vec<RefreshEvent>) {
        let mut unknown: Vec<RefreshEvent> = Vec::new();
        {
            let mut lru = lock(&self.lru);
            for (mtime, hash) in batch {
                if !lru.touch(&hash, mtime) {
                    unknown.push((mtime, hash));
                }
            }
        }
        // Sizing unknown entries reads manifests; do it outside the lock.
        let sized: Vec<(Mtime, String, u64)> = unknown
            .into_iter()
            .filter_map(|(mtime, hash)| {
                self.entry_size(&hash).map(|size| (mtime, hash, size))
            })
            .collect();
        {
            let mut lru = lock(&self.lru);
            for (mtime, hash, size) in sized {
                if !lru.touch(&hash, mtime) {
                    lru.insert(&hash, mtime, size);
                }
            }
        }
        self.clean();
    }

    /// Walk the tree, register every well-formed entry, remove the rest.
    fn scan(&self) {
        let entry_re = match Regex::new(r"^([0-9a-f]{32}-[0-9a-f]{8}-[0-9a-f]{8})\.manifest$") {
            Ok(re) => re,
            Err(_) => return,
        };

        for item in walkdir::WalkDir::new(&self.root)
            .min_depth(3)
            .max_depth(3)
            .into_iter()
            .filter_map(|item| item.ok())
        {
            let Some(name) = item.file_name().to_str() else {
                continue;
            };
            let Some(captures) = entry_re.captures(name) else {
                continue;
            };
            let Some(hash) = captures.get(1).map(|m| m.as_str()) else {
                continue;
            };

            match self.entry_size(hash) {
                Some(size) => {
                    let mtime = item
                        .metadata()
                        .ok()
                        .and_then(|m| m.modified().ok())
                        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                        .map(|d| d.as_secs())
                        .unwrap_or(0);
                    lock(&self.lru).insert(hash, mtime, size);
                    tracing::debug!("registered {}", hash);
                }
                None => {
                    self.remove_entry_files(hash);
                    tracing::warn!("removed broken entry {}", hash);
                }
            }
        }
    }

    fn first_path(&self, hash: &str) -> PathBuf {
        self.root.join(&hash[..1])
    }

    fn second_path(&self, hash: &str) -> PathBuf {
        self.first_path(hash).join(&hash[1..2])
    }

    fn common_path(&self, hash: &str) -> PathBuf {
        self.second_path(hash).join(&hash[2..])
    }

    fn manifest_path(&self, hash: &str) -> PathBuf {
        append_ext(&self.common_path(hash), EXT_MANIFEST)
    }

    fn read_lock(&self, path: &Path) -> Option<ReadLock<'_>> {
        if !path.exists() {
            return None;
        }
        let mut table = lock(&self.locks);
        if table.writers.contains(path) {
            return None;
        }
        *table.readers.entry(path.to_path_buf()).or_insert(0) += 1;
        Some(ReadLock {
            cache: self,
            path: path.to_path_buf(),
        })
    }

    fn write_lock(&self, path: &Path) -> Option<WriteLock<'_>> {
        let mut table = lock(&self.locks);
        if table.writers.contains(path) || table.readers.contains_key(path) {
            return None;
        }
        table.writers.insert(path.to_path_buf());
        Some(WriteLock {
            cache: self,
            path: path.to_path_buf(),
        })
    }

    pub fn total_size(&self) -> u64 {
        lock(&self.lru).total_size()
    }
}

impl Drop for FileCache {
    fn drop(&mut self) {
        // Disconnect the channel so the sweeper wakes and exits.
        lock(&self.refresh_tx).take();
        if let Some(handle) = lock(&self.sweeper).take()
            && handle.thread().id() != std::thread::current().id()
        {
            let _ = handle.join();
        }
    }
}

struct ReadLock<'a> {
    cache: &'a FileCache,
    path: PathBuf,
}

impl Drop for ReadLock<'_> {
    fn drop(&mut self) {
        let mut table = lock(&self.cache.locks);
        if let Some(count) = table.readers.get_mut(&self.path) {
            *count -= 1;
            if *count == 0 {
                table.readers.remove(&self.path);
            }
        }
    }
}

struct WriteLock<'a> {
    cache: &'a FileCache,
    path: PathBuf,
}

impl Drop for WriteLock<'_> {
    fn drop(&mut self) {
        let mut table = lock(&self.cache.locks);
        table.writers.remove(&self.path);
    }
}

fn sweep(cache: &Weak<FileCache>, rx: &Receiver<RefreshEvent>, period: Duration) {
    loop {
        let mut batch = Vec::new();
        match rx.recv_timeout(period) {
            Ok(event) => {
                batch.push(event);
                while let Ok(event) = rx.try_recv() {
                    batch.push(event);
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
        }
        let Some(cache) = cache.upgrade() else {
            return;
        };
        cache.apply_refresh(batch);
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
