#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::*;
use tempfile::tempdir;

const CMD: &str = "-cc1 -emit-obj";
const VER: &str = "clang version 17.0.6";

fn open_cache(dir: &Path, max_size: u64) -> Arc<FileCache> {
    let mut options = CacheOptions::new(dir.join("cache"));
    options.max_size = max_size;
    FileCache::open(options).unwrap()
}

fn entry(object: &[u8], deps: &[u8], stderr: &str) -> Entry {
    Entry {
        object: object.to_vec(),
        deps: deps.to_vec(),
        stderr: stderr.to_string(),
    }
}

#[test]
fn store_then_find_simple_roundtrip() {
    let dir = tempdir().unwrap();
    let cache = open_cache(dir.path(), UNLIMITED);

    let stored = entry(b"OBJECT", b"main.o: main.cc a.h\n", "warning: shadow");
    cache.store_simple(b"handled source", CMD, VER, &stored);

    let found = cache.find_simple(b"handled source", CMD, VER).unwrap();
    assert_eq!(found, stored);
}

#[test]
fn find_misses_on_different_key_parts() {
    let dir = tempdir().unwrap();
    let cache = open_cache(dir.path(), UNLIMITED);
    cache.store_simple(b"source", CMD, VER, &entry(b"OBJ", b"", ""));

    assert!(cache.find_simple(b"other source", CMD, VER).is_none());
    assert!(cache.find_simple(b"source", "-cc1 -S", VER).is_none());
    assert!(cache.find_simple(b"source", CMD, "clang 18").is_none());
}

#[test]
fn empty_entry_is_retrievable() {
    let dir = tempdir().unwrap();
    let cache = open_cache(dir.path(), UNLIMITED);

    cache.store_simple(b"source", CMD, VER, &Entry::default());
    let found = cache.find_simple(b"source", CMD, VER).unwrap();
    assert!(found.object.is_empty());
    assert!(found.deps.is_empty());
    assert!(found.stderr.is_empty());
}

#[test]
fn snappy_object_is_compressed_on_disk_and_restored() {
    let dir = tempdir().unwrap();
    let mut options = CacheOptions::new(dir.path().join("cache"));
    options.snappy = true;
    let cache = FileCache::open(options).unwrap();

    let object = vec![b'x'; 4096];
    cache.store_simple(b"source", CMD, VER, &entry(&object, b"", ""));

    let hash = hash::hash_handled(b"source", CMD, VER);
    let object_path = append_ext(&cache.common_path(&hash.0), EXT_OBJECT);
    let on_disk = std::fs::read(&object_path).unwrap();
    assert_ne!(on_disk, object);
    assert!(on_disk.len() < object.len());

    let found = cache.find_simple(b"source", CMD, VER).unwrap();
    assert_eq!(found.object, object);
}

#[test]
fn snappy_flag_honored_regardless_of_current_option() {
    let dir = tempdir().unwrap();
    {
        let mut options = CacheOptions::new(dir.path().join("cache"));
        options.snappy = true;
        let cache = FileCache::open(options).unwrap();
        cache.store_simple(b"source", CMD, VER, &entry(b"OBJECT BYTES", b"", ""));
    }

    // Reader opened without snappy still honors the manifest flag.
    let cache = open_cache(dir.path(), UNLIMITED);
    let found = cache.find_simple(b"source", CMD, VER).unwrap();
    assert_eq!(found.object, b"OBJECT BYTES");
}

#[test]
fn direct_store_then_find() {
    let dir = tempdir().unwrap();
    let cache = open_cache(dir.path(), UNLIMITED);

    let header = dir.path().join("a.h");
    std::fs::write(&header, "#define A 1\n").unwrap();

    let stored = entry(b"OBJ", b"main.o: main.cc a.h\n", "");
    cache.store_simple(b"handled", CMD, VER, &stored);
    let handled = hash::hash_handled(b"handled", CMD, VER);

    cache.store_direct(b"raw source", CMD, VER, &[header.clone()], &handled);

    let found = cache.find_direct(b"raw source", CMD, VER).unwrap();
    assert_eq!(found, stored);
}

#[test]
fn direct_find_misses_when_header_changes() {
    let dir = tempdir().unwrap();
    let cache = open_cache(dir.path(), UNLIMITED);

    let header = dir.path().join("a.h");
    std::fs::write(&header, "#define A 1\n").unwrap();

    cache.store_simple(b"handled", CMD, VER, &entry(b"OBJ", b"", ""));
    let handled = hash::hash_handled(b"handled", CMD, VER);
    cache.store_direct(b"raw source", CMD, VER, &[header.clone()], &handled);
    assert!(cache.find_direct(b"raw source", CMD, VER).is_some());

    std::fs::write(&header, "#define A 2\n").unwrap();
    assert!(cache.find_direct(b"raw source", CMD, VER).is_none());
}

#[test]
fn direct_find_misses_when_header_is_gone() {
    let dir = tempdir().unwrap();
    let cache = open_cache(dir.path(), UNLIMITED);

    let header = dir.path().join("a.h");
    std::fs::write(&header, "#define A 1\n").unwrap();

    cache.store_simple(b"handled", CMD, VER, &entry(b"OBJ", b"", ""));
    let handled = hash::hash_handled(b"handled", CMD, VER);
    cache.store_direct(b"raw source", CMD, VER, &[header.clone()], &handled);

    std::fs::remove_file(&header).unwrap();
    assert!(cache.find_direct(b"raw source", CMD, VER).is_none());
}

#[test]
fn volatile_header_skips_direct_tier_but_not_simple() {
    let dir = tempdir().unwrap();
    let cache = open_cache(dir.path(), UNLIMITED);

    let header = dir.path().join("stamp.h");
    std::fs::write(&header, "#define BUILT __DATE__\n").unwrap();

    let stored = entry(b"OBJ", b"", "");
    cache.store_simple(b"handled", CMD, VER, &stored);
    let handled = hash::hash_handled(b"handled", CMD, VER);
    cache.store_direct(b"raw source", CMD, VER, &[header.clone()], &handled);

    // No index record was written, so the direct lookup misses ...
    assert!(cache.find_direct(b"raw source", CMD, VER).is_none());
    let unhandled = hash::hash_unhandled(b"raw source", CMD, VER);
    let digest = hash::hash_header(b"#define BUILT __DATE__\n", &[]).unwrap();
    let direct_key = hash::hash_direct(&unhandled, &[digest]);
    assert!(cache.index.get(&direct_key).is_none());

    // ... while the simple tier still hits.
    assert_eq!(cache.find_simple(b"handled", CMD, VER).unwrap(), stored);
}

#[test]
fn eviction_removes_least_recent_first() {
    let dir = tempdir().unwrap();
    let cache = open_cache(dir.path(), 30);

    cache.store_simple(b"first", CMD, VER, &entry(&vec![b'a'; 14], b"", ""));
    cache.store_simple(b"second", CMD, VER, &entry(&vec![b'b'; 15], b"", ""));
    cache.store_simple(b"third", CMD, VER, &entry(&vec![b'c'; 16], b"", ""));

    assert!(cache.find_simple(b"first", CMD, VER).is_none());
    assert!(cache.find_simple(b"second", CMD, VER).is_none());
    assert!(cache.find_simple(b"third", CMD, VER).is_some());
    assert!(cache.total_size() <= 30);
}

#[test]
fn budget_of_one_entry_keeps_exactly_one() {
    let dir = tempdir().unwrap();
    let cache = open_cache(dir.path(), 10);

    cache.store_simple(b"first", CMD, VER, &entry(&vec![b'a'; 10], b"", ""));
    // Backdate the first entry so the eviction order is unambiguous.
    let first = hash::hash_handled(b"first", CMD, VER);
    lock(&cache.lru).insert(&first.0, 100, 10);

    cache.store_simple(b"second", CMD, VER, &entry(&vec![b'b'; 10], b"", ""));

    assert!(cache.find_simple(b"first", CMD, VER).is_none());
    assert!(cache.find_simple(b"second", CMD, VER).is_some());
    assert_eq!(cache.total_size(), 10);
}

#[test]
fn unlimited_budget_never_evicts() {
    let dir = tempdir().unwrap();
    let cache = open_cache(dir.path(), UNLIMITED);

    for i in 0..20u32 {
        let source = format!("source {i}");
        cache.store_simple(source.as_bytes(), CMD, VER, &entry(&vec![b'x'; 100], b"", ""));
    }
    for i in 0..20u32 {
        let source = format!("source {i}");
        assert!(cache.find_simple(source.as_bytes(), CMD, VER).is_some());
    }
}

#[test]
fn touch_protects_entry_from_eviction() {
    let dir = tempdir().unwrap();
    let cache = open_cache(dir.path(), 25);

    cache.store_simple(b"first", CMD, VER, &entry(&vec![b'a'; 10], b"", ""));
    cache.store_simple(b"second", CMD, VER, &entry(&vec![b'b'; 10], b"", ""));

    // Backdate both, then refresh "first" so "second" becomes the victim.
    let first = hash::hash_handled(b"first", CMD, VER);
    let second = hash::hash_handled(b"second", CMD, VER);
    {
        let mut lru = lock(&cache.lru);
        lru.insert(&first.0, 100, 10);
        lru.insert(&second.0, 101, 10);
    }
    cache.apply_refresh(vec![(5000, first.0.clone())]);

    cache.store_simple(b"third", CMD, VER, &entry(&vec![b'c'; 10], b"", ""));

    assert!(cache.find_simple(b"first", CMD, VER).is_some());
    assert!(cache.find_simple(b"second", CMD, VER).is_none());
}

#[test]
fn find_enqueues_refresh_for_the_sweeper() {
    let dir = tempdir().unwrap();
    let cache = open_cache(dir.path(), 100);

    cache.store_simple(b"source", CMD, VER, &entry(&vec![b'a'; 10], b"", ""));
    let hash = hash::hash_handled(b"source", CMD, VER);
    {
        let mut lru = lock(&cache.lru);
        lru.insert(&hash.0, 100, 10);
    }

    assert!(cache.find_simple(b"source", CMD, VER).is_some());

    // The sweeper picks the event up almost immediately; the recorded
    // mtime of the (backdated) entry moves forward.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let mtime = lock(&cache.lru).get(&hash.0).map(|(mtime, _)| mtime);
        if mtime.is_some_and(|mtime| mtime > 100) {
            break;
        }
        if std::time::Instant::now() > deadline {
            panic!("sweeper never applied the refresh");
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn startup_scan_registers_entries() {
    let dir = tempdir().unwrap();
    {
        let cache = open_cache(dir.path(), UNLIMITED);
        cache.store_simple(b"first", CMD, VER, &entry(&vec![b'a'; 10], b"", ""));
        cache.store_simple(b"second", CMD, VER, &entry(&vec![b'b'; 20], b"", ""));
    }

    let cache = open_cache(dir.path(), 1000);
    assert_eq!(cache.total_size(), 30);
    assert!(cache.find_simple(b"first", CMD, VER).is_some());
}

#[test]
fn startup_scan_removes_broken_entries() {
    let dir = tempdir().unwrap();
    let object_path;
    {
        let cache = open_cache(dir.path(), UNLIMITED);
        cache.store_simple(b"source", CMD, VER, &entry(b"OBJECT", b"", ""));
        let hash = hash::hash_handled(b"source", CMD, VER);
        object_path = append_ext(&cache.common_path(&hash.0), EXT_OBJECT);
    }
    // Break the entry: the manifest promises an object that is gone.
    std::fs::remove_file(&object_path).unwrap();

    let cache = open_cache(dir.path(), 1000);
    assert_eq!(cache.total_size(), 0);
    assert!(cache.find_simple(b"source", CMD, VER).is_none());
    let hash = hash::hash_handled(b"source", CMD, VER);
    assert!(!cache.manifest_path(&hash.0).exists());
}

#[test]
fn non_upgradable_entry_is_removed_on_access() {
    let dir = tempdir().unwrap();
    let cache = open_cache(dir.path(), UNLIMITED);

    // Plant a version-1 direct manifest at the raw-source fingerprint.
    let unhandled = hash::hash_unhandled(b"raw source", CMD, VER);
    std::fs::create_dir_all(cache.second_path(&unhandled.0)).unwrap();
    std::fs::write(
        cache.manifest_path(&unhandled.0),
        "version = 1\n\n[direct]\nheaders = [\"/abs/a.h\"]\n",
    )
    .unwrap();

    assert!(cache.find_direct(b"raw source", CMD, VER).is_none());
    assert!(!cache.manifest_path(&unhandled.0).exists());
}

#[test]
fn read_lock_on_missing_path_fails() {
    let dir = tempdir().unwrap();
    let cache = open_cache(dir.path(), UNLIMITED);
    assert!(cache.read_lock(Path::new("/nonexistent.manifest")).is_none());
}

#[test]
fn write_lock_excludes_other_locks() {
    let dir = tempdir().unwrap();
    let cache = open_cache(dir.path(), UNLIMITED);
    let path = dir.path().join("x.manifest");
    std::fs::write(&path, "").unwrap();

    let write = cache.write_lock(&path).unwrap();
    assert!(cache.write_lock(&path).is_none());
    assert!(cache.read_lock(&path).is_none());
    drop(write);

    let read_a = cache.read_lock(&path).unwrap();
    let read_b = cache.read_lock(&path).unwrap();
    assert!(cache.write_lock(&path).is_none());
    drop(read_a);
    assert!(cache.write_lock(&path).is_none());
    drop(read_b);
    assert!(cache.write_lock(&path).is_some());
}

#[test]
fn store_is_abandoned_while_entry_is_read_locked() {
    let dir = tempdir().unwrap();
    let cache = open_cache(dir.path(), UNLIMITED);

    let hash = hash::hash_handled(b"source", CMD, VER);
    std::fs::create_dir_all(cache.second_path(&hash.0)).unwrap();
    std::fs::write(cache.manifest_path(&hash.0), "version = 2\n\n[simple]\nobj = false\ndep = false\nerr = false\nsnappy = false\nsize = 0\n").unwrap();

    let _read = cache.read_lock(&cache.manifest_path(&hash.0)).unwrap();
    cache.store_simple(b"source", CMD, VER, &entry(b"NEW", b"", ""));

    // The store gave up; the planted empty manifest is untouched.
    drop(_read);
    let found = cache.find_simple(b"source", CMD, VER).unwrap();
    assert!(found.object.is_empty());
}

#[test]
fn lru_totals_stay_consistent_with_disk() {
    let dir = tempdir().unwrap();
    let cache = open_cache(dir.path(), 1000);

    cache.store_simple(b"a", CMD, VER, &entry(&vec![b'a'; 10], b"", ""));
    cache.store_simple(b"b", CMD, VER, &entry(&vec![b'b'; 20], b"x: y\n", ""));

    let lru = lock(&cache.lru);
    let sum: u64 = lru
        .iter_least_recent()
        .map(|h| {
            let mut total = 0;
            let common = cache.common_path(h);
            for ext in [EXT_OBJECT, EXT_DEPS, EXT_STDERR] {
                if let Ok(meta) = std::fs::metadata(append_ext(&common, ext)) {
                    total += meta.len();
                }
            }
            total
        })
        .sum();
    assert_eq!(sum, lru.total_size());
}
