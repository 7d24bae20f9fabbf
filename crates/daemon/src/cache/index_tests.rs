#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::*;
use tempfile::tempdir;

#[test]
fn set_then_get() {
    let dir = tempdir().unwrap();
    let index = DirectIndex::open(dir.path()).unwrap();

    assert!(index.set("direct-key", "handled-value"));
    assert_eq!(index.get("direct-key").as_deref(), Some("handled-value"));
}

#[test]
fn get_missing_is_none() {
    let dir = tempdir().unwrap();
    let index = DirectIndex::open(dir.path()).unwrap();
    assert_eq!(index.get("absent"), None);
}

#[test]
fn delete_removes_record() {
    let dir = tempdir().unwrap();
    let index = DirectIndex::open(dir.path()).unwrap();

    index.set("key", "value");
    assert!(index.delete("key"));
    assert_eq!(index.get("key"), None);
    // Deleting again is still a success.
    assert!(index.delete("key"));
}

#[test]
fn set_overwrites() {
    let dir = tempdir().unwrap();
    let index = DirectIndex::open(dir.path()).unwrap();

    index.set("key", "first");
    index.set("key", "second");
    assert_eq!(index.get("key").as_deref(), Some("second"));
}

#[test]
fn records_survive_reopen() {
    let dir = tempdir().unwrap();
    {
        let index = DirectIndex::open(dir.path()).unwrap();
        assert!(index.set("persistent", "yes"));
    }
    let index = DirectIndex::open(dir.path()).unwrap();
    assert_eq!(index.get("persistent").as_deref(), Some("yes"));
}
