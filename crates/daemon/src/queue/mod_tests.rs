#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::*;
use std::sync::Arc;
use std::time::Duration;

use crate::pool::WorkerPool;

#[test]
fn fifo_order_on_default_shard() {
    let queue = TaskQueue::new(UNLIMITED, None);
    for i in 0..5 {
        assert!(queue.push(i, DEFAULT_SHARD));
    }
    for i in 0..5 {
        assert_eq!(queue.pop(DEFAULT_SHARD), Some(i));
    }
}

#[test]
fn capacity_rejects_when_full() {
    let queue = TaskQueue::new(3, None);
    assert!(queue.push(1, DEFAULT_SHARD));
    assert!(queue.push(2, DEFAULT_SHARD));
    assert!(queue.push(3, DEFAULT_SHARD));
    assert!(!queue.push(4, DEFAULT_SHARD));
    assert_eq!(queue.size(), 3);

    assert_eq!(queue.pop(DEFAULT_SHARD), Some(1));
    assert!(queue.push(4, DEFAULT_SHARD));
}

#[test]
fn push_fails_after_close() {
    let queue = TaskQueue::new(UNLIMITED, None);
    assert!(queue.push(1, DEFAULT_SHARD));
    queue.close();
    assert!(queue.is_closed());
    assert!(!queue.push(2, DEFAULT_SHARD));
}

#[test]
fn pop_drains_then_returns_none_after_close() {
    let queue = TaskQueue::new(UNLIMITED, None);
    queue.push(1, DEFAULT_SHARD);
    queue.push(2, DEFAULT_SHARD);
    queue.close();

    assert_eq!(queue.pop(DEFAULT_SHARD), Some(1));
    assert_eq!(queue.pop(DEFAULT_SHARD), Some(2));
    assert_eq!(queue.pop(DEFAULT_SHARD), None);
}

#[test]
fn pop_wakes_on_close() {
    let queue = Arc::new(TaskQueue::<u32>::new(UNLIMITED, None));
    let popper = {
        let queue = Arc::clone(&queue);
        std::thread::spawn(move || queue.pop(DEFAULT_SHARD))
    };
    std::thread::sleep(Duration::from_millis(50));
    queue.close();
    assert_eq!(popper.join().unwrap(), None);
}

#[test]
fn shard_preference_over_global_head() {
    let queue = TaskQueue::new(UNLIMITED, None);
    queue.push("head", 0);
    queue.push("mine", 7);
    queue.push("tail", 0);

    // A shard-7 popper gets its own item first, even though "head" is older.
    assert_eq!(queue.pop(7), Some("mine"));
    assert_eq!(queue.pop(7), Some("head"));
    assert_eq!(queue.pop(7), Some("tail"));
}

#[test]
fn fifo_within_a_shard() {
    let queue = TaskQueue::new(UNLIMITED, None);
    queue.push((3, 'a'), 3);
    queue.push((5, 'x'), 5);
    queue.push((3, 'b'), 3);
    queue.push((3, 'c'), 3);

    assert_eq!(queue.pop(3), Some((3, 'a')));
    assert_eq!(queue.pop(3), Some((3, 'b')));
    assert_eq!(queue.pop(3), Some((3, 'c')));
    assert_eq!(queue.pop(3), Some((5, 'x')));
}

#[test]
fn unknown_shard_falls_back_to_head() {
    let queue = TaskQueue::new(UNLIMITED, None);
    queue.push(1, 0);
    queue.push(2, 1);
    // Shard 9 was never pushed to; popper takes the global head.
    assert_eq!(queue.pop(9), Some(1));
}

#[test]
fn pop_or_shutdown_returns_none_when_pool_shuts_down() {
    let queue = Arc::new(TaskQueue::<u32>::new(
        UNLIMITED,
        Some(Duration::from_millis(20)),
    ));
    let pool = WorkerPool::forced();
    let token = pool.token();

    let popper = {
        let queue = Arc::clone(&queue);
        std::thread::spawn(move || queue.pop_or_shutdown(&token, NOT_STRICT_SHARDING, 0))
    };
    std::thread::sleep(Duration::from_millis(50));
    drop(pool);
    assert_eq!(popper.join().unwrap(), None);
}

#[test]
fn pop_or_shutdown_delivers_items() {
    let queue = TaskQueue::new(UNLIMITED, Some(Duration::from_millis(20)));
    let pool = WorkerPool::new();
    let token = pool.token();

    queue.push(42, DEFAULT_SHARD);
    assert_eq!(
        queue.pop_or_shutdown(&token, NOT_STRICT_SHARDING, DEFAULT_SHARD),
        Some(42)
    );
}

#[test]
fn strict_sharding_serves_only_the_overloaded_shard() {
    let queue = TaskQueue::new(UNLIMITED, Some(Duration::from_millis(20)));
    let pool = WorkerPool::new();
    let token = pool.token();

    queue.push("other", 1);
    queue.push("a", 2);
    queue.push("b", 2);

    // Shard 2 holds two items, at the strict limit: serve it exclusively.
    assert_eq!(queue.pop_or_shutdown(&token, 2, 2), Some("a"));
    // Below the limit again: the global head wins.
    assert_eq!(queue.pop_or_shutdown(&token, 2, 2), Some("other"));
    assert_eq!(queue.pop_or_shutdown(&token, 2, 2), Some("b"));
}

#[test]
fn strict_limit_ignored_below_threshold() {
    let queue = TaskQueue::new(UNLIMITED, Some(Duration::from_millis(20)));
    let pool = WorkerPool::new();
    let token = pool.token();

    queue.push("head", 0);
    queue.push("mine", 5);

    // Shard 5 holds one item, below the limit of 3: normal hinted pop.
    assert_eq!(queue.pop_or_shutdown(&token, 3, 5), Some("mine"));
    assert_eq!(queue.pop_or_shutdown(&token, 3, 5), Some("head"));
}

#[test]
fn size_tracks_pushes_and_pops() {
    let queue = TaskQueue::new(UNLIMITED, None);
    assert_eq!(queue.size(), 0);
    queue.push(1, 0);
    queue.push(2, 4);
    assert_eq!(queue.size(), 2);
    queue.pop(0);
    assert_eq!(queue.size(), 1);
}

#[test]
fn concurrent_producers_and_consumers_preserve_items() {
    let queue = Arc::new(TaskQueue::new(UNLIMITED, None));
    let mut handles = Vec::new();
    for producer in 0..4u32 {
        let queue = Arc::clone(&queue);
        handles.push(std::thread::spawn(move || {
            for i in 0..100u32 {
                assert!(queue.push(producer * 1000 + i, producer));
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    queue.close();

    let mut consumers = Vec::new();
    for shard in 0..4u32 {
        let queue = Arc::clone(&queue);
        consumers.push(std::thread::spawn(move || {
            let mut got = Vec::new();
            while let Some(item) = queue.pop(shard) {
                got.push(item);
            }
            got
        }));
    }
    let total: usize = consumers
        .into_iter()
        .map(|h| h.join().unwrap().len())
        .sum();
    assert_eq!(total, 400);
    assert_eq!(queue.size(), 0);
}
