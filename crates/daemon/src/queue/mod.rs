// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Anvil Contributors

//! Bounded multi-consumer FIFO with per-shard ordering.
//!
//! Pipeline stages hand tasks to each other through these queues. A shard
//! tags items with affinity for a particular consumer (a remote worker);
//! consumers prefer their own shard but fall back to the global head, so a
//! shardless queue degenerates to a plain FIFO on shard zero.

pub mod aggregator;

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::pool::ShutdownToken;

pub const UNLIMITED: u64 = 0;
pub const DEFAULT_SHARD: u32 = 0;
pub const NOT_STRICT_SHARDING: u32 = 0;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct Inner<T> {
    /// Central FIFO keyed by a monotonically increasing sequence number.
    items: BTreeMap<u64, (u32, T)>,
    /// Shard id -> sequence numbers, oldest first. Grows, never shrinks.
    shards: Vec<VecDeque<u64>>,
    next_seq: u64,
}

impl<T> Inner<T> {
    /// Pop the oldest item tagged with `shard`, falling back to the global
    /// head when the shard has nothing queued.
    fn take_preferred(&mut self, shard: u32) -> Option<T> {
        if let Some(seqs) = self.shards.get_mut(shard as usize)
            && let Some(seq) = seqs.pop_front()
        {
            let (_, item) = self.items.remove(&seq)?;
            return Some(item);
        }
        self.take_front()
    }

    /// Pop the global FIFO head.
    fn take_front(&mut self) -> Option<T> {
        let seq = *self.items.keys().next()?;
        let (shard, item) = self.items.remove(&seq)?;
        // The global head is necessarily the oldest item of its own shard.
        if let Some(seqs) = self.shards.get_mut(shard as usize) {
            debug_assert_eq!(seqs.front(), Some(&seq));
            seqs.pop_front();
        }
        Some(item)
    }

    /// Pop from `shard` only.
    fn take_strict(&mut self, shard: u32) -> Option<T> {
        let seq = self.shards.get_mut(shard as usize)?.pop_front()?;
        let (_, item) = self.items.remove(&seq)?;
        Some(item)
    }

    fn shard_len(&self, shard: u32) -> usize {
        self.shards
            .get(shard as usize)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}

/// Multi-consumer FIFO of move-only items with capacity, close, and
/// shard-preferring pops.
pub struct TaskQueue<T> {
    inner: Mutex<Inner<T>>,
    pop_condition: Condvar,
    capacity: u64,
    timeout: Option<Duration>,
    size: AtomicU64,
    closed: AtomicBool,
}

impl<T: Send> TaskQueue<T> {
    /// `capacity == UNLIMITED` never rejects on size. `pop_timeout` is
    /// required for the shutdown-aware pops.
    pub fn new(capacity: u64, pop_timeout: Option<Duration>) -> Self {
        TaskQueue {
            inner: Mutex::new(Inner {
                items: BTreeMap::new(),
                shards: Vec::new(),
                next_seq: 0,
            }),
            pop_condition: Condvar::new(),
            capacity,
            timeout: pop_timeout,
            size: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn unbounded() -> Self {
        TaskQueue::new(UNLIMITED, None)
    }

    /// Returns false only when the queue is closed or the capacity is
    /// exceeded.
    pub fn push(&self, item: T, shard: u32) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        {
            let mut inner = lock(&self.inner);
            if self.capacity != UNLIMITED && inner.items.len() as u64 >= self.capacity {
                return false;
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            if shard as usize >= inner.shards.len() {
                inner.shards.resize_with(shard as usize + 1, VecDeque::new);
            }
            inner.items.insert(seq, (shard, item));
            inner.shards[shard as usize].push_back(seq);
        }
        self.size.fetch_add(1, Ordering::AcqRel);
        self.pop_condition.notify_one();

        true
    }

    /// Blocks until an item is available or the queue is closed and empty.
    pub fn pop(&self, shard: u32) -> Option<T> {
        self.pop_inner(|inner| inner.take_preferred(shard))
    }

    /// Blocking pop of the global FIFO head, ignoring shard preference.
    pub(crate) fn pop_any(&self) -> Option<T> {
        self.pop_inner(Inner::take_front)
    }

    fn pop_inner(&self, take: impl Fn(&mut Inner<T>) -> Option<T>) -> Option<T> {
        let mut inner = lock(&self.inner);
        loop {
            if !inner.items.is_empty() {
                break;
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            inner = self
                .pop_condition
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
        let item = take(&mut inner);
        if item.is_some() {
            self.size.fetch_sub(1, Ordering::AcqRel);
        }
        item
    }

    /// Non-blocking pop of the global FIFO head; used to drain after close.
    pub(crate) fn try_pop_any(&self) -> Option<T> {
        let mut inner = lock(&self.inner);
        let item = inner.take_front();
        if item.is_some() {
            self.size.fetch_sub(1, Ordering::AcqRel);
        }
        item
    }

    /// Shutdown-aware pop. Returns `None` when the queue is closed and
    /// empty or when the pool is shutting down.
    ///
    /// With `strict_limit != NOT_STRICT_SHARDING` and the shard backed up
    /// past the limit, only that shard is served; this keeps an overloaded
    /// remote's queue from leaking onto workers with other affinities.
    pub fn pop_or_shutdown(
        &self,
        token: &ShutdownToken,
        strict_limit: u32,
        shard: u32,
    ) -> Option<T> {
        debug_assert!(self.timeout.is_some());
        let timeout = self.timeout.unwrap_or(Duration::from_secs(1));

        let inner = lock(&self.inner);
        let overloaded =
            strict_limit != NOT_STRICT_SHARDING && inner.shard_len(shard) as u32 >= strict_limit;

        if overloaded {
            self.pop_strict(inner, token, timeout, shard)
        } else {
            self.pop_with_hint(inner, token, timeout, shard)
        }
    }

    fn pop_with_hint(
        &self,
        mut inner: MutexGuard<'_, Inner<T>>,
        token: &ShutdownToken,
        timeout: Duration,
        shard: u32,
    ) -> Option<T> {
        loop {
            let closed = self.closed.load(Ordering::Acquire);
            if closed || !inner.items.is_empty() || token.is_shutting_down() {
                break;
            }
            inner = self
                .pop_condition
                .wait_timeout(inner, timeout)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        if inner.items.is_empty() || token.is_shutting_down() {
            return None;
        }
        let item = inner.take_preferred(shard);
        if item.is_some() {
            self.size.fetch_sub(1, Ordering::AcqRel);
        }
        item
    }

    fn pop_strict(
        &self,
        mut inner: MutexGuard<'_, Inner<T>>,
        token: &ShutdownToken,
        timeout: Duration,
        shard: u32,
    ) -> Option<T> {
        loop {
            let closed = self.closed.load(Ordering::Acquire);
            if closed || inner.shard_len(shard) > 0 || token.is_shutting_down() {
                break;
            }
            inner = self
                .pop_condition
                .wait_timeout(inner, timeout)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        if inner.shard_len(shard) == 0 || token.is_shutting_down() {
            return None;
        }
        let item = inner.take_strict(shard);
        if item.is_some() {
            self.size.fetch_sub(1, Ordering::AcqRel);
        }
        item
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Wakes every blocked popper; they drain the remainder and then
    /// observe `None`.
    pub fn close(&self) {
        let _inner = lock(&self.inner);
        self.closed.store(true, Ordering::Release);
        self.pop_condition.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
