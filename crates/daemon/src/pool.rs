// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Anvil Contributors

//! Fixed-size worker pools with cooperative shutdown.
//!
//! Workers are plain OS threads running a caller-supplied loop; liveness
//! comes from the queues they pop, which are closed before the pool is
//! dropped. The pool only provides the shutdown flag and the join.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

struct ShutdownState {
    flag: AtomicBool,
    mutex: Mutex<()>,
    condition: Condvar,
}

/// Cheap handle onto a pool's shutdown flag, passed into every worker.
#[derive(Clone)]
pub struct ShutdownToken(Arc<ShutdownState>);

impl ShutdownToken {
    pub fn is_shutting_down(&self) -> bool {
        self.0.flag.load(Ordering::Acquire)
    }
}

/// A set of worker threads joined on drop.
///
/// The default mode is graceful: threads are joined first and the shutdown
/// flag flips afterwards, so workers must observe liveness through their
/// own queue closes. The forced mode flips the flag before joining.
pub struct WorkerPool {
    state: Arc<ShutdownState>,
    workers: Vec<JoinHandle<()>>,
    force_shutdown: bool,
}

impl WorkerPool {
    pub fn new() -> Self {
        WorkerPool::with_mode(false)
    }

    pub fn forced() -> Self {
        WorkerPool::with_mode(true)
    }

    fn with_mode(force_shutdown: bool) -> Self {
        WorkerPool {
            state: Arc::new(ShutdownState {
                flag: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condition: Condvar::new(),
            }),
            workers: Vec::new(),
            force_shutdown,
        }
    }

    pub fn token(&self) -> ShutdownToken {
        ShutdownToken(Arc::clone(&self.state))
    }

    /// Spawn `count` threads running `worker(token)`.
    pub fn add_worker<F>(&mut self, name: &str, worker: F, count: u32)
    where
        F: Fn(&ShutdownToken) + Send + Sync + 'static,
    {
        debug_assert!(count > 0);
        let worker = Arc::new(worker);
        for _ in 0..count {
            let worker = Arc::clone(&worker);
            let token = self.token();
            let builder = std::thread::Builder::new().name(name.to_string());
            match builder.spawn(move || worker(&token)) {
                Ok(handle) => self.workers.push(handle),
                Err(e) => tracing::error!("failed to spawn worker {}: {}", name, e),
            }
        }
    }

    /// Block up to `duration` or until shutdown begins. Returns true only
    /// if shutdown has begun.
    pub fn wait_until_shutdown(&self, duration: Duration) -> bool {
        if self.state.flag.load(Ordering::Acquire) {
            return true;
        }
        if duration.is_zero() {
            return false;
        }

        let guard = self.state.mutex.lock().unwrap_or_else(|e| e.into_inner());
        let (_guard, result) = self
            .state
            .condition
            .wait_timeout_while(guard, duration, |_| {
                !self.state.flag.load(Ordering::Acquire)
            })
            .unwrap_or_else(|e| e.into_inner());
        !result.timed_out() || self.state.flag.load(Ordering::Acquire)
    }

    fn begin_shutdown(&self) {
        let _guard = self.state.mutex.lock().unwrap_or_else(|e| e.into_inner());
        self.state.flag.store(true, Ordering::Release);
        self.state.condition.notify_all();
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        WorkerPool::new()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.force_shutdown {
            self.begin_shutdown();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        if !self.force_shutdown {
            self.begin_shutdown();
        }
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// A thread pool executing submitted closures; the networking layer uses
/// one to run read/send completions off the accept thread.
pub struct TaskRunner {
    queue: Arc<crate::queue::TaskQueue<Job>>,
    // Dropped after the queue is closed; keeps the join in one place.
    _pool: WorkerPool,
}

impl TaskRunner {
    pub fn new(name: &str, threads: u32) -> Self {
        let queue = Arc::new(crate::queue::TaskQueue::<Job>::unbounded());
        let mut pool = WorkerPool::new();
        {
            let queue = Arc::clone(&queue);
            pool.add_worker(
                name,
                move |_token| {
                    while let Some(job) = queue.pop_any() {
                        job();
                    }
                },
                threads,
            );
        }
        TaskRunner { queue, _pool: pool }
    }

    /// Returns false when the runner is shutting down.
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.queue.push(Box::new(job), crate::queue::DEFAULT_SHARD)
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.queue.close();
    }
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
