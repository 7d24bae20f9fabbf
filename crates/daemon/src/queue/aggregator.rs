// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Anvil Contributors

//! Fair merge of several task queues into one consumer stream.
//!
//! Consumers place an order per pop; one puller thread per aggregated
//! queue serves pending orders from its queue. After close, pending orders
//! fail and leftovers drain by direct pop in aggregation order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::queue::TaskQueue;

struct Orders<T> {
    pending: usize,
    delivered: VecDeque<T>,
}

struct Shared<T> {
    orders: Mutex<Orders<T>>,
    /// Wakes pullers when an order arrives or the aggregator closes.
    pull_condition: Condvar,
    /// Wakes consumers when an item is delivered or the aggregator closes.
    done_condition: Condvar,
    closed: AtomicBool,
}

pub struct QueueAggregator<T> {
    shared: Arc<Shared<T>>,
    queues: Vec<Arc<TaskQueue<T>>>,
    pullers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> QueueAggregator<T> {
    pub fn new() -> Self {
        QueueAggregator {
            shared: Arc::new(Shared {
                orders: Mutex::new(Orders {
                    pending: 0,
                    delivered: VecDeque::new(),
                }),
                pull_condition: Condvar::new(),
                done_condition: Condvar::new(),
                closed: AtomicBool::new(false),
            }),
            queues: Vec::new(),
            pullers: Mutex::new(Vec::new()),
        }
    }

    /// Add a queue to the merge. Not thread-safe; call during setup only.
    pub fn aggregate(&mut self, queue: Arc<TaskQueue<T>>) {
        self.queues.push(Arc::clone(&queue));
        let shared = Arc::clone(&self.shared);
        let builder = std::thread::Builder::new().name("queue-aggregator".to_string());
        match builder.spawn(move || Self::do_pull(&shared, &queue)) {
            Ok(handle) => {
                let mut pullers = self.pullers.lock().unwrap_or_else(|e| e.into_inner());
                pullers.push(handle);
            }
            Err(e) => tracing::error!("failed to spawn aggregator puller: {}", e),
        }
    }

    fn do_pull(shared: &Shared<T>, queue: &TaskQueue<T>) {
        loop {
            {
                let mut orders = shared.orders.lock().unwrap_or_else(|e| e.into_inner());
                while orders.pending == 0 && !shared.closed.load(Ordering::Acquire) {
                    orders = shared
                        .pull_condition
                        .wait(orders)
                        .unwrap_or_else(|e| e.into_inner());
                }
            }
            if shared.closed.load(Ordering::Acquire) {
                break;
            }

            // Blocks until the queue yields or closes. Racing pullers may
            // both serve one order; the surplus item stays buffered for
            // the next consumer, it is never lost.
            let Some(item) = queue.pop_any() else {
                break;
            };

            let mut orders = shared.orders.lock().unwrap_or_else(|e| e.into_inner());
            orders.delivered.push_back(item);
            orders.pending = orders.pending.saturating_sub(1);
            drop(orders);
            shared.done_condition.notify_one();
        }
    }

    /// Returns `None` only after close, once the buffered and aggregated
    /// leftovers are exhausted.
    pub fn pop(&self) -> Option<T> {
        let shared = &self.shared;
        let mut orders = shared.orders.lock().unwrap_or_else(|e| e.into_inner());

        if !shared.closed.load(Ordering::Acquire) {
            orders.pending += 1;
            shared.pull_condition.notify_all();
        }

        loop {
            if let Some(item) = orders.delivered.pop_front() {
                return Some(item);
            }
            if shared.closed.load(Ordering::Acquire) {
                break;
            }
            orders = shared
                .done_condition
                .wait(orders)
                .unwrap_or_else(|e| e.into_inner());
        }
        drop(orders);

        // Closed: drain directly, in aggregation order.
        for queue in &self.queues {
            if let Some(item) = queue.try_pop_any() {
                return Some(item);
            }
        }
        None
    }

    /// The aggregated queues must be closed first, or the pullers cannot
    /// be joined.
    pub fn close(&self) {
        {
            let mut orders = self.shared.orders.lock().unwrap_or_else(|e| e.into_inner());
            self.shared.closed.store(true, Ordering::Release);
            orders.pending = 0;
        }
        self.shared.pull_condition.notify_all();
        self.shared.done_condition.notify_all();

        let mut pullers = self.pullers.lock().unwrap_or_else(|e| e.into_inner());
        for handle in pullers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl<T: Send + 'static> Default for QueueAggregator<T> {
    fn default() -> Self {
        QueueAggregator::new()
    }
}

#[cfg(test)]
#[path = "aggregator_tests.rs"]
mod tests;
