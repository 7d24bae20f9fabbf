// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Anvil Contributors

//! Round-robin selection of a remote with per-remote in-flight caps.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use super::EndPoint;

/// One configured absorber.
#[derive(Debug, Clone)]
pub struct Remote {
    pub endpoint: EndPoint,
    /// Maximum in-flight compilations this remote accepts from us.
    pub threads: u32,
    pub shard: Option<u32>,
}

pub struct Balancer {
    remotes: Vec<Remote>,
    counter: AtomicUsize,
    in_flight: Vec<AtomicU32>,
}

impl Balancer {
    pub fn new(remotes: Vec<Remote>) -> Self {
        let in_flight = remotes.iter().map(|_| AtomicU32::new(0)).collect();
        Balancer {
            remotes,
            counter: AtomicUsize::new(0),
            in_flight,
        }
    }

    pub fn remotes(&self) -> &[Remote] {
        &self.remotes
    }

    pub fn is_empty(&self) -> bool {
        self.remotes.is_empty()
    }

    /// Walk the remotes round-robin from a global counter, skipping any at
    /// its in-flight cap. A shard hint biases toward the matching remote
    /// first. `None` means every remote is saturated.
    pub fn pick(&self, shard_hint: Option<u32>) -> Option<Lease<'_>> {
        if self.remotes.is_empty() {
            return None;
        }
        if let Some(hint) = shard_hint
            && let Some(lease) = self.pick_matching(|remote| remote.shard == Some(hint))
        {
            return Some(lease);
        }
        self.pick_matching(|_| true)
    }

    fn pick_matching(&self, eligible: impl Fn(&Remote) -> bool) -> Option<Lease<'_>> {
        for _ in 0..self.remotes.len() {
            let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.remotes.len();
            if !eligible(&self.remotes[index]) {
                continue;
            }
            if self.try_acquire(index) {
                return Some(Lease {
                    balancer: self,
                    index,
                });
            }
        }
        None
    }

    fn try_acquire(&self, index: usize) -> bool {
        let cap = self.remotes[index].threads;
        let counter = &self.in_flight[index];
        loop {
            let current = counter.load(Ordering::Acquire);
            if current >= cap {
                return false;
            }
            if counter
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn release(&self, index: usize) {
        self.in_flight[index].fetch_sub(1, Ordering::AcqRel);
    }

    fn in_flight(&self, index: usize) -> u32 {
        self.in_flight[index].load(Ordering::Acquire)
    }
}

/// A claimed in-flight slot; released on drop.
pub struct Lease<'a> {
    balancer: &'a Balancer,
    index: usize,
}

impl Lease<'_> {
    pub fn remote(&self) -> &Remote {
        &self.balancer.remotes[self.index]
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.balancer.release(self.index);
    }
}

#[cfg(test)]
#[path = "balancer_tests.rs"]
mod tests;
