//! Bounded recently-seen id set.
//!
//! The hosted service delivers at-least-once across two paths (change
//! feed and application broadcast), so receivers pass every message id
//! through one of these to make delivery appear at-most-once. Entries
//! age out of a sliding time window and the set evicts oldest-first
//! past a fixed capacity, so a long-lived session cannot grow it
//! without bound.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use uuid::Uuid;

const DEFAULT_WINDOW_SECS: u64 = 300;
const DEFAULT_CAPACITY: usize = 4096;

/// Sliding-window set of recently processed ids.
#[derive(Debug)]
pub struct RecentIds {
    seen: HashSet<Uuid>,
    order: VecDeque<(Instant, Uuid)>,
    window: Duration,
    capacity: usize,
}

impl RecentIds {
    #[must_use]
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self { seen: HashSet::new(), order: VecDeque::new(), window, capacity }
    }

    /// Record an id. Returns `false` if it was already present — the
    /// caller should drop the event without firing handlers.
    pub fn insert(&mut self, id: Uuid) -> bool {
        self.insert_at(id, Instant::now())
    }

    /// Internal: insert with explicit timestamp (for testing).
    pub(crate) fn insert_at(&mut self, id: Uuid, now: Instant) -> bool {
        self.prune(now);
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back((now, id));
        while self.order.len() > self.capacity {
            if let Some((_, evicted)) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(inserted, id)) = self.order.front() {
            if now.duration_since(inserted) > self.window {
                self.order.pop_front();
                self.seen.remove(&id);
            } else {
                break;
            }
        }
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for RecentIds {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_WINDOW_SECS), DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
#[path = "dedup_test.rs"]
mod tests;
