//! Per-address-list round-robin cursor cache.
//!
//! Without caching, a fresh [`crate::selector::RoundRobinBalancer`] would be
//! built (and start its cursor back at zero) on every request, bunching
//! traffic on the first address of a list. `BalancerMap` keeps one
//! persistent balancer per distinct address list, keyed by the list's
//! content hash, evicting the least-recently-used entry once it is full.

use crate::selector::RoundRobinBalancer;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Load-tested default sizing; a tunable, not a contract.
pub const DEFAULT_CAPACITY: usize = 2048;

struct Entry {
    balancer: Arc<RoundRobinBalancer>,
    last_used: AtomicU64,
}

/// A bounded cache mapping `AddressList::list_hash()` to a persistent
/// `RoundRobinBalancer`. Eviction is approximate LRU: when inserting a new
/// key would exceed capacity, the globally least-recently-touched entry is
/// removed first.
pub struct BalancerMap {
    entries: DashMap<u32, Entry>,
    capacity: usize,
    clock: AtomicU64,
}

impl BalancerMap {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { entries: DashMap::new(), capacity, clock: AtomicU64::new(0) }
    }

    /// `MakeRoundRobinBalancer(hash_key)`: returns the balancer for this
    /// list, creating it (and evicting if at capacity) if absent.
    pub fn make_round_robin_balancer(&self, list_hash: u32) -> Arc<RoundRobinBalancer> {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        if let Some(entry) = self.entries.get(&list_hash) {
            entry.last_used.store(tick, Ordering::Relaxed);
            return entry.balancer.clone();
        }

        if self.entries.len() >= self.capacity {
            self.evict_one();
        }

        self.entries
            .entry(list_hash)
            .or_insert_with(|| Entry {
                balancer: Arc::new(RoundRobinBalancer::new()),
                last_used: AtomicU64::new(tick),
            })
            .balancer
            .clone()
    }

    fn evict_one(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.last_used.load(Ordering::Relaxed))
            .map(|e| *e.key());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for BalancerMap {
    fn default() -> Self {
        Self::new()
    }
}
