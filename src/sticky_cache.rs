//! Bounded map from sticky hash to the member key last chosen for it, used
//! by the Zeroconf `CACHE` sticky method.
//!
//! Segmented into ~4093 buckets: under a shared, multi-threaded
//! `FailureManager`/`Cluster` model, independent shards let lookups lock
//! independently rather than contending on one giant mutex (a
//! `Mutex<lru::LruCache<..>>` per shard).

use crate::address::StickyHash;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Load-tested default sizing: a tunable, not a contract.
pub const DEFAULT_TOTAL_SLOTS: usize = 32768;
pub const DEFAULT_SHARDS: usize = 4093;

pub struct StickyCache {
    shards: Vec<Mutex<LruCache<StickyHash, String>>>,
}

impl StickyCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOTAL_SLOTS, DEFAULT_SHARDS)
    }

    pub fn with_capacity(total_slots: usize, shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        let per_shard = (total_slots / shard_count).max(1);
        let cap = NonZeroUsize::new(per_shard).unwrap();
        let shards = (0..shard_count).map(|_| Mutex::new(LruCache::new(cap))).collect();
        Self { shards }
    }

    fn shard_for(&self, hash: StickyHash) -> &Mutex<LruCache<StickyHash, String>> {
        &self.shards[(hash as usize) % self.shards.len()]
    }

    pub fn get(&self, hash: StickyHash) -> Option<String> {
        self.shard_for(hash).lock().unwrap().get(&hash).cloned()
    }

    pub fn insert(&self, hash: StickyHash, member_key: String) {
        self.shard_for(hash).lock().unwrap().put(hash, member_key);
    }
}

impl Default for StickyCache {
    fn default() -> Self {
        Self::new()
    }
}
