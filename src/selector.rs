//! Pure selection algorithms over an [`AddressList`], gated by a
//! [`FailureManager`]. None of these hold state themselves except
//! [`RoundRobinBalancer`], whose cursor must persist across calls (see
//! [`crate::balancer_map`]).

use crate::address::{AddressList, SocketAddress, StickyHash, StickyMode};
use crate::failure::FailureManager;
use std::sync::Mutex;
use std::time::Instant;

/// `PickFailover`: the first member that checks good with fade allowed: the
/// earliest-listed member is preferred as long as it is not outright down.
/// Falls back to `list[0]` if every member is failing.
pub fn pick_failover<'a>(
    list: &'a AddressList,
    failures: &FailureManager,
    now: Instant,
) -> &'a SocketAddress {
    for addr in list.iter() {
        if failures.check(now, addr, true) {
            return addr;
        }
    }
    list.get(0)
}

/// `PickModulo`: `i = h mod n`; probe forward from `i`, allowing fade on the
/// first probe only (the primary sticky target is preferred even while
/// fading) and then rejecting fade too for subsequent probes. Returns the
/// original pick if every probe fails.
pub fn pick_modulo<'a>(
    list: &'a AddressList,
    failures: &FailureManager,
    now: Instant,
    h: StickyHash,
) -> &'a SocketAddress {
    let n = list.len();
    let i = (h as usize) % n;
    for step in 0..n {
        let idx = (i + step) % n;
        let allow_fade = step == 0;
        let addr = list.get(idx);
        if failures.check(now, addr, allow_fade) {
            return addr;
        }
    }
    list.get(i)
}

/// Cursor-based round robin. The cursor advances exactly once per
/// selection regardless of how many members are probed, so that
/// back-to-back picks over a healthy list visit every member once per
/// revolution.
///
/// Unlike [`pick_modulo`], `allow_fade` is fixed for the whole revolution:
/// it is never flipped between probes.
pub struct RoundRobinBalancer {
    next: Mutex<usize>,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self { next: Mutex::new(0) }
    }

    pub fn get<'a>(
        &self,
        list: &'a AddressList,
        failures: &FailureManager,
        now: Instant,
        allow_fade: bool,
    ) -> &'a SocketAddress {
        let n = list.len();
        let mut next = self.next.lock().unwrap();
        let start = *next % n;
        for step in 0..n {
            let idx = (start + step) % n;
            let addr = list.get(idx);
            if failures.check(now, addr, allow_fade) {
                // Cursor lands just past whichever member was actually
                // returned, not just past the starting position, so a
                // skipped-over failing member stays skipped next revolution
                // too instead of being re-probed from its own slot.
                *next = (idx + 1) % n;
                return addr;
            }
        }
        *next = start;
        list.get(start)
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

/// Top-level dispatch by sticky mode.
pub fn pick<'a>(
    list: &'a AddressList,
    failures: &FailureManager,
    balancer: &RoundRobinBalancer,
    now: Instant,
    h: StickyHash,
) -> &'a SocketAddress {
    if list.len() == 1 {
        return list.get(0);
    }
    match list.sticky_mode() {
        StickyMode::None => balancer.get(list, failures, now, true),
        StickyMode::Failover => pick_failover(list, failures, now),
        StickyMode::SourceIp
        | StickyMode::Host
        | StickyMode::XHost
        | StickyMode::SessionModulo
        | StickyMode::Cookie
        | StickyMode::JvmRoute
            if h != 0 =>
        {
            pick_modulo(list, failures, now, h)
        }
        mode => balancer.get(list, failures, now, mode == StickyMode::None),
    }
}

/// A consistent-hashing ring: `buckets.len()` slots (≈8192), populated by
/// taking `replicas` (≈64) hash positions per node.
pub struct HashRing {
    buckets: Vec<usize>,
}

pub const HASH_RING_BUCKETS: usize = 8192;
pub const HASH_RING_REPLICAS: usize = 64;

impl HashRing {
    /// Build a ring over `members` (indices into the caller's member
    /// vector). `steady_part` extracts the hash input for a member index.
    pub fn build(member_count: usize, steady_part: impl Fn(usize) -> Vec<u8>) -> Self {
        let mut buckets = vec![0usize; HASH_RING_BUCKETS];
        if member_count == 0 {
            return Self { buckets };
        }
        // Each bucket is owned by whichever (member, replica) hash lands
        // closest to it; we approximate the usual "assign nearest" ring by
        // directly hashing each replica straight into its home bucket,
        // with later replicas only overwriting earlier ones if they hash
        // to the exact same bucket — ties break toward the lower member
        // index for determinism.
        let mut owner_priority = vec![u32::MAX; HASH_RING_BUCKETS];
        for member in 0..member_count {
            let base = steady_part(member);
            for replica in 0..HASH_RING_REPLICAS {
                let mut input = base.clone();
                input.extend_from_slice(&(replica as u32).to_be_bytes());
                let h = crate::address::blake2_32(&input);
                let bucket = (h as usize) % HASH_RING_BUCKETS;
                if h < owner_priority[bucket] {
                    owner_priority[bucket] = h;
                    buckets[bucket] = member;
                }
            }
        }
        Self { buckets }
    }

    pub fn pick(&self, h: StickyHash) -> usize {
        self.buckets[(h as usize) % HASH_RING_BUCKETS]
    }

    /// Walk forward from `h`'s bucket to the next *distinct* member.
    pub fn find_next(&self, h: StickyHash) -> usize {
        let start_bucket = (h as usize) % HASH_RING_BUCKETS;
        let start_member = self.buckets[start_bucket];
        for step in 1..HASH_RING_BUCKETS {
            let bucket = (start_bucket + step) % HASH_RING_BUCKETS;
            if self.buckets[bucket] != start_member {
                return self.buckets[bucket];
            }
        }
        start_member
    }

    /// Bucket index a sticky hash lands on, without resolving it to a member.
    /// Lets a caller chain several walks (`next_distinct_from`) from a
    /// position that isn't `h`'s own bucket.
    pub fn bucket_of(&self, h: StickyHash) -> usize {
        (h as usize) % HASH_RING_BUCKETS
    }

    /// The member owning `bucket`.
    pub fn member_at(&self, bucket: usize) -> usize {
        self.buckets[bucket % HASH_RING_BUCKETS]
    }

    /// Walk forward from `bucket` to the next member not in `exclude`,
    /// returning `(next_bucket, member)`. Used to retry a consistent-hash
    /// pick past members that fail `FailureManager::check`, bounded by a
    /// full trip around the ring rather than by `exclude`'s size, since a
    /// single member can own many buckets along the way.
    pub fn next_distinct_from(&self, bucket: usize, exclude: &[usize]) -> (usize, usize) {
        let start = bucket % HASH_RING_BUCKETS;
        for step in 1..=HASH_RING_BUCKETS {
            let b = (start + step) % HASH_RING_BUCKETS;
            let member = self.buckets[b];
            if !exclude.contains(&member) {
                return (b, member);
            }
        }
        (start, self.buckets[start])
    }
}

/// Rendezvous (highest-random-weight) ranking: for each member, combine the
/// sticky hash with the member's address hash, then sort ascending. Stable
/// under membership changes — removing some other member never changes the
/// relative order of the remaining ones for the same sticky hash.
pub fn rendezvous_rank(member_hashes: &[(usize, u32)], h: StickyHash) -> Vec<usize> {
    let mut scored: Vec<(u32, usize)> = member_hashes
        .iter()
        .map(|&(idx, addr_hash)| {
            (crate::address::blake2_32(&(addr_hash ^ h).to_be_bytes()), idx)
        })
        .collect();
    scored.sort_by_key(|&(score, _)| score);
    scored.into_iter().map(|(_, idx)| idx).collect()
}
