//! Per-address failure tracking with independently expiring statuses.
//!
//! A `DashMap` keyed by address owns one reference-counted record per
//! known endpoint, and each record guards its mutable fields behind a
//! small `Mutex` rather than trying to make every field independently
//! atomic.

use crate::address::SocketAddress;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Ordered least to most severe. `PartialOrd`/`Ord` follow declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FailureStatus {
    Ok,
    Fade,
    Protocol,
    Connect,
    Monitor,
}

/// How many consecutive protocol errors must land before `PROTOCOL` is
/// reported as active. Preserved from the source implementation; exposed as
/// a tunable but defaults to this value (see config).
pub const DEFAULT_PROTOCOL_THRESHOLD: u32 = 8;

struct Expiries {
    fade_expires: Option<Instant>,
    protocol_expires: Option<Instant>,
    connect_expires: Option<Instant>,
}

impl Expiries {
    fn cleared() -> Self {
        Self { fade_expires: None, protocol_expires: None, connect_expires: None }
    }
}

/// One record per known address. Outlives the cluster that first created it
/// for as long as any `Arc<FailureInfo>` handle (including the one held
/// inside the `FailureManager`'s map) is alive.
pub struct FailureInfo {
    addr: SocketAddress,
    expiries: std::sync::Mutex<Expiries>,
    protocol_counter: AtomicU32,
    protocol_threshold: u32,
    monitor: std::sync::atomic::AtomicBool,
}

impl FailureInfo {
    fn new(addr: SocketAddress, protocol_threshold: u32) -> Self {
        Self {
            addr,
            expiries: std::sync::Mutex::new(Expiries::cleared()),
            protocol_counter: AtomicU32::new(0),
            protocol_threshold,
            monitor: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// `Set(status, duration)`.
    pub fn set(&self, status: FailureStatus, now: Instant, duration: Duration) {
        tracing::debug!(addr = %self.addr, status = ?status, duration = ?duration, "failure: set");
        match status {
            FailureStatus::Fade => {
                let mut e = self.expiries.lock().unwrap();
                let candidate = now + duration;
                e.fade_expires = Some(e.fade_expires.map_or(candidate, |cur| cur.max(candidate)));
            }
            FailureStatus::Protocol => {
                let mut e = self.expiries.lock().unwrap();
                let candidate = now + duration;
                e.protocol_expires =
                    Some(e.protocol_expires.map_or(candidate, |cur| cur.max(candidate)));
                self.protocol_counter.fetch_add(1, Ordering::Relaxed);
            }
            FailureStatus::Connect => {
                let mut e = self.expiries.lock().unwrap();
                let candidate = now + duration;
                e.connect_expires =
                    Some(e.connect_expires.map_or(candidate, |cur| cur.max(candidate)));
            }
            FailureStatus::Monitor => {
                self.monitor.store(true, Ordering::Relaxed);
            }
            FailureStatus::Ok => self.unset(FailureStatus::Ok, now),
        }
    }

    /// Convenience used by monitors: `SetFade(now, 5min)`-style calls read
    /// better at the call site than the generic `set`.
    pub fn set_fade(&self, now: Instant, duration: Duration) {
        self.set(FailureStatus::Fade, now, duration);
    }

    pub fn set_monitor(&self) {
        self.set(FailureStatus::Monitor, Instant::now(), Duration::ZERO);
    }

    /// `Unset(status)`.
    pub fn unset(&self, status: FailureStatus, now: Instant) {
        tracing::debug!(addr = %self.addr, status = ?status, "failure: unset");
        match status {
            FailureStatus::Ok => {
                let mut e = self.expiries.lock().unwrap();
                *e = Expiries::cleared();
                self.protocol_counter.store(0, Ordering::Relaxed);
                self.monitor.store(false, Ordering::Relaxed);
            }
            FailureStatus::Fade => {
                self.expiries.lock().unwrap().fade_expires = Some(now - Duration::from_secs(1));
            }
            FailureStatus::Connect => {
                self.expiries.lock().unwrap().connect_expires = Some(now - Duration::from_secs(1));
            }
            FailureStatus::Protocol => {
                let mut e = self.expiries.lock().unwrap();
                e.protocol_expires = None;
                self.protocol_counter.store(0, Ordering::Relaxed);
            }
            FailureStatus::Monitor => {
                self.monitor.store(false, Ordering::Relaxed);
            }
        }
    }

    /// Most severe active status, most-severe-first early exit.
    pub fn get_status(&self, now: Instant) -> FailureStatus {
        if self.monitor.load(Ordering::Relaxed) {
            return FailureStatus::Monitor;
        }
        let e = self.expiries.lock().unwrap();
        if e.connect_expires.is_some_and(|t| t > now) {
            return FailureStatus::Connect;
        }
        if e.protocol_expires.is_some_and(|t| t > now)
            && self.protocol_counter.load(Ordering::Relaxed) >= self.protocol_threshold
        {
            return FailureStatus::Protocol;
        }
        if e.fade_expires.is_some_and(|t| t > now) {
            return FailureStatus::Fade;
        }
        FailureStatus::Ok
    }

    /// `true` iff all statuses pass. `allow_fade` causes `FADE` to be
    /// ignored (treated as good).
    pub fn check(&self, now: Instant, allow_fade: bool) -> bool {
        match self.get_status(now) {
            FailureStatus::Ok => true,
            FailureStatus::Fade => allow_fade,
            _ => false,
        }
    }
}

/// Shared process-wide table of `FailureInfo` records keyed by address.
///
/// Originally single-threaded per worker process; here it is one
/// `Arc<FailureManager>` shared by every cluster, with per-entry mutation
/// serialized by the concurrent map rather than by a global event loop
/// thread.
pub struct FailureManager {
    entries: DashMap<SocketAddress, Arc<FailureInfo>>,
    protocol_threshold: u32,
}

impl FailureManager {
    pub fn new() -> Self {
        Self::with_protocol_threshold(DEFAULT_PROTOCOL_THRESHOLD)
    }

    pub fn with_protocol_threshold(protocol_threshold: u32) -> Self {
        Self { entries: DashMap::new(), protocol_threshold }
    }

    /// `Make(addr)`: returns the existing record or creates one.
    pub fn make(&self, addr: &SocketAddress) -> Arc<FailureInfo> {
        if let Some(entry) = self.entries.get(addr) {
            return entry.value().clone();
        }
        self.entries
            .entry(addr.clone())
            .or_insert_with(|| Arc::new(FailureInfo::new(addr.clone(), self.protocol_threshold)))
            .clone()
    }

    pub fn check(&self, now: Instant, addr: &SocketAddress, allow_fade: bool) -> bool {
        self.make(addr).check(now, allow_fade)
    }

    pub fn get(&self, now: Instant, addr: &SocketAddress) -> FailureStatus {
        self.make(addr).get_status(now)
    }

    /// Drop the record for an address that is no longer known to any
    /// cluster. Safe to call even if other `Arc` handles are still alive
    /// elsewhere (they simply keep the record alive until dropped).
    pub fn forget(&self, addr: &SocketAddress) {
        self.entries.remove(addr);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for FailureManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddress {
        SocketAddress::inet(s.parse().unwrap())
    }

    #[test]
    fn fresh_address_is_ok() {
        let fm = FailureManager::new();
        let now = Instant::now();
        assert_eq!(fm.get(now, &addr("10.0.0.1:80")), FailureStatus::Ok);
        assert!(fm.check(now, &addr("10.0.0.1:80"), false));
    }

    #[test]
    fn connect_failure_gates_check() {
        let fm = FailureManager::new();
        let now = Instant::now();
        let a = addr("10.0.0.1:80");
        fm.make(&a).set(FailureStatus::Connect, now, Duration::from_secs(20));
        assert_eq!(fm.get(now, &a), FailureStatus::Connect);
        assert!(!fm.check(now, &a, false));
        assert!(!fm.check(now, &a, true));
    }

    #[test]
    fn connect_expiry_clears_after_duration() {
        let fm = FailureManager::new();
        let now = Instant::now();
        let a = addr("10.0.0.1:80");
        fm.make(&a).set(FailureStatus::Connect, now, Duration::from_millis(1));
        let later = now + Duration::from_millis(5);
        assert_eq!(fm.get(later, &a), FailureStatus::Ok);
    }

    #[test]
    fn fade_is_skipped_with_allow_fade() {
        let fm = FailureManager::new();
        let now = Instant::now();
        let a = addr("10.0.0.1:80");
        fm.make(&a).set(FailureStatus::Fade, now, Duration::from_secs(300));
        assert_eq!(fm.get(now, &a), FailureStatus::Fade);
        assert!(!fm.check(now, &a, false));
        assert!(fm.check(now, &a, true));
    }

    #[test]
    fn check_false_implies_check_allow_fade_may_still_be_true() {
        // check(allow_fade=false) must never be stricter than check(allow_fade=true).
        let fm = FailureManager::new();
        let now = Instant::now();
        let a = addr("10.0.0.1:80");
        for _ in 0..8 {
            fm.make(&a).set(FailureStatus::Protocol, now, Duration::from_secs(60));
        }
        assert!(!fm.check(now, &a, false));
        assert!(!fm.check(now, &a, true));
    }

    #[test]
    fn protocol_counter_threshold_is_eight() {
        let fm = FailureManager::new();
        let now = Instant::now();
        let a = addr("10.0.0.1:80");
        for _ in 0..7 {
            fm.make(&a).set(FailureStatus::Protocol, now, Duration::from_secs(60));
        }
        assert_eq!(fm.get(now, &a), FailureStatus::Ok);
        fm.make(&a).set(FailureStatus::Protocol, now, Duration::from_secs(60));
        assert_eq!(fm.get(now, &a), FailureStatus::Protocol);
    }

    #[test]
    fn unset_ok_clears_everything() {
        let fm = FailureManager::new();
        let now = Instant::now();
        let a = addr("10.0.0.1:80");
        fm.make(&a).set(FailureStatus::Monitor, now, Duration::ZERO);
        fm.make(&a).set(FailureStatus::Connect, now, Duration::from_secs(20));
        fm.make(&a).unset(FailureStatus::Ok, now);
        assert_eq!(fm.get(now, &a), FailureStatus::Ok);
    }

    #[test]
    fn monitor_never_expires_with_time() {
        let fm = FailureManager::new();
        let now = Instant::now();
        let a = addr("10.0.0.1:80");
        fm.make(&a).set_monitor();
        let much_later = now + Duration::from_secs(3600);
        assert_eq!(fm.get(much_later, &a), FailureStatus::Monitor);
        fm.make(&a).unset(FailureStatus::Monitor, much_later);
        assert_eq!(fm.get(much_later, &a), FailureStatus::Ok);
    }

    #[test]
    fn monitor_success_clears_monitor_and_fade_but_not_connect() {
        let fm = FailureManager::new();
        let now = Instant::now();
        let a = addr("10.0.0.1:80");
        fm.make(&a).set(FailureStatus::Connect, now, Duration::from_secs(20));
        fm.make(&a).set(FailureStatus::Fade, now, Duration::from_secs(300));
        fm.make(&a).set_monitor();

        // monitor success: unset(MONITOR), also clear FADE.
        fm.make(&a).unset(FailureStatus::Monitor, now);
        fm.make(&a).unset(FailureStatus::Fade, now);

        assert_eq!(fm.get(now, &a), FailureStatus::Connect);
    }

    #[test]
    fn severity_ordering() {
        assert!(FailureStatus::Ok < FailureStatus::Fade);
        assert!(FailureStatus::Fade < FailureStatus::Protocol);
        assert!(FailureStatus::Protocol < FailureStatus::Connect);
        assert!(FailureStatus::Connect < FailureStatus::Monitor);
    }
}
