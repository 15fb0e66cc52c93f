//! Per-node monitor loops and the per-cluster registry that reconciles them
//! against the current member set.
//!
//! Keyed the same way `FailureManager` is (`DashMap<SocketAddress, ...>`),
//! but holding a `ControllerHandle` per entry instead of passive state,
//! since a monitor's lifetime is a spawned task that must be cancelled, not
//! just dropped, when a node leaves the member set.

use crate::address::SocketAddress;
use crate::config::MonitorConfig;
use crate::failure::FailureManager;
use crate::monitor::class::{self, MonitorClass, Outcome};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// `SetFade(now, 5 minutes)` on a probe reporting `Fade`. Fixed per the
/// spec rather than configurable.
const FADE_DURATION: Duration = Duration::from_secs(5 * 60);

struct ControllerHandle {
    handle: JoinHandle<()>,
}

impl Drop for ControllerHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// One entry per `(address, monitor index)` pair currently being probed for
/// a given cluster.
pub struct MonitorSet {
    cluster_name: Arc<str>,
    configs: Arc<[MonitorConfig]>,
    failures: Arc<FailureManager>,
    controllers: DashMap<(SocketAddress, usize), ControllerHandle>,
}

impl MonitorSet {
    pub fn new(cluster_name: Arc<str>, configs: Vec<MonitorConfig>, failures: Arc<FailureManager>) -> Self {
        Self { cluster_name, configs: configs.into(), failures, controllers: DashMap::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Spawn controllers for newly seen addresses, cancel controllers for
    /// addresses no longer in `addrs`. Cheap no-op when membership hasn't
    /// changed since the last call.
    pub fn reconcile(&self, addrs: &[SocketAddress]) {
        if self.configs.is_empty() {
            return;
        }

        let live: HashSet<SocketAddress> = addrs.iter().cloned().collect();
        self.controllers.retain(|(addr, _), _| live.contains(addr));

        for addr in addrs {
            for (idx, cfg) in self.configs.iter().enumerate() {
                let key = (addr.clone(), idx);
                if self.controllers.contains_key(&key) {
                    continue;
                }
                let class = match MonitorClass::from_config(cfg) {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::warn!(
                            "monitor: bad config, cluster={}, error={}",
                            self.cluster_name,
                            e
                        );
                        continue;
                    }
                };
                let handle = spawn_loop(
                    self.cluster_name.clone(),
                    addr.clone(),
                    class,
                    Duration::from_secs(cfg.interval_secs),
                    Duration::from_secs(cfg.timeout_secs),
                    cfg.port,
                    self.failures.clone(),
                );
                self.controllers.insert(key, ControllerHandle { handle });
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.controllers.len()
    }
}

fn spawn_loop(
    cluster_name: Arc<str>,
    addr: SocketAddress,
    class: MonitorClass,
    interval: Duration,
    timeout: Duration,
    port_override: Option<u16>,
    failures: Arc<FailureManager>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately; probe right away so a freshly
        // discovered node isn't treated as healthy purely by default.
        loop {
            ticker.tick().await;
            let now = std::time::Instant::now();
            let info = failures.make(&addr);

            let (result_label, err) = match class::run_once(&addr, port_override, &class, timeout).await {
                Ok(Outcome::Success) => {
                    // Success: clears MONITOR and FADE; CONNECT/PROTOCOL are
                    // untouched (those are this gateway's own passive state,
                    // not this probe's concern).
                    info.unset(crate::failure::FailureStatus::Monitor, now);
                    info.unset(crate::failure::FailureStatus::Fade, now);
                    tracing::debug!("monitor: success, cluster={}, node={}", cluster_name, addr);
                    ("success", None)
                }
                Ok(Outcome::Fade) => {
                    info.set_fade(now, FADE_DURATION);
                    tracing::info!(
                        "monitor: fade, cluster={}, node={}, duration={:?}",
                        cluster_name,
                        addr,
                        FADE_DURATION
                    );
                    ("fade", None)
                }
                Err(e) => {
                    info.set_monitor();
                    tracing::warn!(
                        "monitor: probe failed, cluster={}, node={}, error={}",
                        cluster_name,
                        addr,
                        e
                    );
                    ("failure", Some(e))
                }
            };

            metrics::counter!(
                "gateway_monitor_probe_total",
                "cluster" => cluster_name.to_string(),
                "node" => addr.to_string(),
                "result" => result_label,
            )
            .increment(1);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;

    fn addr(s: &str) -> SocketAddress {
        SocketAddress::inet(s.parse().unwrap())
    }

    fn connect_monitor() -> MonitorConfig {
        MonitorConfig {
            kind: "connect".to_string(),
            interval_secs: 3600,
            timeout_secs: 1,
            port: None,
            send: None,
            expect: None,
            fade_expect: None,
        }
    }

    #[tokio::test]
    async fn reconcile_spawns_one_controller_per_address_per_monitor() {
        let set = MonitorSet::new(
            Arc::from("c1"),
            vec![connect_monitor()],
            Arc::new(FailureManager::new()),
        );
        set.reconcile(&[addr("10.0.0.1:80"), addr("10.0.0.2:80")]);
        assert_eq!(set.active_count(), 2);
    }

    #[tokio::test]
    async fn reconcile_drops_controllers_for_removed_addresses() {
        let set = MonitorSet::new(
            Arc::from("c1"),
            vec![connect_monitor()],
            Arc::new(FailureManager::new()),
        );
        set.reconcile(&[addr("10.0.0.1:80"), addr("10.0.0.2:80")]);
        set.reconcile(&[addr("10.0.0.1:80")]);
        assert_eq!(set.active_count(), 1);
    }

    #[tokio::test]
    async fn reconcile_is_idempotent_for_unchanged_membership() {
        let set = MonitorSet::new(
            Arc::from("c1"),
            vec![connect_monitor()],
            Arc::new(FailureManager::new()),
        );
        set.reconcile(&[addr("10.0.0.1:80")]);
        set.reconcile(&[addr("10.0.0.1:80")]);
        assert_eq!(set.active_count(), 1);
    }

    #[tokio::test]
    async fn empty_config_list_reconciles_to_nothing() {
        let set = MonitorSet::new(Arc::from("c1"), vec![], Arc::new(FailureManager::new()));
        set.reconcile(&[addr("10.0.0.1:80")]);
        assert_eq!(set.active_count(), 0);
    }
}
