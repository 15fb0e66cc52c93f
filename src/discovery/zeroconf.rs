//! Zeroconf / DNS-SD cluster discovery via `mdns-sd`.
//!
//! Unlike `ConsulClient` (poll a REST endpoint on a timer), mDNS is
//! event-driven: the daemon pushes `ServiceEvent`s as it learns about and
//! loses instances. `ZeroconfExplorer` adapts that push model to the same
//! shape `poll_consul_services` expects elsewhere — a snapshot of currently
//! known nodes — by folding the event stream into an `ArcSwap` that readers
//! consult without blocking on the network.

use crate::config::{UpstreamNode, ZeroconfConfig};
use arc_swap::ArcSwap;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::collections::HashMap;
use std::sync::Arc;

/// A running browse session for one cluster's `ZeroconfConfig`. Dropping it
/// stops the background task and releases the daemon's browse handle.
///
/// Members are keyed by `"addr:port"` rather than flattened into a plain
/// `Vec`, so a `Cluster` can treat a member's key as its stable identity
/// across successive mDNS events — the same key a `FailureManager` entry,
/// hash-ring bucket, or sticky-cache slot is keyed on survives a refresh
/// that only adds or removes other members.
pub struct ZeroconfExplorer {
    members: Arc<ArcSwap<HashMap<String, UpstreamNode>>>,
    _task: tokio::task::JoinHandle<()>,
}

impl ZeroconfExplorer {
    /// `daemon` is shared process-wide: mDNS-SD multicasts on one socket per
    /// host, so every cluster's browse session rides the same `ServiceDaemon`.
    pub fn start(daemon: &ServiceDaemon, cluster_name: Arc<str>, cfg: &ZeroconfConfig) -> anyhow::Result<Self> {
        let service_type = full_service_type(&cfg.service, &cfg.domain);
        let receiver = daemon.browse(&service_type)?;
        let members = Arc::new(ArcSwap::new(Arc::new(HashMap::new())));
        let interface_filter = cfg.interface.clone();

        let members_for_task = members.clone();
        let task = tokio::spawn(async move {
            let mut known: HashMap<String, UpstreamNode> = HashMap::new();
            // mDNS only gives us the instance fullname on removal, not the
            // addr:port keys `known` is indexed by, so we keep the reverse
            // mapping here to resolve a `ServiceRemoved` back to the keys it
            // previously contributed.
            let mut instance_keys: HashMap<String, Vec<String>> = HashMap::new();
            while let Ok(event) = receiver.recv_async().await {
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        if !interface_filter.is_empty() {
                            // mdns-sd does not expose the receiving interface on
                            // `ServiceInfo`; filtering by interface name is left
                            // to the OS-level multicast group membership the
                            // daemon was constructed with.
                        }
                        let fullname = info.get_fullname().to_string();
                        let port = info.get_port();
                        let mut keys_for_instance = Vec::new();
                        for addr in info.get_addresses() {
                            let key = format!("{}:{}", addr, port);
                            keys_for_instance.push(key.clone());
                            known.insert(
                                key,
                                UpstreamNode {
                                    host: addr.to_string(),
                                    port,
                                    weight: 100,
                                    metadata: info
                                        .get_properties()
                                        .iter()
                                        .map(|p| (p.key().to_string(), p.val_str().to_string()))
                                        .collect(),
                                },
                            );
                        }
                        // A re-resolve of the same instance may drop stale
                        // addresses (e.g. an interface went away); remove any
                        // key this instance contributed previously but didn't
                        // re-contribute this time.
                        if let Some(previous) = instance_keys.insert(fullname, keys_for_instance.clone()) {
                            for stale in previous {
                                if !keys_for_instance.contains(&stale) {
                                    known.remove(&stale);
                                }
                            }
                        }
                        members_for_task.store(Arc::new(known.clone()));
                        tracing::info!(
                            "discovery: zeroconf: resolved, cluster={}, service={}, total_nodes={}",
                            cluster_name,
                            service_type,
                            known.len()
                        );
                    }
                    ServiceEvent::ServiceRemoved(_ty, fullname) => {
                        if let Some(keys) = instance_keys.remove(&fullname) {
                            for key in keys {
                                known.remove(&key);
                            }
                        }
                        members_for_task.store(Arc::new(known.clone()));
                        tracing::info!(
                            "discovery: zeroconf: removed, cluster={}, service={}, fullname={}, total_nodes={}",
                            cluster_name,
                            service_type,
                            fullname,
                            known.len()
                        );
                    }
                    _ => {}
                }
            }
        });

        Ok(Self { members, _task: task })
    }

    /// Current member set keyed by `"addr:port"`.
    pub fn members(&self) -> Arc<HashMap<String, UpstreamNode>> {
        self.members.load_full()
    }

    /// Same nodes, flattened — convenient where a caller only needs the
    /// address list itself, not per-member key stability.
    pub fn nodes(&self) -> Vec<UpstreamNode> {
        self.members.load().values().cloned().collect()
    }
}

fn full_service_type(service: &str, domain: &str) -> String {
    if service.ends_with(".local.") || service.ends_with(&format!(".{domain}")) {
        service.to_string()
    } else {
        format!("{service}.{domain}")
    }
}
