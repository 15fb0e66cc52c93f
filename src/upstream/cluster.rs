use crate::address::{AddressList, SocketAddress, StickyHash, StickyMethod, StickyMode};
use crate::balancer_map::BalancerMap;
use crate::config::{ClusterConfig, KeepalivePoolConfig, UpstreamNode};
use crate::discovery::zeroconf::ZeroconfExplorer;
use crate::failure::{FailureManager, FailureStatus};
use crate::monitor::MonitorSet;
use crate::proxy::context::BoxBody;
use crate::selector::{self, HashRing, RoundRobinBalancer};
use crate::sticky_cache::StickyCache;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use mdns_sd::ServiceDaemon;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A rustls `ServerCertVerifier` that accepts any certificate without validation.
/// Used when `tls_verify: false` — the common case for internal / mesh traffic
/// where encryption is desired but upstream identity verification is not.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Resolved upstream metadata for building the proxy request. The member
/// itself is returned alongside this (as a plain `String` address) rather
/// than carried inside it, since `Cluster::pick` already had to render one
/// to consult `FailureManager`.
pub struct UpstreamTarget {
    pub scheme: Arc<str>,
    pub pass_host: Arc<str>,
    pub upstream_host: Option<Arc<str>>,
}

/// A snapshot of the ring built over a Zeroconf-discovered member set, kept
/// around until the member set actually changes. `member_hash` is the
/// dirty flag: a content hash of the current key set rather than a boolean,
/// since nothing here observes individual join/leave events to flip a bit —
/// only `Cluster::pick_zeroconf` polling `ZeroconfExplorer::members()`.
struct RingState {
    member_hash: u32,
    list: AddressList,
    ring: HashRing,
}

/// Runtime representation of a cluster — owns all per-cluster state.
///
/// This is the "live" counterpart of `ClusterConfig`. While `ClusterConfig` is
/// a pure serde struct describing *what* a cluster should look like, `Cluster`
/// holds the mutable runtime state: failure tracking, balancer cursors,
/// discovered nodes, and (if configured) active monitors.
#[derive(Clone)]
pub struct Cluster {
    /// Immutable snapshot of the cluster's declarative config.
    config: Arc<ClusterConfig>,

    /// Pre-interned `Arc<str>` copies of hot config fields so that `pick()`
    /// only bumps a reference count instead of heap-allocating a fresh
    /// `String` on every request.
    scheme: Arc<str>,
    pass_host: Arc<str>,
    upstream_host: Option<Arc<str>>,

    /// Per-cluster HTTP client with connection pool configured from
    /// `ClusterConfig::keepalive_pool`. Wraps an `HttpsConnector` so that
    /// both `http://` and `https://` upstreams are supported (TLS via
    /// rustls). HTTP/2 is negotiated automatically via ALPN.
    http_client: Client<HttpsConnector<HttpConnector>, BoxBody>,

    /// Per-node failure state (connect/protocol/monitor/fade), gating every
    /// selector in this cluster.
    failures: Arc<FailureManager>,

    /// Shared round-robin cursors, keyed by `AddressList::list_hash` so the
    /// same member set always resumes the same cursor even across config
    /// reloads that don't actually change membership.
    balancer_map: Arc<BalancerMap>,

    /// Statically configured nodes, or nodes pushed by `update_discovered_nodes`
    /// (Consul). Not used when `zeroconf` is active — Zeroconf membership is
    /// read directly from the explorer at pick time instead.
    address_list: Arc<ArcSwap<AddressList>>,
    discovered_nodes: Arc<ArcSwap<Vec<UpstreamNode>>>,

    /// How a Zeroconf-discovered member set maps a sticky hash to a member.
    /// Irrelevant (and unused) for the static/Consul path, which always uses
    /// modulo/failover/round-robin directly.
    sticky_method: StickyMethod,
    sticky_cache: Arc<StickyCache>,

    /// Present only when `ClusterConfig::zeroconf` names a service. Polled
    /// (not subscribed to) by `pick_zeroconf`, which rebuilds `zeroconf_ring`
    /// only when the member set actually changed since the last pick.
    zeroconf: Option<Arc<ZeroconfExplorer>>,
    zeroconf_ring: Arc<Mutex<Option<RingState>>>,

    /// Active PING/CONNECT/EXPECT probes, one controller per configured
    /// `MonitorConfig` per live address.
    monitors: Option<Arc<MonitorSet>>,

    /// Consecutive-result streak per address for `health_check.active`,
    /// kept separate from `FailureManager` since it counts *agreeing*
    /// probes toward a threshold rather than gating a single check.
    health_check_counts: Arc<DashMap<SocketAddress, u32>>,
}

impl Cluster {
    pub fn new(config: ClusterConfig, zeroconf_daemon: Option<Arc<ServiceDaemon>>) -> Self {
        let http_client = build_cluster_http_client(
            &config.keepalive_pool,
            config.tls_verify,
            config.timeout.connect,
        );
        let scheme: Arc<str> = Arc::from(config.scheme.as_str());
        let pass_host: Arc<str> = Arc::from(config.pass_host.as_str());
        let upstream_host: Option<Arc<str>> = config.upstream_host.as_deref().map(Arc::from);

        let cluster_name: Arc<str> = Arc::from(config.name.as_str());
        let failures = Arc::new(FailureManager::new());
        let address_list = build_address_list(&config.nodes, config.sticky_mode);

        let monitors = if config.monitors.is_empty() {
            None
        } else {
            let set = MonitorSet::new(cluster_name.clone(), config.monitors.clone(), failures.clone());
            set.reconcile(&address_list.iter().cloned().collect::<Vec<_>>());
            Some(Arc::new(set))
        };

        let zeroconf = start_zeroconf(&config, cluster_name, zeroconf_daemon);
        let sticky_method = StickyMethod::parse(&config.sticky_method);

        Self {
            config: Arc::new(config),
            scheme,
            pass_host,
            upstream_host,
            http_client,
            failures,
            balancer_map: Arc::new(BalancerMap::new()),
            address_list: Arc::new(ArcSwap::new(Arc::new(address_list))),
            discovered_nodes: Arc::new(ArcSwap::new(Arc::new(Vec::new()))),
            sticky_method,
            sticky_cache: Arc::new(StickyCache::new()),
            zeroconf,
            zeroconf_ring: Arc::new(Mutex::new(None)),
            monitors,
            health_check_counts: Arc::new(DashMap::new()),
        }
    }

    // ---- Config accessors ----

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn http_client(&self) -> &Client<HttpsConnector<HttpConnector>, BoxBody> {
        &self.http_client
    }

    pub fn failures(&self) -> &Arc<FailureManager> {
        &self.failures
    }

    // ---- Node selection ----

    /// Pick one member for this request. `sticky_hash` is 0 when the route's
    /// sticky mode has no signal for this request (or sticky mode is `none`).
    pub fn pick(&self, sticky_hash: StickyHash) -> Option<(UpstreamTarget, String)> {
        let now = Instant::now();
        let addr = if self.zeroconf.is_some() {
            self.pick_zeroconf(sticky_hash, now)?
        } else {
            self.pick_static(sticky_hash, now)?
        };

        let target =
            UpstreamTarget { scheme: self.scheme.clone(), pass_host: self.pass_host.clone(), upstream_host: self.upstream_host.clone() };
        let addr_str = addr.to_string();
        Some((target, addr_str))
    }

    fn pick_static(&self, sticky_hash: StickyHash, now: Instant) -> Option<SocketAddress> {
        let list = self.address_list.load_full();
        if list.is_empty() {
            return None;
        }
        let balancer = self.balancer_map.make_round_robin_balancer(list.list_hash());
        Some(selector::pick(&list, &self.failures, &balancer, now, sticky_hash).clone())
    }

    fn pick_zeroconf(&self, sticky_hash: StickyHash, now: Instant) -> Option<SocketAddress> {
        let explorer = self.zeroconf.as_ref()?;
        let members = explorer.members();
        if members.is_empty() {
            return None;
        }

        let mut keys: Vec<&String> = members.keys().collect();
        keys.sort();
        let mut hash_input = Vec::new();
        for k in &keys {
            hash_input.extend_from_slice(k.as_bytes());
        }
        let member_hash = crate::address::blake2_32(&hash_input);

        let mut guard = self.zeroconf_ring.lock().expect("zeroconf_ring poisoned");
        let needs_rebuild = guard.as_ref().map(|s| s.member_hash != member_hash).unwrap_or(true);
        if needs_rebuild {
            let addrs: Vec<SocketAddress> = keys
                .iter()
                .map(|k| {
                    let node = &members[*k];
                    SocketAddress::from_host_port(&node.host, node.port)
                })
                .collect();
            let list = AddressList::new(addrs, self.config.sticky_mode);
            let ring = HashRing::build(list.len(), |i| list.get(i).steady_part());
            if let Some(monitors) = &self.monitors {
                monitors.reconcile(&list.iter().cloned().collect::<Vec<_>>());
            }
            *guard = Some(RingState { member_hash, list, ring });
        }
        let state = guard.as_ref().expect("just populated");

        if sticky_hash == 0 {
            // No sticky signal regardless of method: spread load round-robin
            // over the discovered member set.
            let balancer = self.balancer_map.make_round_robin_balancer(state.list.list_hash());
            return Some(balancer.get(&state.list, &self.failures, now, true).clone());
        }

        match self.sticky_method {
            StickyMethod::Cache => {
                if let Some(cached_key) = self.sticky_cache.get(sticky_hash) {
                    if let Some(idx) = state.list.iter().position(|a| a.to_string() == cached_key) {
                        let addr = state.list.get(idx);
                        if self.failures.check(now, addr, true) {
                            return Some(addr.clone());
                        }
                    }
                }
                let picked = ring_pick_with_failover(state, sticky_hash, &self.failures, now)?;
                self.sticky_cache.insert(sticky_hash, picked.to_string());
                Some(picked)
            }
            StickyMethod::RendezvousHashing => {
                let member_hashes: Vec<(usize, u32)> = (0..state.list.len())
                    .map(|i| (i, crate::address::blake2_32(&state.list.get(i).steady_part())))
                    .collect();
                let ranked = selector::rendezvous_rank(&member_hashes, sticky_hash);
                for &idx in &ranked {
                    let addr = state.list.get(idx);
                    if self.failures.check(now, addr, true) {
                        return Some(addr.clone());
                    }
                }
                Some(state.list.get(ranked[0]).clone())
            }
            StickyMethod::ConsistentHashing => ring_pick_with_failover(state, sticky_hash, &self.failures, now),
        }
    }

    // ---- Failure state ----
    //
    // Passive HTTP-status gating, connect-failure gating, and active-probe
    // gating all collapse onto one `FailureManager` here: only the status
    // kind recorded differs per concern, not the underlying mechanism.

    fn addr_for(&self, node_key: &str) -> SocketAddress {
        // `node_key` is always an "addr:port" or "host:port" string produced
        // by `pick()`'s own `ToString`, so round-tripping it through
        // `from_host_port` recovers the same steady part `FailureManager`
        // keyed the entry under.
        match node_key.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(p) => SocketAddress::from_host_port(host, p),
                Err(_) => SocketAddress::unix(node_key),
            },
            None => SocketAddress::unix(node_key),
        }
    }

    pub fn record_connect_failure(&self, node_key: &str) {
        let addr = self.addr_for(node_key);
        self.failures.make(&addr).set(FailureStatus::Connect, Instant::now(), crate::balancer_request::CONNECT_FAILURE_DURATION);
    }

    pub fn record_connect_success(&self, node_key: &str) {
        let addr = self.addr_for(node_key);
        self.failures.make(&addr).unset(FailureStatus::Connect, Instant::now());
    }

    /// Passive, response-status-driven health (`health_check.passive`).
    /// Named to match what `proxy::handler` already calls on both the
    /// connect-error/timeout path and the response-status path.
    pub fn record_health_failure(&self, node_key: &str) {
        let addr = self.addr_for(node_key);
        let duration = self
            .config
            .circuit_breaker
            .as_ref()
            .map(|cb| Duration::from_secs(cb.open_duration_secs))
            .unwrap_or(crate::balancer_request::CONNECT_FAILURE_DURATION);
        self.failures.make(&addr).set(FailureStatus::Protocol, Instant::now(), duration);
    }

    pub fn record_health_success(&self, node_key: &str) {
        let addr = self.addr_for(node_key);
        self.failures.make(&addr).unset(FailureStatus::Protocol, Instant::now());
    }

    /// Active HTTP health-check result (`health_check.active`), tracked as
    /// `FailureStatus::Monitor` — the same status class the PING/CONNECT/
    /// EXPECT monitors above use, since both are independent active probes.
    pub fn is_node_healthy(&self, node_key: &str) -> bool {
        let addr = self.addr_for(node_key);
        self.failures.check(Instant::now(), &addr, true)
    }

    pub fn mark_node_healthy(&self, node_key: &str) {
        let addr = self.addr_for(node_key);
        self.failures.make(&addr).unset(FailureStatus::Monitor, Instant::now());
    }

    pub fn mark_node_unhealthy(&self, node_key: &str) {
        let addr = self.addr_for(node_key);
        self.failures.make(&addr).set_monitor();
    }

    /// Bump the consecutive-agreeing-result streak for `node_key` and
    /// return the new count. The caller compares it against its own
    /// threshold before calling `mark_node_healthy`/`mark_node_unhealthy`.
    pub fn record_health_check(&self, node_key: &str) -> u32 {
        let addr = self.addr_for(node_key);
        let mut count = self.health_check_counts.entry(addr).or_insert(0);
        *count += 1;
        *count
    }

    /// Clear the streak for `node_key`, e.g. when the opposite result breaks it.
    pub fn reset_health_count(&self, node_key: &str) {
        let addr = self.addr_for(node_key);
        self.health_check_counts.remove(&addr);
    }

    /// Current member nodes, from whichever source (Zeroconf, Consul, or
    /// static config) is active, for callers that need to enumerate targets
    /// (active health-check scheduling).
    pub fn effective_nodes(&self) -> Vec<UpstreamNode> {
        if let Some(explorer) = &self.zeroconf {
            return explorer.members().values().cloned().collect();
        }
        let discovered = self.discovered_nodes.load_full();
        if !discovered.is_empty() {
            return (*discovered).clone();
        }
        self.config.nodes.clone()
    }

    // ---- Service discovery (Consul) ----

    /// Update discovered nodes (from Consul) and rebuild the static address
    /// list. No-op when `zeroconf` is active — that path reads its own
    /// explorer's member set directly at pick time.
    pub fn update_discovered_nodes(&self, nodes: Vec<UpstreamNode>) {
        let list = if nodes.is_empty() {
            build_address_list(&self.config.nodes, self.config.sticky_mode)
        } else {
            build_address_list(&nodes, self.config.sticky_mode)
        };
        if let Some(monitors) = &self.monitors {
            monitors.reconcile(&list.iter().cloned().collect::<Vec<_>>());
        }
        self.address_list.store(Arc::new(list));
        self.discovered_nodes.store(Arc::new(nodes));
    }

    pub fn discovered_nodes(&self) -> Arc<Vec<UpstreamNode>> {
        self.discovered_nodes.load_full()
    }

    /// Total member count across whichever source (Zeroconf, Consul, or
    /// static config) is currently active.
    pub fn node_count(&self) -> usize {
        if let Some(explorer) = &self.zeroconf {
            return explorer.members().len();
        }
        self.address_list.load().len()
    }

    // ---- Config update ----

    /// Update the cluster's config. Preserves runtime state (failure
    /// tracking, balancer cursors, sticky cache). Rebuilds the static
    /// address list and HTTP client only when the inputs that feed them
    /// actually changed.
    pub fn update_config(&self, new_config: ClusterConfig, zeroconf_daemon: Option<Arc<ServiceDaemon>>) -> Self {
        let new_client = if new_config.keepalive_pool != self.config.keepalive_pool
            || new_config.tls_verify != self.config.tls_verify
            || new_config.timeout.connect != self.config.timeout.connect
        {
            build_cluster_http_client(&new_config.keepalive_pool, new_config.tls_verify, new_config.timeout.connect)
        } else {
            self.http_client.clone()
        };

        let scheme: Arc<str> = Arc::from(new_config.scheme.as_str());
        let pass_host: Arc<str> = Arc::from(new_config.pass_host.as_str());
        let upstream_host: Option<Arc<str>> = new_config.upstream_host.as_deref().map(Arc::from);
        let cluster_name: Arc<str> = Arc::from(new_config.name.as_str());

        let discovered = self.discovered_nodes.load_full();
        let address_list = if discovered.is_empty() {
            build_address_list(&new_config.nodes, new_config.sticky_mode)
        } else {
            build_address_list(&discovered, new_config.sticky_mode)
        };

        let monitors = if new_config.monitors.is_empty() {
            None
        } else {
            let set = MonitorSet::new(cluster_name.clone(), new_config.monitors.clone(), self.failures.clone());
            set.reconcile(&address_list.iter().cloned().collect::<Vec<_>>());
            Some(Arc::new(set))
        };

        let zeroconf = if new_config.zeroconf == self.config.zeroconf {
            self.zeroconf.clone()
        } else {
            start_zeroconf(&new_config, cluster_name, zeroconf_daemon)
        };

        Self {
            config: Arc::new(new_config),
            scheme,
            pass_host,
            upstream_host,
            http_client: new_client,
            failures: self.failures.clone(),
            balancer_map: self.balancer_map.clone(),
            address_list: Arc::new(ArcSwap::new(Arc::new(address_list))),
            discovered_nodes: self.discovered_nodes.clone(),
            sticky_method: StickyMethod::parse(&self.config.sticky_method),
            sticky_cache: self.sticky_cache.clone(),
            zeroconf,
            zeroconf_ring: Arc::new(Mutex::new(None)),
            monitors,
            health_check_counts: self.health_check_counts.clone(),
        }
    }
}

fn build_address_list(nodes: &[UpstreamNode], sticky_mode: StickyMode) -> AddressList {
    let addrs: Vec<SocketAddress> =
        nodes.iter().map(|n| SocketAddress::from_host_port(&n.host, n.port)).collect();
    AddressList::new(addrs, sticky_mode)
}

fn start_zeroconf(
    config: &ClusterConfig,
    cluster_name: Arc<str>,
    daemon: Option<Arc<ServiceDaemon>>,
) -> Option<Arc<ZeroconfExplorer>> {
    let zc = config.zeroconf.as_ref()?;
    if !zc.is_enabled() {
        return None;
    }
    let daemon = daemon?;
    match ZeroconfExplorer::start(&daemon, cluster_name.clone(), zc) {
        Ok(explorer) => Some(Arc::new(explorer)),
        Err(e) => {
            tracing::error!("zeroconf: failed to start browse, cluster={}, error={}", cluster_name, e);
            None
        }
    }
}

/// Walk the ring from `h`'s bucket to the next member that passes
/// `FailureManager::check`, bounded by the member count rather than by a
/// fixed retry budget — a single member can own many buckets, so a
/// step-count bound would under- or over-shoot depending on ring layout.
fn ring_pick_with_failover(
    state: &RingState,
    h: StickyHash,
    failures: &FailureManager,
    now: Instant,
) -> Option<SocketAddress> {
    let start_bucket = state.ring.bucket_of(h);
    let mut bucket = start_bucket;
    let mut member = state.ring.member_at(bucket);
    let mut tried = Vec::with_capacity(state.list.len());

    loop {
        let addr = state.list.get(member);
        if failures.check(now, addr, tried.is_empty()) {
            return Some(addr.clone());
        }
        tried.push(member);
        if tried.len() >= state.list.len() {
            break;
        }
        let (next_bucket, next_member) = state.ring.next_distinct_from(bucket, &tried);
        bucket = next_bucket;
        member = next_member;
    }

    // Every member is failing — return the original pick rather than None,
    // matching `pick_failover`'s "everyone's down, try the primary anyway".
    Some(state.list.get(state.ring.member_at(start_bucket)).clone())
}

/// Central registry of all live clusters. Thread-safe, cheaply cloneable.
#[derive(Clone)]
pub struct ClusterStore {
    clusters: Arc<DashMap<String, Cluster>>,
    zeroconf_daemon: Arc<Mutex<Option<Arc<ServiceDaemon>>>>,
}

impl Default for ClusterStore {
    fn default() -> Self {
        Self { clusters: Arc::new(DashMap::new()), zeroconf_daemon: Arc::new(Mutex::new(None)) }
    }
}

impl ClusterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a cluster by name.
    pub fn get(&self, name: &str) -> Option<Cluster> {
        self.clusters.get(name).map(|entry| entry.value().clone())
    }

    /// Upsert a cluster from config. If the cluster already exists, update its
    /// config while preserving runtime state. If new, create fresh.
    pub fn upsert(&self, config: ClusterConfig) {
        let name = config.name.clone();
        let daemon = self.zeroconf_daemon_for(&config);
        if let Some(existing) = self.clusters.get(&name) {
            let updated = existing.value().update_config(config, daemon);
            drop(existing);
            self.clusters.insert(name, updated);
        } else {
            self.clusters.insert(name, Cluster::new(config, daemon));
        }
    }

    /// Remove a cluster.
    pub fn remove(&self, name: &str) -> bool {
        self.clusters.remove(name).is_some()
    }

    /// Iterate over all clusters. The callback receives (name, cluster).
    pub fn for_each(&self, mut f: impl FnMut(&str, &Cluster)) {
        for entry in self.clusters.iter() {
            f(entry.key(), entry.value());
        }
    }

    /// Initialize from a list of cluster configs.
    pub fn init_from_configs(&self, clusters: &[ClusterConfig]) {
        for config in clusters {
            self.upsert(config.clone());
        }
    }

    /// Lazily start (at most once) the process-wide mDNS daemon the first
    /// time any cluster asks for Zeroconf discovery. `mdns-sd` multicasts
    /// on one socket per host, so every cluster's browse session shares it.
    fn zeroconf_daemon_for(&self, config: &ClusterConfig) -> Option<Arc<ServiceDaemon>> {
        let enabled = config.zeroconf.as_ref().map(|z| z.is_enabled()).unwrap_or(false);
        if !enabled {
            return None;
        }
        let mut guard = self.zeroconf_daemon.lock().expect("zeroconf_daemon poisoned");
        if let Some(d) = guard.as_ref() {
            return Some(d.clone());
        }
        match ServiceDaemon::new() {
            Ok(d) => {
                let d = Arc::new(d);
                *guard = Some(d.clone());
                Some(d)
            }
            Err(e) => {
                tracing::error!("zeroconf: failed to start mDNS daemon, error={}", e);
                None
            }
        }
    }
}

/// Build a hyper `Client` that supports both HTTP and HTTPS upstreams.
///
/// - Plain `http://` connections go through the inner `HttpConnector` directly.
/// - `https://` connections are terminated with rustls (ring backend).
/// - HTTP/2 is negotiated automatically via ALPN for TLS connections;
///   plain HTTP connections stay on HTTP/1.1.
/// - When `tls_verify` is `false` (the default), certificate validation is
///   skipped — suitable for internal / mesh traffic with self-signed certs.
fn build_cluster_http_client(
    pool_cfg: &KeepalivePoolConfig,
    tls_verify: bool,
    connect_timeout_secs: f64,
) -> Client<HttpsConnector<HttpConnector>, BoxBody> {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(Duration::from_secs(pool_cfg.idle_timeout)));
    http.set_connect_timeout(Some(Duration::from_secs_f64(connect_timeout_secs)));
    http.enforce_http(false);

    let https = if tls_verify {
        hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http)
    } else {
        let tls_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();

        hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http)
    };

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(pool_cfg.idle_timeout))
        .pool_max_idle_per_host(pool_cfg.size)
        .build(https)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterConfig, TimeoutConfig};

    fn base_config(name: &str, nodes: Vec<UpstreamNode>) -> ClusterConfig {
        ClusterConfig {
            name: name.to_string(),
            lb_type: "roundrobin".to_string(),
            timeout: TimeoutConfig::default(),
            scheme: "http".to_string(),
            pass_host: "pass".to_string(),
            upstream_host: None,
            nodes,
            discovery_type: None,
            service_name: None,
            discovery_args: None,
            keepalive_pool: Default::default(),
            health_check: None,
            retry: None,
            circuit_breaker: None,
            tls_verify: false,
            sticky_mode: StickyMode::None,
            sticky_method: "consistent_hashing".to_string(),
            monitors: Vec::new(),
            zeroconf: None,
            stock: Default::default(),
        }
    }

    fn node(host: &str, port: u16) -> UpstreamNode {
        UpstreamNode { host: host.to_string(), port, weight: 100, metadata: Default::default() }
    }

    #[test]
    fn pick_round_robins_over_static_nodes() {
        let cfg = base_config("c1", vec![node("10.0.0.1", 80), node("10.0.0.2", 80), node("10.0.0.3", 80)]);
        let cluster = Cluster::new(cfg, None);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            let (_, addr) = cluster.pick(0).unwrap();
            seen.insert(addr);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn failing_node_is_skipped_after_record_connect_failure() {
        let cfg = base_config("c2", vec![node("10.0.0.1", 80), node("10.0.0.2", 80)]);
        let cluster = Cluster::new(cfg, None);
        let (_, first) = cluster.pick(0).unwrap();
        cluster.record_connect_failure(&first);

        for _ in 0..4 {
            let (_, addr) = cluster.pick(0).unwrap();
            assert_ne!(addr, first);
        }
    }

    #[test]
    fn empty_cluster_returns_none() {
        let cfg = base_config("c3", vec![]);
        let cluster = Cluster::new(cfg, None);
        assert!(cluster.pick(0).is_none());
    }

    #[test]
    fn update_discovered_nodes_replaces_static_list() {
        let cfg = base_config("c4", vec![node("10.0.0.1", 80)]);
        let cluster = Cluster::new(cfg, None);
        cluster.update_discovered_nodes(vec![node("10.0.0.9", 81), node("10.0.0.10", 81)]);
        assert_eq!(cluster.node_count(), 2);
    }

    #[test]
    fn mark_node_unhealthy_then_healthy_round_trips() {
        let cfg = base_config("c5", vec![node("10.0.0.1", 80)]);
        let cluster = Cluster::new(cfg, None);
        assert!(cluster.is_node_healthy("10.0.0.1:80"));
        cluster.mark_node_unhealthy("10.0.0.1:80");
        assert!(!cluster.is_node_healthy("10.0.0.1:80"));
        cluster.mark_node_healthy("10.0.0.1:80");
        assert!(cluster.is_node_healthy("10.0.0.1:80"));
    }
}
