use std::fmt;

/// Errors from the backend-selection and dispatch core.
/// A flat, hand-written enum mirrors the existing `GatewayError` idiom below
/// rather than pulling `thiserror` into the core: callers match on the
/// exact kind instead of downcasting.
#[derive(Debug)]
pub enum BalancerError {
    /// Impossible input discovered at startup (e.g. unresolved Zeroconf
    /// interface). Fatal to the worker.
    Config(String),
    /// TCP connect refused/unreachable/timed out.
    Connect(String),
    /// Upstream responded with malformed bytes.
    Protocol(String),
    /// A monitor probe timed out.
    MonitorTimeout,
    /// A monitor probe errored (connect refused, read error, ...).
    MonitorError(String),
    /// The cluster (static or Zeroconf) has no active members at pick time.
    ClusterEmpty,
    /// The caller cancelled the operation; no handler fires after this.
    Cancelled,
}

impl fmt::Display for BalancerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalancerError::Config(msg) => write!(f, "config error: {msg}"),
            BalancerError::Connect(msg) => write!(f, "connect error: {msg}"),
            BalancerError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            BalancerError::MonitorTimeout => write!(f, "monitor timeout"),
            BalancerError::MonitorError(msg) => write!(f, "monitor error: {msg}"),
            BalancerError::ClusterEmpty => write!(f, "zeroconf cluster is empty"),
            BalancerError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for BalancerError {}

#[derive(Debug)]
#[allow(dead_code)]
pub enum GatewayError {
    NoRouteMatch,
    NoUpstream,
    RateLimited,
    UpstreamTimeout,
    UpstreamConnect(String),
    Http(reqwest::Error),
    Balancer(BalancerError),
    Config(String),
    Internal(String),
    /// Consul API returned an unexpected status or body.
    Consul(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::NoRouteMatch => write!(f, "no route matched"),
            GatewayError::NoUpstream => write!(f, "no upstream available"),
            GatewayError::RateLimited => write!(f, "rate limited"),
            GatewayError::UpstreamTimeout => write!(f, "upstream timeout"),
            GatewayError::UpstreamConnect(msg) => write!(f, "upstream connect error: {}", msg),
            GatewayError::Http(e) => write!(f, "http error: {}", e),
            GatewayError::Balancer(e) => write!(f, "balancer error: {}", e),
            GatewayError::Config(msg) => write!(f, "config error: {}", msg),
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
            GatewayError::Consul(msg) => write!(f, "consul error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<BalancerError> for GatewayError {
    fn from(e: BalancerError) -> Self {
        GatewayError::Balancer(e)
    }
}
