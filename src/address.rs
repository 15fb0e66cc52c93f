//! Network endpoints and the sticky-hash helpers used to pick among them.

use blake2::digest::consts::U4;
use blake2::{Blake2b, Digest};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

type Blake2b32 = Blake2b<U4>;

/// An immutable network endpoint.
///
/// `Inet` covers AF_INET/AF_INET6. `Unix` covers AF_LOCAL and the
/// "HTTP-over-UNIX" variant (a UNIX socket plus an HTTP path prefix).
/// `Named` covers upstream nodes configured or discovered by hostname
/// rather than a literal IP — DNS resolution is left to whatever dials the
/// connection (hyper's `HttpConnector`, `TcpStream::connect`'s own
/// `ToSocketAddrs` impl for "host:port" strings) rather than resolved once
/// and cached here.
#[derive(Debug, Clone, Eq)]
pub enum SocketAddress {
    Inet(SocketAddr),
    Unix { path: Arc<str>, http_path: Option<Arc<str>> },
    Named { host: Arc<str>, port: u16 },
}

impl SocketAddress {
    pub fn inet(addr: SocketAddr) -> Self {
        Self::Inet(addr)
    }

    pub fn unix(path: impl Into<Arc<str>>) -> Self {
        Self::Unix { path: path.into(), http_path: None }
    }

    /// Builds the appropriate variant for a config/discovery `host:port`
    /// pair: a literal IP parses straight into `Inet`, anything else (a
    /// hostname, a Zeroconf-advertised name) becomes `Named`.
    pub fn from_host_port(host: &str, port: u16) -> Self {
        match format!("{host}:{port}").parse::<SocketAddr>() {
            Ok(sa) => Self::Inet(sa),
            Err(_) => Self::Named { host: host.into(), port },
        }
    }

    /// The stable part of the address used as hashing input: address and
    /// port (or path), without any transient fields.
    pub fn steady_part(&self) -> Vec<u8> {
        match self {
            Self::Inet(addr) => {
                let mut buf = Vec::with_capacity(18);
                match addr.ip() {
                    std::net::IpAddr::V4(v4) => buf.extend_from_slice(&v4.octets()),
                    std::net::IpAddr::V6(v6) => buf.extend_from_slice(&v6.octets()),
                }
                buf.extend_from_slice(&addr.port().to_be_bytes());
                buf
            }
            Self::Unix { path, .. } => path.as_bytes().to_vec(),
            Self::Named { host, port } => {
                let mut buf = host.as_bytes().to_vec();
                buf.extend_from_slice(&port.to_be_bytes());
                buf
            }
        }
    }
}

impl PartialEq for SocketAddress {
    fn eq(&self, other: &Self) -> bool {
        self.steady_part() == other.steady_part()
    }
}

impl Hash for SocketAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.steady_part().hash(state);
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet(addr) => write!(f, "{addr}"),
            Self::Unix { path, http_path } => match http_path {
                Some(p) => write!(f, "unix:{path}:{p}"),
                None => write!(f, "unix:{path}"),
            },
            Self::Named { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

/// How a request's affinity is derived and matched against a member list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StickyMode {
    None,
    Failover,
    SourceIp,
    Host,
    XHost,
    SessionModulo,
    Cookie,
    JvmRoute,
}

impl Default for StickyMode {
    fn default() -> Self {
        Self::None
    }
}

/// Which selector a Zeroconf-backed cluster picks members with when sticky
/// affinity is in play. Unlike `StickyMode` (how the hash is derived from
/// the request), this is how that hash is turned into a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StickyMethod {
    ConsistentHashing,
    RendezvousHashing,
    Cache,
}

impl StickyMethod {
    pub fn parse(s: &str) -> Self {
        match s {
            "rendezvous_hashing" | "rendezvous" => Self::RendezvousHashing,
            "cache" => Self::Cache,
            _ => Self::ConsistentHashing,
        }
    }
}

/// 32-bit sticky hash. Zero means "no sticky information available".
pub type StickyHash = u32;

/// Combine two sticky hash sources. XOR is its own identity for zero, so a
/// hash combined with "no information" (0) is unaffected.
pub fn combine_sticky_hashes(a: StickyHash, b: StickyHash) -> StickyHash {
    a ^ b
}

/// DJB hash (Bernstein), used for SOURCE_IP / HOST / XHOST sticky derivation.
pub fn djb_hash(data: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &b in data {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    hash
}

/// BLAKE2b truncated to 32 bits, used for ring replica placement and for
/// hashing address lists / rendezvous combinations where a cryptographic
/// hash (rather than DJB) is specified.
pub fn blake2_32(data: &[u8]) -> u32 {
    let mut hasher = Blake2b32::new();
    hasher.update(data);
    let out = hasher.finalize();
    u32::from_be_bytes([out[0], out[1], out[2], out[3]])
}

/// An immutable ordered list of backend addresses plus the sticky mode that
/// governs how a request is matched against them. Never empty once it
/// reaches a selector.
#[derive(Debug, Clone)]
pub struct AddressList {
    members: Arc<[SocketAddress]>,
    sticky_mode: StickyMode,
}

impl AddressList {
    pub fn new(members: Vec<SocketAddress>, sticky_mode: StickyMode) -> Self {
        Self { members: members.into(), sticky_mode }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn sticky_mode(&self) -> StickyMode {
        self.sticky_mode
    }

    pub fn get(&self, i: usize) -> &SocketAddress {
        &self.members[i]
    }

    pub fn iter(&self) -> impl Iterator<Item = &SocketAddress> {
        self.members.iter()
    }

    /// BLAKE2b hash of the concatenated steady parts of all members, used
    /// as the `BalancerMap` cache key so a given list always maps to the
    /// same persistent round-robin cursor.
    pub fn list_hash(&self) -> u32 {
        let mut buf = Vec::new();
        for m in self.members.iter() {
            buf.extend_from_slice(&m.steady_part());
        }
        blake2_32(&buf)
    }
}
