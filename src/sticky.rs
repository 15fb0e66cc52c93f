//! Derives a [`StickyHash`](crate::address::StickyHash) from request
//! semantics the selector itself never parses: client address, host
//! header, cookies. One function per `StickyMode`, dispatched by
//! [`derive`].

use crate::address::{djb_hash, StickyHash, StickyMode};
use http::HeaderMap;
use std::net::IpAddr;

const XHOST_HEADER: &str = "x-host";
const STICKY_COOKIE_NAME: &str = "lb_sticky";
const JVM_ROUTE_COOKIE_NAME: &str = "JSESSIONID";

/// Compute the sticky hash for a request under `mode`. Returns 0 ("no
/// sticky information") for `StickyMode::None` and whenever the signal the
/// mode names is absent from the request.
pub fn derive(mode: StickyMode, client_ip: IpAddr, host: &str, headers: &HeaderMap) -> StickyHash {
    match mode {
        StickyMode::None => 0,
        StickyMode::Failover => 0,
        StickyMode::SourceIp => source_ip_hash(client_ip),
        StickyMode::Host => host_hash(host),
        StickyMode::XHost => header_hash(headers, XHOST_HEADER),
        StickyMode::SessionModulo => session_modulo_hash(headers),
        StickyMode::Cookie => sticky_cookie_hash(headers),
        StickyMode::JvmRoute => jvm_route_hash(headers),
    }
}

fn source_ip_hash(client_ip: IpAddr) -> StickyHash {
    match client_ip {
        IpAddr::V4(v4) => djb_hash(&v4.octets()),
        IpAddr::V6(v6) => djb_hash(&v6.octets()),
    }
}

fn host_hash(host: &str) -> StickyHash {
    djb_hash(host.to_ascii_lowercase().as_bytes())
}

fn header_hash(headers: &HeaderMap, name: &str) -> StickyHash {
    match headers.get(name).and_then(|v| v.to_str().ok()) {
        Some(v) => djb_hash(v.to_ascii_lowercase().as_bytes()),
        None => 0,
    }
}

/// `SESSION_MODULO` keys off the lower 32 bits of a session id carried by
/// the client — here, the `lb_session` cookie set by whatever upstream
/// issued the session, not something this gateway mints itself.
fn session_modulo_hash(headers: &HeaderMap) -> StickyHash {
    match cookie_value(headers, "lb_session") {
        Some(v) => djb_hash(v.as_bytes()),
        None => 0,
    }
}

/// `COOKIE` mode looks up a sticky cookie this gateway previously minted
/// (via [`response_cookie`]) and stored as a hex-encoded hash. A first
/// request with no such cookie returns 0, falls through to non-sticky
/// selection, and the response phase mints one for subsequent requests.
fn sticky_cookie_hash(headers: &HeaderMap) -> StickyHash {
    match cookie_value(headers, STICKY_COOKIE_NAME) {
        Some(v) => u32::from_str_radix(&v, 16).unwrap_or(0),
        None => 0,
    }
}

/// `JVM_ROUTE` reads the `jvmRoute` suffix of a Tomcat-style
/// `JSESSIONID=<id>.<route>` cookie and hashes the route token, so all
/// requests naming the same route land on the same hash regardless of the
/// session id prefix.
fn jvm_route_hash(headers: &HeaderMap) -> StickyHash {
    let value = match cookie_value(headers, JVM_ROUTE_COOKIE_NAME) {
        Some(v) => v,
        None => return 0,
    };
    match value.rsplit_once('.') {
        Some((_, route)) if !route.is_empty() => djb_hash(route.as_bytes()),
        _ => 0,
    }
}

/// Builds the `Set-Cookie` value a response should carry to pin the client
/// to `sticky_hash` for subsequent `COOKIE`-mode requests. Callers only
/// need this after `derive` returned a fresh (non-cached) pick.
pub fn response_cookie(sticky_hash: StickyHash) -> String {
    format!("{STICKY_COOKIE_NAME}={sticky_hash:08x}; Path=/; HttpOnly")
}

/// Parses the raw `Cookie` request header (`a=1; b=2`) looking for `name`.
/// No external cookie crate is pulled in for this single narrow lookup.
fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(http::header::COOKIE)?.to_str().ok()?;
    for part in raw.split(';') {
        let part = part.trim();
        if let Some((k, v)) = part.split_once('=') {
            if k.trim() == name {
                return Some(v.trim().to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_cookie(cookie: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(http::header::COOKIE, cookie.parse().unwrap());
        h
    }

    #[test]
    fn none_mode_is_always_zero() {
        let h = HeaderMap::new();
        assert_eq!(derive(StickyMode::None, "10.0.0.1".parse().unwrap(), "x", &h), 0);
    }

    #[test]
    fn source_ip_is_deterministic() {
        let h = HeaderMap::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let a = derive(StickyMode::SourceIp, ip, "x", &h);
        let b = derive(StickyMode::SourceIp, ip, "x", &h);
        assert_eq!(a, b);
        assert_ne!(a, 0);
    }

    #[test]
    fn host_hash_is_case_insensitive() {
        let h = HeaderMap::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let a = derive(StickyMode::Host, ip, "Example.COM", &h);
        let b = derive(StickyMode::Host, ip, "example.com", &h);
        assert_eq!(a, b);
    }

    #[test]
    fn xhost_missing_header_is_zero() {
        let h = HeaderMap::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(derive(StickyMode::XHost, ip, "x", &h), 0);
    }

    #[test]
    fn cookie_mode_parses_hex_hash() {
        let h = headers_with_cookie("lb_sticky=000001a4");
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(derive(StickyMode::Cookie, ip, "x", &h), 0x1a4);
    }

    #[test]
    fn cookie_mode_missing_is_zero() {
        let h = HeaderMap::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(derive(StickyMode::Cookie, ip, "x", &h), 0);
    }

    #[test]
    fn jvm_route_extracts_suffix() {
        let h = headers_with_cookie("JSESSIONID=AB12CD34.node2");
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let a = derive(StickyMode::JvmRoute, ip, "x", &h);
        let b = djb_hash(b"node2");
        assert_eq!(a, b);
    }

    #[test]
    fn jvm_route_without_suffix_is_zero() {
        let h = headers_with_cookie("JSESSIONID=AB12CD34");
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(derive(StickyMode::JvmRoute, ip, "x", &h), 0);
    }

    #[test]
    fn response_cookie_round_trips_through_derive() {
        let cookie = response_cookie(0x1a4);
        let cookie_header = cookie.split(';').next().unwrap();
        let h = headers_with_cookie(cookie_header);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(derive(StickyMode::Cookie, ip, "x", &h), 0x1a4);
    }
}
