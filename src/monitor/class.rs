//! The three probe kinds a [`crate::config::MonitorConfig`] can select.
//!
//! Grounded the same way `upstream::health::check_one_node` checks an HTTP
//! endpoint: open a connection, apply a timeout, decide pass/fail. `Expect`
//! generalizes that shape to raw TCP; `Connect` is the bare-minimum version
//! with no payload; `Ping` swaps TCP for ICMP via `surge-ping`.

use crate::address::SocketAddress;
use crate::error::BalancerError;
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// The three terminal results a probe can report. `Fade` is distinct from
/// `Success`/`Error`: it means the peer is draining, not that the probe
/// itself misbehaved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Fade,
}

/// A single probe attempt against one node, bounded by `timeout`. A timeout
/// is reported as `MonitorTimeout`, distinct from a probe that completed but
/// found neither `fade_expect` nor `expect` in the response.
pub async fn run_once(
    addr: &SocketAddress,
    port_override: Option<u16>,
    class: &MonitorClass,
    timeout: Duration,
) -> Result<Outcome, BalancerError> {
    match tokio::time::timeout(timeout, probe(addr, port_override, class)).await {
        Ok(inner) => inner,
        Err(_) => Err(BalancerError::MonitorTimeout),
    }
}

async fn probe(
    addr: &SocketAddress,
    port_override: Option<u16>,
    class: &MonitorClass,
) -> Result<Outcome, BalancerError> {
    match class {
        MonitorClass::Ping => ping_once(addr).await.map(|()| Outcome::Success),
        MonitorClass::Connect => connect_once(addr, port_override).await.map(|_| Outcome::Success),
        MonitorClass::Expect { send, expect, fade_expect } => {
            let mut stream = connect_once(addr, port_override).await?;
            if let Some(payload) = send {
                stream
                    .write_all(payload.as_bytes())
                    .await
                    .map_err(|e| BalancerError::MonitorError(e.to_string()))?;
            }
            // Coalesce delay: let the peer flush its full greeting in one
            // shot rather than racing the first `read` against a
            // still-filling socket buffer.
            tokio::time::sleep(Duration::from_millis(10)).await;
            let mut buf = [0u8; 1024];
            let n = stream
                .read(&mut buf)
                .await
                .map_err(|e| BalancerError::MonitorError(e.to_string()))?;
            let received = String::from_utf8_lossy(&buf[..n]);

            if let Some(pat) = fade_expect {
                if received.contains(pat.as_str()) {
                    return Ok(Outcome::Fade);
                }
            }
            match expect {
                Some(pat) if received.contains(pat.as_str()) => Ok(Outcome::Success),
                Some(pat) => Err(BalancerError::MonitorError(format!(
                    "response did not contain expected pattern {pat:?}"
                ))),
                // empty/absent `expect` means any response is success.
                None => Ok(Outcome::Success),
            }
        }
    }
}

async fn connect_once(
    addr: &SocketAddress,
    port_override: Option<u16>,
) -> Result<TcpStream, BalancerError> {
    let dial_addr = match (addr, port_override) {
        (SocketAddress::Inet(sa), Some(port)) => {
            std::net::SocketAddr::new(sa.ip(), port).to_string()
        }
        (SocketAddress::Inet(sa), None) => sa.to_string(),
        (SocketAddress::Named { host, .. }, Some(port)) => format!("{host}:{port}"),
        (SocketAddress::Named { host, port }, None) => format!("{host}:{port}"),
        (SocketAddress::Unix { .. }, _) => {
            return Err(BalancerError::Config(
                "connect/expect monitors require an inet address".to_string(),
            ))
        }
    };
    TcpStream::connect(&dial_addr)
        .await
        .map_err(|e| BalancerError::Connect(e.to_string()))
}

async fn ping_once(addr: &SocketAddress) -> Result<(), BalancerError> {
    let ip: IpAddr = match addr {
        SocketAddress::Inet(sa) => sa.ip(),
        SocketAddress::Named { host, port } => {
            tokio::net::lookup_host((host.as_ref(), *port))
                .await
                .map_err(|e| BalancerError::MonitorError(e.to_string()))?
                .next()
                .ok_or_else(|| BalancerError::MonitorError(format!("no DNS records for {host}")))?
                .ip()
        }
        SocketAddress::Unix { .. } => {
            return Err(BalancerError::Config("ping monitor requires an inet address".to_string()))
        }
    };
    surge_ping::ping(ip, b"sluice-monitor")
        .await
        .map(|_| ())
        .map_err(|e| BalancerError::MonitorError(e.to_string()))
}

/// Parsed form of [`crate::config::MonitorConfig`] — owned, cheap to clone,
/// independent of the serde field names.
#[derive(Debug, Clone)]
pub enum MonitorClass {
    Ping,
    Connect,
    Expect { send: Option<String>, expect: Option<String>, fade_expect: Option<String> },
}

impl MonitorClass {
    pub fn from_config(cfg: &crate::config::MonitorConfig) -> Result<Self, BalancerError> {
        match cfg.kind.as_str() {
            "ping" => Ok(Self::Ping),
            "connect" => Ok(Self::Connect),
            "expect" => Ok(Self::Expect {
                send: cfg.send.clone(),
                expect: cfg.expect.clone(),
                fade_expect: cfg.fade_expect.clone(),
            }),
            other => Err(BalancerError::Config(format!("unknown monitor type {other:?}"))),
        }
    }
}
