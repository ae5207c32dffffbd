// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Definition URL guard.
//!
//! A URL may only be dereferenced when it is `https`, names a host, and every
//! address the host resolves to is globally routable. Resolution failure or an
//! empty answer rejects the URL.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use async_trait::async_trait;
use url::{Host, Url};

use crate::error::ValidationError;
use crate::sanitize::sanitize_for_log;

#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system (`getaddrinfo`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 443)).await?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

#[derive(Clone)]
pub struct UrlGuard {
    resolver: Arc<dyn HostResolver>,
}

impl Default for UrlGuard {
    fn default() -> Self {
        Self::new(Arc::new(SystemResolver))
    }
}

impl UrlGuard {
    pub fn new(resolver: Arc<dyn HostResolver>) -> Self {
        Self { resolver }
    }

    pub async fn check(&self, raw: &str) -> Result<(), ValidationError> {
        let reject = |reason: &str| ValidationError::Url { url: sanitize_for_log(raw), reason: reason.to_string() };

        let url = Url::parse(raw.trim()).map_err(|e| reject(&e.to_string()))?;
        if url.scheme() != "https" {
            return Err(reject("scheme must be https"));
        }

        match url.host() {
            None => Err(reject("missing host")),
            Some(Host::Ipv4(ip)) => check_ip(IpAddr::V4(ip)).map_err(|r| reject(r)),
            Some(Host::Ipv6(ip)) => check_ip(IpAddr::V6(ip)).map_err(|r| reject(r)),
            Some(Host::Domain(domain)) => {
                let domain = domain.to_ascii_lowercase();
                if domain == "localhost" || domain.ends_with(".localhost") {
                    return Err(reject("localhost"));
                }
                let addrs = self
                    .resolver
                    .resolve(&domain)
                    .await
                    .map_err(|e| reject(&format!("resolution failed: {e}")))?;
                if addrs.is_empty() {
                    return Err(reject("host resolved to no addresses"));
                }
                for ip in addrs {
                    check_ip(ip).map_err(|r| reject(&format!("resolves to {ip} ({r})")))?;
                }
                Ok(())
            }
        }
    }
}

fn check_ip(ip: IpAddr) -> Result<(), &'static str> {
    if is_global(ip) { Ok(()) } else { Err("non-global address") }
}

/// Whether `ip` is publicly routable unicast.
#[must_use]
pub fn is_global(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_global_v4(v4),
        IpAddr::V6(v6) => is_global_v6(v6),
    }
}

fn is_global_v4(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    !(a == 0                                   // this network
        || a == 10                             // private
        || a == 127                            // loopback
        || (a == 100 && (64..128).contains(&b)) // shared address space (CGNAT)
        || (a == 169 && b == 254)              // link-local
        || (a == 172 && (16..32).contains(&b)) // private
        || (a == 192 && b == 0 && c == 0)      // protocol assignments
        || (a == 192 && b == 0 && c == 2)      // documentation
        || (a == 192 && b == 168)              // private
        || (a == 198 && (18..20).contains(&b)) // benchmarking
        || (a == 198 && b == 51 && c == 100)   // documentation
        || (a == 203 && b == 0 && c == 113)    // documentation
        || a >= 224)                           // multicast, reserved, broadcast
}

fn is_global_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_global_v4(v4);
    }
    let s = ip.segments();
    !(ip.is_unspecified()
        || ip.is_loopback()
        || (s[0] & 0xff00) == 0xff00                   // multicast
        || (s[0] & 0xfe00) == 0xfc00                   // unique local
        || (s[0] & 0xffc0) == 0xfe80                   // link-local
        || (s[0] & 0xffc0) == 0xfec0                   // site-local
        || (s[0] == 0x2001 && s[1] == 0x0db8)          // documentation
        || (s[0] == 0x2001 && s[1] < 0x0200)           // protocol assignments
        || (s[0] == 0x0100 && s[1..4] == [0, 0, 0])    // discard-only
        || (s[0..6] == [0, 0, 0, 0, 0, 0]))            // ipv4-compatible
}
