//! SSRF protection for feed fetches.
//!
//! The same host check runs before the first request, on every redirect
//! target and at connect time through [`GuardedResolver`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use url::{Host, Url};

use crate::error::{FeedpollError, Result};

/// Upper bound for a single DNS lookup.
pub const DNS_TIMEOUT: Duration = Duration::from_secs(2);

/// Validate a feed URL before requesting it.
///
/// Only http and https are accepted. Unless `allow_private` is set the host
/// must not be `localhost`, a blocked literal address, or a name resolving to
/// any blocked address.
pub async fn validate_request_url(url: &str, allow_private: bool) -> Result<Url> {
    let parsed = Url::parse(url).map_err(|e| FeedpollError::InvalidUrl(format!("{url}: {e}")))?;
    check_url(&parsed, allow_private).await?;
    Ok(parsed)
}

/// Run the scheme and host checks on an already parsed URL.
pub async fn check_url(url: &Url, allow_private: bool) -> Result<()> {
    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(FeedpollError::UnsupportedScheme(scheme.to_string())),
    }

    let host = url
        .host()
        .ok_or_else(|| FeedpollError::InvalidUrl(format!("{url}: URL has no host")))?;

    if allow_private {
        return Ok(());
    }

    match host {
        Host::Domain(domain) => {
            if is_forbidden_hostname(domain) {
                return Err(FeedpollError::PrivateHostBlocked(domain.to_string()));
            }
            let port = url.port_or_known_default().unwrap_or(80);
            let addrs = resolve_host(domain, port).await?;
            ensure_public(domain, &addrs)
        }
        Host::Ipv4(ipv4) => ensure_public_ip(IpAddr::V4(ipv4)),
        Host::Ipv6(ipv6) => ensure_public_ip(IpAddr::V6(ipv6)),
    }
}

/// Resolve a redirect `Location` against the current URL and validate it.
pub async fn check_redirect(current: &Url, location: &str, allow_private: bool) -> Result<Url> {
    let target = current
        .join(location)
        .map_err(|e| FeedpollError::InvalidUrl(format!("redirect to {location}: {e}")))?;
    check_url(&target, allow_private).await?;
    Ok(target)
}

async fn resolve_host(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let lookup = tokio::net::lookup_host((host, port));
    let addrs = tokio::time::timeout(DNS_TIMEOUT, lookup)
        .await
        .map_err(|_| FeedpollError::fetch(format!("DNS lookup for {host} timed out")))?
        .map_err(|e| FeedpollError::fetch(format!("DNS lookup for {host} failed: {e}")))?
        .collect::<Vec<_>>();

    if addrs.is_empty() {
        return Err(FeedpollError::fetch(format!("{host} has no addresses")));
    }
    Ok(addrs)
}

fn ensure_public(host: &str, addrs: &[SocketAddr]) -> Result<()> {
    match addrs.iter().find(|addr| is_blocked_ip(&addr.ip())) {
        Some(addr) => Err(FeedpollError::PrivateHostBlocked(format!(
            "{host} resolves to {}",
            addr.ip()
        ))),
        None => Ok(()),
    }
}

fn ensure_public_ip(ip: IpAddr) -> Result<()> {
    if is_blocked_ip(&ip) {
        return Err(FeedpollError::PrivateHostBlocked(ip.to_string()));
    }
    Ok(())
}

/// Check if a hostname is reserved for the local machine.
fn is_forbidden_hostname(host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    host == "localhost" || host.ends_with(".localhost")
}

/// Check if an IP address must not be fetched from.
pub fn is_blocked_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => is_blocked_ipv4(ipv4),
        IpAddr::V6(ipv6) => is_blocked_ipv6(ipv6),
    }
}

fn is_blocked_ipv4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();

    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        // "This network": 0.0.0.0/8
        || octets[0] == 0
        // Shared address space (carrier-grade NAT): 100.64.0.0/10
        || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
}

fn is_blocked_ipv6(ip: &Ipv6Addr) -> bool {
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return is_blocked_ipv4(&mapped);
    }

    let first = ip.segments()[0];

    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // Unique local: fc00::/7
        || (first & 0xfe00) == 0xfc00
        // Link-local: fe80::/10
        || (first & 0xffc0) == 0xfe80
}

/// DNS resolver that refuses blocked addresses at connect time.
///
/// Installed on the per-request client so a name that changed its answer
/// after validation (DNS rebinding) still cannot reach a private host.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuardedResolver;

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(async move {
            let host = name.as_str().to_string();
            let resolved = resolve_public(&host).await;
            resolved.map_err(|e| -> BoxError { Box::new(e) })
        })
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

async fn resolve_public(host: &str) -> Result<Addrs> {
    if is_forbidden_hostname(host) {
        return Err(FeedpollError::PrivateHostBlocked(host.to_string()));
    }
    let addrs = resolve_host(host, 0).await?;
    ensure_public(host, &addrs)?;
    let addrs: Addrs = Box::new(addrs.into_iter());
    Ok(addrs)
}
