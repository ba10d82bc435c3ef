//! Client IP resolution.
//!
//! This module picks the most trustworthy public client address for a
//! request. Candidates come from the adapter-supplied IP, the socket peer
//! address and then proxy headers, where the set of headers consulted depends
//! on the hosting platform. List headers are scanned from the right (the hop
//! closest to us) and trusted proxies are skipped. An empty string means the
//! address is unknown.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use ipnet::IpNet;
use log::debug;
use thiserror::Error;
use crate::core::forwarded::forwarded_for;
use crate::models::{Platform, Request};

/// Errors that can occur while configuring trusted proxies
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    #[error("invalid trusted proxy: {0:?}")]
    Invalid(String),
}

/// IPv4 ranges that never identify a public client
const RESERVED_V4: &[(Ipv4Addr, u32)] = &[
    (Ipv4Addr::new(0, 0, 0, 0), 8),
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(100, 64, 0, 0), 10),
    (Ipv4Addr::new(127, 0, 0, 0), 8),
    (Ipv4Addr::new(169, 254, 0, 0), 16),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 0, 0, 0), 24),
    (Ipv4Addr::new(192, 0, 2, 0), 24),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
    (Ipv4Addr::new(198, 18, 0, 0), 15),
    (Ipv4Addr::new(198, 51, 100, 0), 24),
    (Ipv4Addr::new(203, 0, 113, 0), 24),
    (Ipv4Addr::new(240, 0, 0, 0), 4),
    (Ipv4Addr::new(255, 255, 255, 255), 32),
];

/// IPv6 ranges that never identify a public client
const RESERVED_V6: &[(Ipv6Addr, u32)] = &[
    // unspecified
    (Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0), 128),
    // loopback
    (Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 1), 128),
    // IPv4-mapped
    (Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0, 0), 96),
    // IPv4/IPv6 translation
    (Ipv6Addr::new(0x64, 0xff9b, 1, 0, 0, 0, 0, 0), 48),
    // discard-only
    (Ipv6Addr::new(0x100, 0, 0, 0, 0, 0, 0, 0), 64),
    // benchmarking
    (Ipv6Addr::new(0x2001, 0x2, 0, 0, 0, 0, 0, 0), 48),
    // documentation
    (Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0), 32),
    // unique local
    (Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7),
    // link-local unicast
    (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10),
];

fn in_v4_range(ip: Ipv4Addr, network: Ipv4Addr, prefix: u32) -> bool {
    let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
    u32::from(ip) & mask == u32::from(network) & mask
}

fn in_v6_range(ip: Ipv6Addr, network: Ipv6Addr, prefix: u32) -> bool {
    let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
    u128::from(ip) & mask == u128::from(network) & mask
}

/// Whether `ip` can belong to a client on the public internet
pub fn is_global(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !RESERVED_V4
            .iter()
            .any(|(network, prefix)| in_v4_range(*v4, *network, *prefix)),
        IpAddr::V6(v6) => !RESERVED_V6
            .iter()
            .any(|(network, prefix)| in_v6_range(*v6, *network, *prefix)),
    }
}

/// Parse an address that may carry brackets or a port
pub fn parse_candidate(value: &str) -> Option<IpAddr> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Some(ip);
    }
    if let Some(rest) = value.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port_ok = tail.is_empty()
            || tail
                .strip_prefix(':')
                .map_or(false, |port| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()));
        return if port_ok { host.parse::<Ipv6Addr>().ok().map(IpAddr::V6) } else { None };
    }
    let (host, port) = value.rsplit_once(':')?;
    if host.contains(':') || port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    host.parse::<Ipv4Addr>().ok().map(IpAddr::V4)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ProxyEntry {
    Addr(IpAddr),
    Net(IpNet),
}

/// Trusted proxy addresses and ranges, fixed after construction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustedProxies {
    entries: Vec<ProxyEntry>,
}

impl TrustedProxies {
    pub fn parse(list: &[String]) -> Result<Self, ProxyError> {
        let entries = list
            .iter()
            .map(|raw| {
                let value = raw.trim();
                if value.contains('/') {
                    value.parse::<IpNet>().map(ProxyEntry::Net)
                        .map_err(|_| ProxyError::Invalid(raw.clone()))
                } else {
                    value.parse::<IpAddr>().map(ProxyEntry::Addr)
                        .map_err(|_| ProxyError::Invalid(raw.clone()))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.entries.iter().any(|entry| match entry {
            ProxyEntry::Addr(addr) => addr == ip,
            ProxyEntry::Net(net) => net.contains(ip),
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Source {
    /// Comma separated addresses, scanned right to left
    List(&'static str),
    /// RFC 7239 `Forwarded`, using each element's `for` value
    Forwarded,
}

const CLOUDFLARE_SOURCES: &[Source] = &[
    Source::List("cf-connecting-ipv6"),
    Source::List("cf-connecting-ip"),
];
const FLY_SOURCES: &[Source] = &[Source::List("fly-client-ip")];
const VERCEL_SOURCES: &[Source] = &[
    Source::List("x-real-ip"),
    Source::List("x-vercel-forwarded-for"),
    Source::List("x-forwarded-for"),
];
const RENDER_SOURCES: &[Source] = &[Source::List("true-client-ip")];
const GENERIC_SOURCES: &[Source] = &[
    Source::List("x-client-ip"),
    Source::List("x-forwarded-for"),
    Source::List("cf-connecting-ip"),
    Source::List("do-connecting-ip"),
    Source::List("fastly-client-ip"),
    Source::List("true-client-ip"),
    Source::List("x-real-ip"),
    Source::List("x-cluster-client-ip"),
    Source::List("x-forwarded"),
    Source::List("forwarded-for"),
    Source::Forwarded,
    Source::List("x-appengine-user-ip"),
];

/// Resolves the client IP for a request
#[derive(Debug, Clone, Default)]
pub struct IpResolver {
    platform: Option<Platform>,
    proxies: TrustedProxies,
}

impl IpResolver {
    pub fn new(platform: Option<Platform>, proxies: TrustedProxies) -> Self {
        Self { platform, proxies }
    }

    fn accept(&self, value: &str) -> Option<IpAddr> {
        parse_candidate(value).filter(|ip| is_global(ip) && !self.proxies.contains(ip))
    }

    fn scan_list<'a>(&self, values: impl DoubleEndedIterator<Item = &'a str>) -> Option<IpAddr> {
        values.rev().find_map(|value| self.accept(value))
    }

    fn from_source(&self, request: &Request, source: Source) -> Option<IpAddr> {
        match source {
            Source::List(name) => {
                let value = request.headers().get(name)?;
                self.scan_list(value.split(','))
            }
            Source::Forwarded => {
                let value = request.headers().get("forwarded")?;
                match forwarded_for(&value) {
                    Ok(values) => self.scan_list(values.iter().map(String::as_str)),
                    Err(err) => {
                        debug!("Ignoring malformed Forwarded header: {}", err);
                        None
                    }
                }
            }
        }
    }

    /// Resolve the client IP, or `""` when no public address is found
    ///
    /// # Arguments
    ///
    /// * `request` - The normalized request; its `ip` and `remote_address`
    ///   are consulted before any header
    pub fn resolve(&self, request: &Request) -> String {
        if let Some(ip) = self.accept(request.ip()) {
            return ip.to_string();
        }
        if let Some(ip) = request.remote_address().and_then(|addr| self.accept(addr)) {
            return ip.to_string();
        }

        let sources = match self.platform {
            Some(Platform::Cloudflare) => CLOUDFLARE_SOURCES,
            Some(Platform::FlyIo) => FLY_SOURCES,
            Some(Platform::Vercel) => VERCEL_SOURCES,
            Some(Platform::Render) => RENDER_SOURCES,
            None => GENERIC_SOURCES,
        };

        sources
            .iter()
            .find_map(|source| self.from_source(request, *source))
            .map(|ip| ip.to_string())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxies(list: &[&str]) -> TrustedProxies {
        let list: Vec<String> = list.iter().map(|s| s.to_string()).collect();
        TrustedProxies::parse(&list).unwrap()
    }

    fn on(platform: Platform) -> IpResolver {
        IpResolver::new(Some(platform), TrustedProxies::default())
    }

    fn with_ip(ip: &str) -> Request {
        Request::builder().ip(ip).build()
    }

    fn with_header(name: &str, value: &str) -> Request {
        Request::builder().header(name, value).build()
    }

    #[test]
    fn test_reserved_ipv4_ranges() {
        let samples = [
            "0.0.0.0", "0.255.255.255",
            "10.0.0.0", "10.128.3.4", "10.255.255.255",
            "100.64.0.0", "100.100.100.100", "100.127.255.255",
            "127.0.0.1", "127.255.255.255",
            "169.254.0.0", "169.254.169.254", "169.254.255.255",
            "172.16.0.0", "172.20.1.1", "172.31.255.255",
            "192.0.0.0", "192.0.0.255",
            "192.0.2.0", "192.0.2.128", "192.0.2.255",
            "192.168.0.0", "192.168.1.1", "192.168.255.255",
            "198.18.0.0", "198.19.255.255",
            "198.51.100.0", "198.51.100.255",
            "203.0.113.0", "203.0.113.255",
            "240.0.0.0", "250.1.2.3", "255.255.255.254",
            "255.255.255.255",
        ];
        let resolver = IpResolver::default();
        for ip in samples {
            assert_eq!(resolver.resolve(&with_ip(ip)), "", "{} should be rejected", ip);
        }
    }

    #[test]
    fn test_public_ipv4_boundaries() {
        let resolver = IpResolver::default();
        let public = [
            "1.1.1.1",
            "9.255.255.255",
            "11.0.0.0",
            "100.63.255.255",
            "100.128.0.0",
            "172.15.255.255",
            "172.32.0.0",
            "198.17.255.255",
            "198.20.0.0",
            "239.255.255.255",
        ];
        for ip in public {
            assert_eq!(resolver.resolve(&with_ip(ip)), ip);
        }
    }

    #[test]
    fn test_reserved_ipv6_ranges() {
        let resolver = IpResolver::default();
        for ip in [
            "::", "::1", "::ffff:8.8.8.8", "64:ff9b:1::1", "100::1", "2001:2::1",
            "2001:db8::1", "fc00::1", "fdff:ffff::1", "fe80::1", "febf::1",
        ] {
            assert_eq!(resolver.resolve(&with_ip(ip)), "", "{} should be rejected", ip);
        }
        assert_eq!(resolver.resolve(&with_ip("2606:4700:4700::1111")), "2606:4700:4700::1111");
    }

    #[test]
    fn test_proxy_stripping() {
        let request = with_header("X-Forwarded-For", "1.1.1.1, 8.8.8.8, 9.9.9.9");

        let resolver = IpResolver::new(None, proxies(&["9.9.9.9"]));
        assert_eq!(resolver.resolve(&request), "8.8.8.8");

        let resolver = IpResolver::new(None, proxies(&["9.9.9.9", "8.8.8.8"]));
        assert_eq!(resolver.resolve(&request), "1.1.1.1");

        let resolver = IpResolver::new(None, proxies(&["8.8.0.0/16", "9.9.9.9"]));
        assert_eq!(resolver.resolve(&request), "1.1.1.1");
    }

    #[test]
    fn test_rightmost_public_address_wins() {
        let request = with_header("X-Forwarded-For", "1.1.1.1, 8.8.8.8, 10.0.0.1, not-an-ip");
        assert_eq!(IpResolver::default().resolve(&request), "8.8.8.8");
    }

    #[test]
    fn test_exhausted_candidates_yield_empty() {
        let request = with_header("X-Forwarded-For", "10.0.0.1, 192.168.1.1");
        assert_eq!(IpResolver::default().resolve(&request), "");
    }

    #[test]
    fn test_request_ip_then_socket_then_headers() {
        let request = Request::builder()
            .ip("1.1.1.1")
            .remote_address("8.8.8.8:443")
            .header("X-Forwarded-For", "9.9.9.9")
            .build();
        assert_eq!(IpResolver::default().resolve(&request), "1.1.1.1");

        let request = Request::builder()
            .ip("127.0.0.1")
            .remote_address("8.8.8.8:443")
            .header("X-Forwarded-For", "9.9.9.9")
            .build();
        assert_eq!(IpResolver::default().resolve(&request), "8.8.8.8");

        let request = Request::builder()
            .remote_address("[::1]:443")
            .header("X-Forwarded-For", "9.9.9.9")
            .build();
        assert_eq!(IpResolver::default().resolve(&request), "9.9.9.9");
    }

    #[test]
    fn test_trusted_request_ip_is_skipped() {
        let request = Request::builder().ip("9.9.9.9").header("X-Forwarded-For", "1.1.1.1").build();
        let resolver = IpResolver::new(None, proxies(&["9.9.9.9"]));
        assert_eq!(resolver.resolve(&request), "1.1.1.1");
    }

    #[test]
    fn test_platform_specific_headers() {
        let request = Request::builder()
            .header("CF-Connecting-IP", "1.1.1.1")
            .header("Fly-Client-IP", "8.8.8.8")
            .header("X-Forwarded-For", "9.9.9.9")
            .build();

        assert_eq!(on(Platform::Cloudflare).resolve(&request), "1.1.1.1");
        assert_eq!(on(Platform::FlyIo).resolve(&request), "8.8.8.8");
        assert_eq!(on(Platform::Vercel).resolve(&request), "9.9.9.9");
        // Render only trusts True-Client-IP
        assert_eq!(on(Platform::Render).resolve(&request), "");
        // Without a platform the generic order applies
        assert_eq!(IpResolver::default().resolve(&request), "9.9.9.9");
    }

    #[test]
    fn test_vercel_prefers_real_ip() {
        let request = Request::builder()
            .header("X-Vercel-Forwarded-For", "8.8.8.8")
            .header("X-Real-IP", "1.1.1.1")
            .build();
        assert_eq!(on(Platform::Vercel).resolve(&request), "1.1.1.1");
    }

    #[test]
    fn test_forwarded_header() {
        let request = with_header(
            "Forwarded",
            "for=1.1.1.1;proto=https, for=\"[2606:4700::1111]:4711\"",
        );
        assert_eq!(IpResolver::default().resolve(&request), "2606:4700::1111");

        let resolver = IpResolver::new(None, proxies(&["2606:4700::/32"]));
        assert_eq!(resolver.resolve(&request), "1.1.1.1");
    }

    #[test]
    fn test_malformed_forwarded_falls_through() {
        let request = Request::builder()
            .header("Forwarded", "for=1.1.1.1:80")
            .header("X-AppEngine-User-IP", "8.8.8.8")
            .build();
        assert_eq!(IpResolver::default().resolve(&request), "8.8.8.8");
    }

    #[test]
    fn test_parse_candidate() {
        assert_eq!(parse_candidate(" 1.2.3.4 "), Some("1.2.3.4".parse().unwrap()));
        assert_eq!(parse_candidate("1.2.3.4:8080"), Some("1.2.3.4".parse().unwrap()));
        assert_eq!(parse_candidate("[2001:db8::1]:80"), Some("2001:db8::1".parse().unwrap()));
        assert_eq!(parse_candidate("[2001:db8::1]"), Some("2001:db8::1".parse().unwrap()));
        assert_eq!(parse_candidate("[2001:db8::1]x"), None);
        assert_eq!(parse_candidate("1.2.3.4:"), None);
        assert_eq!(parse_candidate("unknown"), None);
        assert_eq!(parse_candidate(""), None);
    }

    #[test]
    fn test_invalid_proxy_is_rejected() {
        let err = TrustedProxies::parse(&["10.0.0.0/33".to_string()]).unwrap_err();
        assert_eq!(err, ProxyError::Invalid("10.0.0.0/33".to_string()));
        assert!(TrustedProxies::parse(&["nope".to_string()]).is_err());
    }
}
