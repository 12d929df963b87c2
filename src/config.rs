use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Immutable runtime configuration, assembled once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    /// Upstream recursive nameservers, tried in order.
    pub nameservers: Vec<SocketAddr>,
    /// DNS suffixes routed to dedicated upstreams, first match wins.
    pub stub_zones: Vec<StubZone>,
    /// Lowercased FQDN suffixes appended during search lookups.
    pub search_domains: Vec<String>,
    pub enable_search: bool,
    pub no_recursion: bool,
    /// Minimum label dots before a query is forwarded at all.
    pub fwd_ndots: usize,
    /// Minimum label dots before an initial absolute lookup is tried.
    pub ndots: usize,
    pub cache_capacity: i64,
    pub cache_ttl: u32,
    pub cache_stale_ttl: u32,
    pub cache_ttl_from_response: bool,
    pub cache_ttl_max: u32,
    /// Cache only NOERROR responses and keep trying upstreams on anything else.
    pub cache_non_negative: bool,
    pub read_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StubZone {
    /// Lowercased FQDN suffix, trailing dot included.
    pub zone: String,
    pub nameservers: Vec<SocketAddr>,
}

/// Appends `:53` to bare hosts (including bracketed IPv6) and parses the
/// result. The host part must be an IP address, the port in [1, 65535].
pub fn normalize_host_port(input: &str) -> Result<SocketAddr> {
    let trimmed = input.trim();
    let with_port = if trimmed.ends_with(']') || !trimmed.contains(':') {
        format!("{trimmed}:53")
    } else {
        trimmed.to_string()
    };
    let addr: SocketAddr = with_port
        .parse()
        .with_context(|| format!("invalid address: {input}"))?;
    if addr.port() == 0 {
        bail!("invalid port in address: {input}");
    }
    Ok(addr)
}

/// Lowercased FQDN form with a trailing dot.
pub fn fqdn(input: &str) -> String {
    let mut s = input.trim().to_ascii_lowercase();
    if !s.ends_with('.') {
        s.push('.');
    }
    s
}

/// A search domain needs at least one dot in its name.
pub fn parse_search_domain(input: &str) -> Result<String> {
    let domain = input.trim();
    if domain.is_empty() {
        bail!("empty search domain");
    }
    if !domain.trim_end_matches('.').contains('.') {
        bail!("search domain must have at least one dot in name: {input}");
    }
    Ok(fqdn(domain))
}

/// Parses one `domain[,domain]/host[:port][,host[:port]]` stub-zone flag
/// into a zone entry per domain, all sharing the host list.
pub fn parse_stub_zone(input: &str) -> Result<Vec<StubZone>> {
    let (domains, hosts) = input
        .split_once('/')
        .with_context(|| format!("invalid stub zone (expected domain/host): {input}"))?;
    if domains.is_empty() || hosts.is_empty() {
        bail!("invalid stub zone (expected domain/host): {input}");
    }

    let mut nameservers = Vec::new();
    for host in hosts.split(',') {
        nameservers.push(normalize_host_port(host)?);
    }

    let mut zones = Vec::new();
    for domain in domains.split(',') {
        let domain = domain.trim();
        if domain.is_empty() || domain == "." {
            bail!("stub zone domain is not a fully-qualified domain name: {input}");
        }
        zones.push(StubZone {
            zone: fqdn(domain),
            nameservers: nameservers.clone(),
        });
    }
    Ok(zones)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_appends_default_port() {
        assert_eq!(
            normalize_host_port("1.1.1.1").unwrap(),
            "1.1.1.1:53".parse().unwrap()
        );
        assert_eq!(
            normalize_host_port("8.8.8.8:5353").unwrap(),
            "8.8.8.8:5353".parse().unwrap()
        );
        assert_eq!(
            normalize_host_port("[2001:db8::1]").unwrap(),
            "[2001:db8::1]:53".parse().unwrap()
        );
    }

    #[test]
    fn normalize_rejects_bad_input() {
        assert!(normalize_host_port("not-an-ip").is_err());
        assert!(normalize_host_port("example.com:53").is_err());
        assert!(normalize_host_port("1.1.1.1:0").is_err());
    }

    #[test]
    fn search_domain_requires_a_dot() {
        assert_eq!(
            parse_search_domain("svc.Cluster.Local").unwrap(),
            "svc.cluster.local."
        );
        assert!(parse_search_domain("local").is_err());
        assert!(parse_search_domain("").is_err());
    }

    #[test]
    fn stub_zone_parses_domains_and_hosts() {
        let zones =
            parse_stub_zone("corp.example.com,corp.example.net/10.0.0.1,10.0.0.2:5353").unwrap();
        assert_eq!(zones.len(), 2);
        assert_eq!(zones[0].zone, "corp.example.com.");
        assert_eq!(zones[1].zone, "corp.example.net.");
        assert_eq!(
            zones[0].nameservers,
            vec![
                "10.0.0.1:53".parse().unwrap(),
                "10.0.0.2:5353".parse().unwrap()
            ]
        );
    }

    #[test]
    fn stub_zone_rejects_malformed_input() {
        assert!(parse_stub_zone("corp.example.com").is_err());
        assert!(parse_stub_zone("/10.0.0.1").is_err());
        assert!(parse_stub_zone("corp.example.com/").is_err());
        assert!(parse_stub_zone("./10.0.0.1").is_err());
    }
}
