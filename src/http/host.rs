// Host header parsing into (domain, subdomain) routing keys.

use std::net::IpAddr;

/// Routing keys extracted from a Host header. The subdomain carries a
/// trailing dot unless empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKeys {
    pub domain: String,
    pub subdomain: String,
}

/// Strips an optional port, unwrapping bracketed IPv6 literals.
pub fn strip_port(host: &str) -> &str {
    if let Some(stripped) = host.strip_prefix('[') {
        return match stripped.split_once(']') {
            Some((addr, _)) => addr,
            None => stripped,
        };
    }
    // More than one ':' with no brackets is a bare IPv6 literal.
    if host.matches(':').count() > 1 {
        return host;
    }
    match host.rsplit_once(':') {
        Some((h, _)) => h,
        None => host,
    }
}

fn is_loopback(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    matches!(host.parse::<IpAddr>(), Ok(ip) if ip.is_loopback())
}

/// True when the last label is an integer, i.e. the host is a raw IPv4
/// address (or a bare IPv6 literal).
pub fn is_raw_ip(host: &str) -> bool {
    if host.contains(':') {
        return host.parse::<IpAddr>().is_ok();
    }
    match host.rsplit_once('.') {
        Some((_, last)) => last.parse::<u64>().is_ok(),
        None => host.parse::<u64>().is_ok(),
    }
}

/// Splits a Host header value into routing keys.
///
/// Rules, in order: loopback hosts collapse onto the `localhost` domain;
/// a dotless host is all domain; a numeric last label keeps the whole
/// host as the domain; a `.localhost` suffix puts everything before it in
/// the subdomain; otherwise the last two labels are the domain and the
/// rest is the subdomain, trailing dot included.
pub fn parse_host(raw: &str) -> HostKeys {
    let host = strip_port(raw);

    if is_loopback(host) {
        return HostKeys {
            domain: "localhost".to_string(),
            subdomain: String::new(),
        };
    }

    if !host.contains('.') {
        return HostKeys {
            domain: host.to_string(),
            subdomain: String::new(),
        };
    }

    if is_raw_ip(host) {
        return HostKeys {
            domain: host.to_string(),
            subdomain: String::new(),
        };
    }

    if let Some(prefix) = host.strip_suffix(".localhost") {
        return HostKeys {
            domain: "localhost".to_string(),
            subdomain: format!("{}.", prefix),
        };
    }

    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 {
        return HostKeys {
            domain: host.to_string(),
            subdomain: String::new(),
        };
    }
    let domain = labels[labels.len() - 2..].join(".");
    let subdomain = format!("{}.", labels[..labels.len() - 2].join("."));
    HostKeys { domain, subdomain }
}

/// Canonical form of a subdomain registration key: trailing dot appended
/// to every non-empty name except the wildcard `*`.
pub fn normalize_subdomain_name(name: &str) -> String {
    match name {
        "" => String::new(),
        "*" | "*." => "*".to_string(),
        other if other.ends_with('.') => other.to_string(),
        other => format!("{}.", other),
    }
}
