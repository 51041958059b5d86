//! API endpoint grammar
//!
//! Configuration lists endpoints as `host[:port]`. The host part may be a
//! DNS name, an IPv4 address, or an IPv6 address; IPv6 can be written
//! bracketed (`[fe80::1]:8006`) or bare, in which case a trailing
//! `:<digits>` counts as the port only when the remainder still parses as
//! an address. A missing port means 8006.

use std::fmt;
use std::net::Ipv6Addr;

use thiserror::Error;

/// Default port of the Proxmox API daemon.
pub const DEFAULT_PORT: u16 = 8006;

#[derive(Error, Debug, PartialEq)]
pub enum EndpointError {
    #[error("empty endpoint")]
    Empty,

    #[error("invalid port '{0}'")]
    InvalidPort(String),

    #[error("unclosed '[' in endpoint")]
    UnclosedBracket,

    #[error("'{0}' is not a valid IPv6 address")]
    InvalidIpv6(String),
}

/// A parsed API endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Base URL of the JSON API on this endpoint.
    pub fn base_url(&self) -> String {
        if self.host.contains(':') {
            format!("https://[{}]:{}/api2/json", self.host, self.port)
        } else {
            format!("https://{}:{}/api2/json", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parse a `host[:port]` endpoint specification.
pub fn parse(spec: &str) -> Result<Endpoint, EndpointError> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(EndpointError::Empty);
    }

    if let Some(rest) = spec.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or(EndpointError::UnclosedBracket)?;
        if host.parse::<Ipv6Addr>().is_err() {
            return Err(EndpointError::InvalidIpv6(host.to_string()));
        }
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port)?,
            None if tail.is_empty() => DEFAULT_PORT,
            None => return Err(EndpointError::InvalidPort(tail.to_string())),
        };
        return Ok(Endpoint { host: host.to_string(), port });
    }

    match spec.matches(':').count() {
        0 => Ok(Endpoint { host: spec.to_string(), port: DEFAULT_PORT }),
        1 => {
            let (host, port) = spec.split_once(':').unwrap();
            if host.is_empty() {
                return Err(EndpointError::Empty);
            }
            Ok(Endpoint { host: host.to_string(), port: parse_port(port)? })
        }
        _ => parse_bare_ipv6(spec),
    }
}

/// Bare IPv6, possibly with a trailing port: the last colon splits address
/// and port only if both halves make sense that way.
fn parse_bare_ipv6(spec: &str) -> Result<Endpoint, EndpointError> {
    if let Some((addr, port)) = spec.rsplit_once(':') {
        if port.chars().all(|c| c.is_ascii_digit())
            && !port.is_empty()
            && addr.parse::<Ipv6Addr>().is_ok()
        {
            return Ok(Endpoint { host: addr.to_string(), port: parse_port(port)? });
        }
    }
    if spec.parse::<Ipv6Addr>().is_ok() {
        return Ok(Endpoint { host: spec.to_string(), port: DEFAULT_PORT });
    }
    Err(EndpointError::InvalidIpv6(spec.to_string()))
}

fn parse_port(port: &str) -> Result<u16, EndpointError> {
    port.parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| EndpointError::InvalidPort(port.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hostname_default_port() {
        let ep = parse("pve01.example.com").unwrap();
        assert_eq!(ep.host, "pve01.example.com");
        assert_eq!(ep.port, 8006);
    }

    #[test]
    fn test_hostname_with_port() {
        let ep = parse("pve01:443").unwrap();
        assert_eq!(ep.port, 443);
    }

    #[test]
    fn test_ipv4_with_port() {
        let ep = parse("192.168.1.10:8007").unwrap();
        assert_eq!(ep.host, "192.168.1.10");
        assert_eq!(ep.port, 8007);
    }

    #[test]
    fn test_bracketed_ipv6() {
        let ep = parse("[fe80::1]").unwrap();
        assert_eq!(ep.host, "fe80::1");
        assert_eq!(ep.port, 8006);
    }

    #[test]
    fn test_bracketed_ipv6_with_port() {
        let ep = parse("[2001:db8::10]:8443").unwrap();
        assert_eq!(ep.host, "2001:db8::10");
        assert_eq!(ep.port, 8443);
    }

    #[test]
    fn test_bare_ipv6_without_port() {
        let ep = parse("2001:db8::10").unwrap();
        assert_eq!(ep.host, "2001:db8::10");
        assert_eq!(ep.port, 8006);
    }

    #[test]
    fn test_bare_ipv6_with_trailing_port() {
        // The last colon separates address and port when both halves fit.
        let ep = parse("2001:db8::10:8006").unwrap();
        assert_eq!(ep.host, "2001:db8::10");
        assert_eq!(ep.port, 8006);
    }

    #[test]
    fn test_invalid_port() {
        assert_eq!(
            parse("pve01:notaport"),
            Err(EndpointError::InvalidPort("notaport".to_string()))
        );
        assert_eq!(parse("pve01:0"), Err(EndpointError::InvalidPort("0".to_string())));
    }

    #[test]
    fn test_unclosed_bracket() {
        assert_eq!(parse("[fe80::1"), Err(EndpointError::UnclosedBracket));
    }

    #[test]
    fn test_empty() {
        assert_eq!(parse(""), Err(EndpointError::Empty));
        assert_eq!(parse("  "), Err(EndpointError::Empty));
    }

    #[test]
    fn test_base_url_brackets_ipv6() {
        let ep = parse("[2001:db8::10]:8443").unwrap();
        assert_eq!(ep.base_url(), "https://[2001:db8::10]:8443/api2/json");
        let ep = parse("pve01").unwrap();
        assert_eq!(ep.base_url(), "https://pve01:8006/api2/json");
    }

    #[test]
    fn test_display_roundtrip() {
        assert_eq!(parse("pve01:8006").unwrap().to_string(), "pve01:8006");
        assert_eq!(parse("[fe80::1]").unwrap().to_string(), "[fe80::1]:8006");
    }
}
