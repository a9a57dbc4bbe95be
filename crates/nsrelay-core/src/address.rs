//! Endpoint specification parsing.
//!
//! Grammar: `proto:address` or `proto:address:ports`, where `proto` is one of
//! `tcp`, `udp`, `unix`. `ports` is a comma-separated list of `N` or `N-M`
//! (inclusive), each expanded into `host:port` entries in textual order.
//! A unix address prefixed with `@` names an abstract socket.
//!
//! ```
//! use nsrelay_core::address::{EndpointSpec, Protocol};
//!
//! let spec: EndpointSpec = "tcp:0.0.0.0:80,8000-8001".parse().unwrap();
//! assert_eq!(spec.protocol, Protocol::Tcp);
//! assert_eq!(spec.addresses, ["0.0.0.0:80", "0.0.0.0:8000", "0.0.0.0:8001"]);
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::{ProxyError, ProxyResult};

/// Transport protocol of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Unix,
}

impl Protocol {
    /// Whether endpoints of this protocol accept connections.
    pub fn is_stream(self) -> bool {
        !matches!(self, Protocol::Udp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Unix => write!(f, "unix"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "unix" => Ok(Protocol::Unix),
            other => Err(format!("unknown protocol {other:?}")),
        }
    }
}

/// A parsed endpoint: protocol plus the ordered list of concrete addresses.
///
/// For `unix` there is exactly one address, the socket path without any
/// `@` prefix. For `tcp`/`udp` the order of `addresses` matches the order of
/// the port tokens and is significant: it is zipped against the peer spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    pub protocol: Protocol,
    pub addresses: Vec<String>,
    pub is_abstract_unix: bool,
}

impl EndpointSpec {
    /// Parse a textual endpoint specification.
    pub fn parse(spec: &str) -> ProxyResult<Self> {
        let (proto, rest) = spec
            .split_once(':')
            .ok_or_else(|| ProxyError::invalid_spec(spec, "missing protocol separator"))?;
        let protocol: Protocol = proto
            .parse()
            .map_err(|reason: String| ProxyError::invalid_spec(spec, reason))?;

        if protocol == Protocol::Unix {
            let (path, is_abstract) = match rest.strip_prefix('@') {
                Some(name) => (name, true),
                None => (rest, false),
            };
            if path.is_empty() {
                return Err(ProxyError::invalid_spec(spec, "empty unix socket path"));
            }
            return Ok(Self {
                protocol,
                addresses: vec![path.to_string()],
                is_abstract_unix: is_abstract,
            });
        }

        let (host, ports) = split_host_ports(rest);
        if host.is_empty() {
            return Err(ProxyError::invalid_spec(spec, "empty host"));
        }

        let addresses = match ports {
            None => vec![host.to_string()],
            Some(ports) => expand_ports(ports)
                .map_err(|reason| ProxyError::invalid_spec(spec, reason))?
                .into_iter()
                .map(|port| format!("{host}:{port}"))
                .collect(),
        };

        Ok(Self {
            protocol,
            addresses,
            is_abstract_unix: false,
        })
    }

    /// Number of concrete addresses.
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    /// Always false for a parsed spec; present for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Filesystem path of a non-abstract unix endpoint, if this is one.
    pub fn unix_path(&self) -> Option<&str> {
        match (self.protocol, self.is_abstract_unix) {
            (Protocol::Unix, false) => self.addresses.first().map(String::as_str),
            _ => None,
        }
    }
}

impl FromStr for EndpointSpec {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for EndpointSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = if self.is_abstract_unix { "@" } else { "" };
        write!(f, "{}:{prefix}{}", self.protocol, self.addresses.join(","))
    }
}

/// Split `host[:ports]`, honouring a bracketed IPv6 host such as `[::1]:80`.
fn split_host_ports(rest: &str) -> (&str, Option<&str>) {
    if rest.starts_with('[') {
        if let Some(end) = rest.find(']') {
            let (host, tail) = rest.split_at(end + 1);
            return (host, tail.strip_prefix(':'));
        }
    }
    match rest.split_once(':') {
        Some((host, ports)) => (host, Some(ports)),
        None => (rest, None),
    }
}

/// Expand a comma-separated list of ports and inclusive ranges.
fn expand_ports(list: &str) -> Result<Vec<u16>, String> {
    let mut ports = Vec::new();
    for token in list.split(',') {
        let (base, end) = parse_port_range(token)?;
        ports.extend(base..=end);
    }
    Ok(ports)
}

/// Parse `N` or `N-M` into an inclusive `(base, end)` pair.
fn parse_port_range(token: &str) -> Result<(u16, u16), String> {
    let mut parts = token.split('-');
    let base = parse_port(parts.next().unwrap_or_default())?;
    let end = match parts.next() {
        Some(end) => parse_port(end)?,
        None => base,
    };
    if parts.next().is_some() {
        return Err(format!("invalid port range {token:?}"));
    }
    if end < base {
        return Err(format!("port range {token:?} ends before it starts"));
    }
    Ok((base, end))
}

fn parse_port(text: &str) -> Result<u16, String> {
    text.trim()
        .parse::<u16>()
        .map_err(|e| format!("invalid port {text:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_single_port() {
        let spec = EndpointSpec::parse("tcp:127.0.0.1:8080").unwrap();
        assert_eq!(spec.protocol, Protocol::Tcp);
        assert_eq!(spec.addresses, ["127.0.0.1:8080"]);
        assert!(!spec.is_abstract_unix);
    }

    #[test]
    fn test_range_expands_ascending() {
        let spec = EndpointSpec::parse("tcp:0.0.0.0:8000-8002").unwrap();
        assert_eq!(
            spec.addresses,
            ["0.0.0.0:8000", "0.0.0.0:8001", "0.0.0.0:8002"]
        );
    }

    #[test]
    fn test_reversed_range_rejected() {
        let err = EndpointSpec::parse("tcp:0.0.0.0:8000-7999").unwrap_err();
        assert!(matches!(err, ProxyError::InvalidAddressSpec { .. }));
    }

    #[test]
    fn test_list_keeps_textual_order() {
        let spec = EndpointSpec::parse("udp:10.0.0.1:53,5000-5001,22").unwrap();
        assert_eq!(spec.protocol, Protocol::Udp);
        assert_eq!(
            spec.addresses,
            ["10.0.0.1:53", "10.0.0.1:5000", "10.0.0.1:5001", "10.0.0.1:22"]
        );
    }

    #[test]
    fn test_parse_is_deterministic() {
        let text = "tcp:0.0.0.0:9000-9003,80";
        let first = EndpointSpec::parse(text).unwrap();
        for _ in 0..5 {
            assert_eq!(EndpointSpec::parse(text).unwrap(), first);
        }
    }

    #[test]
    fn test_host_without_ports() {
        let spec = EndpointSpec::parse("tcp:localhost").unwrap();
        assert_eq!(spec.addresses, ["localhost"]);
    }

    #[test]
    fn test_bracketed_ipv6_host() {
        let spec = EndpointSpec::parse("tcp:[::1]:443,444").unwrap();
        assert_eq!(spec.addresses, ["[::1]:443", "[::1]:444"]);
    }

    #[test]
    fn test_unix_path() {
        let spec = EndpointSpec::parse("unix:/run/app.sock").unwrap();
        assert_eq!(spec.protocol, Protocol::Unix);
        assert_eq!(spec.addresses, ["/run/app.sock"]);
        assert!(!spec.is_abstract_unix);
        assert_eq!(spec.unix_path(), Some("/run/app.sock"));
    }

    #[test]
    fn test_unix_path_keeps_colons() {
        let spec = EndpointSpec::parse("unix:/tmp/a:b").unwrap();
        assert_eq!(spec.addresses, ["/tmp/a:b"]);
    }

    #[test]
    fn test_abstract_unix_strips_marker() {
        let spec = EndpointSpec::parse("unix:@lxd/proxy").unwrap();
        assert!(spec.is_abstract_unix);
        assert_eq!(spec.addresses, ["lxd/proxy"]);
        assert_eq!(spec.unix_path(), None);
        assert_eq!(spec.to_string(), "unix:@lxd/proxy");
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        assert!(EndpointSpec::parse("sctp:1.2.3.4:80").is_err());
    }

    #[test]
    fn test_missing_separator_rejected() {
        assert!(EndpointSpec::parse("tcp").is_err());
    }

    #[test]
    fn test_non_numeric_port_rejected() {
        assert!(EndpointSpec::parse("tcp:1.2.3.4:http").is_err());
        assert!(EndpointSpec::parse("tcp:1.2.3.4:80,").is_err());
        assert!(EndpointSpec::parse("tcp:1.2.3.4:1-2-3").is_err());
        assert!(EndpointSpec::parse("tcp:1.2.3.4:70000").is_err());
    }

    #[test]
    fn test_empty_unix_path_rejected() {
        assert!(EndpointSpec::parse("unix:").is_err());
        assert!(EndpointSpec::parse("unix:@").is_err());
    }

    #[test]
    fn test_protocol_stream_flag() {
        assert!(Protocol::Tcp.is_stream());
        assert!(Protocol::Unix.is_stream());
        assert!(!Protocol::Udp.is_stream());
    }
}
