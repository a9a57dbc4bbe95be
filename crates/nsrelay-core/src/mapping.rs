//! Pairing rules between the listen and connect endpoints.
//!
//! | listen | connect | result                                  |
//! |--------|---------|-----------------------------------------|
//! | 1      | 1       | one-to-one                              |
//! | L > 1  | 1       | every listener targets the one address  |
//! | L > 1  | C == L  | listener `i` targets connect address `i` |
//! | L > 1  | C != L  | rejected                                |
//! | 1      | C > 1   | rejected                                |
//!
//! Datagram traffic cannot be bridged to or from a stream protocol, so `udp`
//! on one side requires `udp` on the other.

use crate::address::{EndpointSpec, Protocol};
use crate::error::{ProxyError, ProxyResult};

/// A validated listen/connect pairing.
#[derive(Debug, Clone)]
pub struct PortMapping {
    listen: EndpointSpec,
    connect: EndpointSpec,
}

impl PortMapping {
    /// Validate that `listen` and `connect` can be paired.
    pub fn new(listen: EndpointSpec, connect: EndpointSpec) -> ProxyResult<Self> {
        let listen_udp = listen.protocol == Protocol::Udp;
        let connect_udp = connect.protocol == Protocol::Udp;
        if listen_udp != connect_udp {
            return Err(ProxyError::InvalidMapping(format!(
                "proxying between {} and {} is not supported",
                listen.protocol, connect.protocol
            )));
        }

        let (l, c) = (listen.len(), connect.len());
        if c > 1 && l != c {
            return Err(ProxyError::InvalidMapping(format!(
                "{l} listen address(es) cannot be mapped onto {c} connect addresses"
            )));
        }

        Ok(Self { listen, connect })
    }

    /// The listen side of the pairing.
    pub fn listen(&self) -> &EndpointSpec {
        &self.listen
    }

    /// The connect side of the pairing.
    pub fn connect(&self) -> &EndpointSpec {
        &self.connect
    }

    /// Connect address for the listener at `listen_index`.
    pub fn connect_address(&self, listen_index: usize) -> &str {
        let addresses = &self.connect.addresses;
        if addresses.len() == 1 {
            &addresses[0]
        } else {
            &addresses[listen_index]
        }
    }

    /// Whether flows need the descriptor-forwarding relay.
    pub fn forwards_ancillary(&self) -> bool {
        self.listen.protocol == Protocol::Unix && self.connect.protocol == Protocol::Unix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn mapping(listen: &str, connect: &str) -> ProxyResult<PortMapping> {
        PortMapping::new(
            EndpointSpec::parse(listen).unwrap(),
            EndpointSpec::parse(connect).unwrap(),
        )
    }

    #[test]
    fn test_range_to_range_maps_by_index() {
        let m = mapping("tcp:0.0.0.0:9000-9001", "tcp:127.0.0.1:9100-9101").unwrap();
        assert_eq!(m.listen().addresses, ["0.0.0.0:9000", "0.0.0.0:9001"]);
        assert_eq!(m.connect_address(0), "127.0.0.1:9100");
        assert_eq!(m.connect_address(1), "127.0.0.1:9101");
    }

    #[test]
    fn test_unequal_ranges_rejected() {
        let err = mapping("tcp:0.0.0.0:9000-9002", "tcp:127.0.0.1:9100-9101").unwrap_err();
        assert!(matches!(err, ProxyError::InvalidMapping(_)));
    }

    #[test]
    fn test_single_to_many_rejected() {
        assert!(mapping("tcp:0.0.0.0:9000", "tcp:127.0.0.1:9100-9101").is_err());
    }

    #[test]
    fn test_many_to_single_collapses() {
        let m = mapping("udp:0.0.0.0:5000-5003", "udp:10.0.0.2:53").unwrap();
        for i in 0..4 {
            assert_eq!(m.connect_address(i), "10.0.0.2:53");
        }
    }

    #[test]
    fn test_udp_to_stream_rejected() {
        assert!(mapping("udp:0.0.0.0:53", "tcp:10.0.0.2:53").is_err());
        assert!(mapping("tcp:0.0.0.0:53", "udp:10.0.0.2:53").is_err());
        assert!(mapping("unix:/tmp/a.sock", "udp:10.0.0.2:53").is_err());
    }

    #[test]
    fn test_stream_mixes_allowed() {
        let m = mapping("unix:/tmp/a.sock", "tcp:127.0.0.1:80").unwrap();
        assert!(!m.forwards_ancillary());
        let m = mapping("tcp:0.0.0.0:80", "unix:@backend").unwrap();
        assert_eq!(m.connect_address(0), "backend");
    }

    #[test]
    fn test_unix_pair_forwards_ancillary() {
        let m = mapping("unix:/tmp/a.sock", "unix:/tmp/b.sock").unwrap();
        assert!(m.forwards_ancillary());
    }
}
