//! Listener acquisition on the listen side.
//!
//! Opens one OS socket per listen address (a listening stream socket, or a
//! bound datagram socket) and hands each back as an [`OwnedFd`] so it can be
//! moved across the handoff channel. The output order matches the address
//! order of the [`EndpointSpec`].

use std::io;
use std::net::{TcpListener, UdpSocket};
use std::os::fd::OwnedFd;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr as UnixSocketAddr, UnixListener};

use nsrelay_config::ListenConfig;
use tracing::{debug, info};

use crate::address::{EndpointSpec, Protocol};
use crate::error::{ProxyError, ProxyResult};
use crate::retry::retry_with_backoff;

/// Build the socket address for a unix endpoint.
pub fn unix_socket_addr(path: &str, is_abstract: bool) -> io::Result<UnixSocketAddr> {
    if is_abstract {
        UnixSocketAddr::from_abstract_name(path.as_bytes())
    } else {
        UnixSocketAddr::from_pathname(path)
    }
}

/// Open every listen address of `spec`, in order.
///
/// For a filesystem unix socket a stale socket file at the path is removed
/// first; a missing file is fine, any other removal error is returned.
pub fn acquire_listeners(spec: &EndpointSpec, config: &ListenConfig) -> ProxyResult<Vec<OwnedFd>> {
    if let Some(path) = spec.unix_path() {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path, "Removed stale unix socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    spec.addresses
        .iter()
        .map(|addr| {
            let fd = open_with_retry(spec, addr, config)?;
            info!(protocol = %spec.protocol, addr, "Listening");
            Ok(fd)
        })
        .collect()
}

fn open_with_retry(spec: &EndpointSpec, addr: &str, config: &ListenConfig) -> ProxyResult<OwnedFd> {
    let backoff = config.retry_backoff();
    retry_with_backoff(config.bind_attempts, backoff, |_| open_one(spec, addr)).map_err(|source| {
        ProxyError::ListenFailed {
            addr: addr.to_string(),
            attempts: config.bind_attempts.max(1),
            backoff,
            source,
        }
    })
}

fn open_one(spec: &EndpointSpec, addr: &str) -> io::Result<OwnedFd> {
    match spec.protocol {
        Protocol::Tcp => TcpListener::bind(addr).map(OwnedFd::from),
        Protocol::Udp => UdpSocket::bind(addr).map(OwnedFd::from),
        Protocol::Unix => {
            let sock_addr = unix_socket_addr(addr, spec.is_abstract_unix)?;
            UnixListener::bind_addr(&sock_addr).map(OwnedFd::from)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fast_config() -> ListenConfig {
        ListenConfig {
            bind_attempts: 2,
            retry_backoff_ms: 1,
        }
    }

    #[test]
    fn test_tcp_listener_accepts() {
        let spec = EndpointSpec::parse("tcp:127.0.0.1:0").unwrap();
        let fds = acquire_listeners(&spec, &fast_config()).unwrap();
        assert_eq!(fds.len(), 1);

        let listener = TcpListener::from(fds.into_iter().next().unwrap());
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        assert!(listener.accept().is_ok());
    }

    #[test]
    fn test_udp_socket_bound() {
        let spec = EndpointSpec::parse("udp:127.0.0.1:0").unwrap();
        let fds = acquire_listeners(&spec, &fast_config()).unwrap();
        let socket = UdpSocket::from(fds.into_iter().next().unwrap());
        assert!(socket.local_addr().unwrap().port() != 0);
    }

    #[test]
    fn test_busy_port_fails_after_retries() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let spec = EndpointSpec::parse(&format!("tcp:127.0.0.1:{port}")).unwrap();

        let err = acquire_listeners(&spec, &fast_config()).unwrap_err();
        match err {
            ProxyError::ListenFailed {
                attempts, backoff, ..
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(backoff, Duration::from_millis(1));
            }
            other => panic!("expected ListenFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_unix_stale_socket_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("proxy.sock");
        // Leave a stale socket file behind
        drop(UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let spec = EndpointSpec::parse(&format!("unix:{}", path.display())).unwrap();
        let fds = acquire_listeners(&spec, &fast_config()).unwrap();
        assert_eq!(fds.len(), 1);
        assert!(std::os::unix::net::UnixStream::connect(&path).is_ok());
    }

    #[test]
    fn test_abstract_unix_listener() {
        let name = format!("nsrelay-test-{}", std::process::id());
        let spec = EndpointSpec::parse(&format!("unix:@{name}")).unwrap();
        let fds = acquire_listeners(&spec, &fast_config()).unwrap();
        let _listener = UnixListener::from(fds.into_iter().next().unwrap());

        let addr = unix_socket_addr(&name, true).unwrap();
        assert!(std::os::unix::net::UnixStream::connect_addr(&addr).is_ok());
    }

    #[test]
    fn test_order_preserved_for_ranges() {
        let a = TcpListener::bind("127.0.0.1:0").unwrap();
        let b = TcpListener::bind("127.0.0.1:0").unwrap();
        let (pa, pb) = (a.local_addr().unwrap().port(), b.local_addr().unwrap().port());
        drop((a, b));

        let spec = EndpointSpec::parse(&format!("tcp:127.0.0.1:{pb},{pa}")).unwrap();
        let fds = acquire_listeners(&spec, &fast_config()).unwrap();
        let ports: Vec<u16> = fds
            .into_iter()
            .map(|fd| TcpListener::from(fd).local_addr().unwrap().port())
            .collect();
        assert_eq!(ports, vec![pb, pa]);
    }
}
