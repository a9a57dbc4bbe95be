//! Relay engines and per-flow setup.
//!
//! A stream flow dials the connect address selected for its listener and then
//! runs either the descriptor-forwarding unix relay (both sides unix) or the
//! generic byte relay. A datagram flow is one [`datagram::run_episode`].

pub mod ancillary;
pub mod datagram;
pub mod stream;

use std::io;
use std::sync::Arc;

use nsrelay_config::RelayConfig;
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

use crate::address::Protocol;
use crate::error::RelayError;
use crate::listener::unix_socket_addr;
use crate::mapping::PortMapping;
use crate::registry::Accepted;

/// Bytes moved by a finished stream flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transferred {
    pub to_destination: u64,
    pub to_source: u64,
}

/// Where flows from one listener are relayed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub protocol: Protocol,
    pub address: String,
    pub is_abstract: bool,
}

impl ConnectTarget {
    /// Target for the listener at `listen_index`.
    pub fn for_listener(mapping: &PortMapping, listen_index: usize) -> Self {
        let connect = mapping.connect();
        Self {
            protocol: connect.protocol,
            address: mapping.connect_address(listen_index).to_string(),
            is_abstract: connect.is_abstract_unix,
        }
    }
}

/// Dialed destination of a stream flow.
#[derive(Debug)]
enum Upstream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

async fn dial(target: &ConnectTarget) -> io::Result<Upstream> {
    match target.protocol {
        Protocol::Tcp => Ok(Upstream::Tcp(TcpStream::connect(&target.address).await?)),
        Protocol::Unix => {
            let addr = unix_socket_addr(&target.address, target.is_abstract)?;
            let stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
            stream.set_nonblocking(true)?;
            Ok(Upstream::Unix(UnixStream::from_std(stream)?))
        }
        Protocol::Udp => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "stream flows cannot target a udp address",
        )),
    }
}

/// Relay one accepted connection to `target`. Must run inside the runtime.
pub async fn serve_connection(
    inbound: Accepted,
    target: &ConnectTarget,
    config: Arc<RelayConfig>,
) -> Result<Transferred, RelayError> {
    let upstream = dial(target).await?;
    debug!(address = %target.address, "Connected upstream");

    match (inbound, upstream) {
        (Accepted::Unix(src), Upstream::Unix(dst)) => {
            src.set_nonblocking(true)?;
            let src = UnixStream::from_std(src)?;
            ancillary::relay_unix(src, dst, &config).await
        }
        (Accepted::Unix(src), Upstream::Tcp(dst)) => {
            src.set_nonblocking(true)?;
            stream::relay_streams(UnixStream::from_std(src)?, dst).await
        }
        (Accepted::Tcp(src), Upstream::Unix(dst)) => {
            src.set_nonblocking(true)?;
            stream::relay_streams(TcpStream::from_std(src)?, dst).await
        }
        (Accepted::Tcp(src), Upstream::Tcp(dst)) => {
            src.set_nonblocking(true)?;
            stream::relay_streams(TcpStream::from_std(src)?, dst).await
        }
    }
}
