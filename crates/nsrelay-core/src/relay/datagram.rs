//! One udp relay episode.
//!
//! An episode starts when the listen socket becomes readable. It drains every
//! queued datagram, forwards each through an upstream socket dedicated to its
//! sender, then relays replies back until every upstream has answered as many
//! datagrams as it was sent or the reply window closes. The caller re-arms the
//! listen socket afterwards.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::RelayError;

/// Largest payload a udp datagram can carry.
const MAX_DATAGRAM: usize = 65_535;

/// What one episode moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpisodeSummary {
    /// Datagrams drained from the listen socket and forwarded.
    pub datagrams: usize,
    /// Distinct senders seen.
    pub senders: usize,
    /// Replies relayed back to senders.
    pub replies: usize,
}

/// Datagrams from one sender, in arrival order.
struct Batch {
    peer: SocketAddr,
    payloads: Vec<Vec<u8>>,
}

/// Read every datagram currently queued on a non-blocking socket.
fn drain(listener: &StdUdpSocket) -> io::Result<Vec<Batch>> {
    let mut batches: Vec<Batch> = Vec::new();
    let mut by_peer: HashMap<SocketAddr, usize> = HashMap::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (n, peer) = match listener.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        let slot = *by_peer.entry(peer).or_insert_with(|| {
            batches.push(Batch {
                peer,
                payloads: Vec::new(),
            });
            batches.len() - 1
        });
        batches[slot].payloads.push(buf[..n].to_vec());
    }
    Ok(batches)
}

async fn resolve(target: &str) -> io::Result<SocketAddr> {
    tokio::net::lookup_host(target).await?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{target} did not resolve to any address"),
        )
    })
}

/// Run one episode on `listener`, a non-blocking duplicate of the listen
/// socket, relaying to `target`.
pub async fn run_episode(
    listener: StdUdpSocket,
    target: &str,
    reply_window: Duration,
) -> Result<EpisodeSummary, RelayError> {
    let batches = drain(&listener)?;
    if batches.is_empty() {
        return Ok(EpisodeSummary::default());
    }

    let upstream_addr = resolve(target).await?;
    let listener = Arc::new(UdpSocket::from_std(listener)?);
    let mut summary = EpisodeSummary {
        senders: batches.len(),
        ..EpisodeSummary::default()
    };

    let mut flows = JoinSet::new();
    for batch in batches {
        summary.datagrams += batch.payloads.len();
        let listener = Arc::clone(&listener);
        flows.spawn(relay_batch(listener, batch, upstream_addr, reply_window));
    }

    let mut first_error = None;
    while let Some(joined) = flows.join_next().await {
        match joined {
            Ok(Ok(replies)) => summary.replies += replies,
            Ok(Err(e)) => {
                warn!(upstream = target, error = %e, "Datagram flow failed");
                first_error.get_or_insert(e);
            }
            Err(e) => warn!(upstream = target, error = %e, "Datagram flow task aborted"),
        }
    }

    match first_error {
        Some(e) => Err(e.into()),
        None => Ok(summary),
    }
}

async fn relay_batch(
    listener: Arc<UdpSocket>,
    batch: Batch,
    upstream_addr: SocketAddr,
    reply_window: Duration,
) -> io::Result<usize> {
    let local = if upstream_addr.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    };
    let upstream = UdpSocket::bind(local).await?;
    upstream.connect(upstream_addr).await?;

    for payload in &batch.payloads {
        upstream.send(payload).await?;
    }

    let expected = batch.payloads.len();
    let mut replies = 0;
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let waited = tokio::time::timeout(reply_window, async {
        while replies < expected {
            let n = upstream.recv(&mut buf).await?;
            listener.send_to(&buf[..n], batch.peer).await?;
            replies += 1;
        }
        Ok::<_, io::Error>(())
    })
    .await;

    match waited {
        Ok(result) => result?,
        Err(_) => debug!(peer = %batch.peer, replies, expected, "Reply window closed"),
    }
    Ok(replies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn nonblocking_listener() -> StdUdpSocket {
        let socket = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        socket
    }

    #[test]
    fn test_drain_groups_by_sender_in_order() {
        let listener = nonblocking_listener();
        let addr = listener.local_addr().unwrap();
        let a = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let b = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        a.send_to(b"a1", addr).unwrap();
        b.send_to(b"b1", addr).unwrap();
        a.send_to(b"a2", addr).unwrap();

        let batches = drain(&listener).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].peer, a.local_addr().unwrap());
        assert_eq!(batches[0].payloads, vec![b"a1".to_vec(), b"a2".to_vec()]);
        assert_eq!(batches[1].payloads, vec![b"b1".to_vec()]);
    }

    #[test]
    fn test_drain_empty_socket() {
        let listener = nonblocking_listener();
        assert!(drain(&listener).unwrap().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_episode_relays_request_and_reply() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..n], from).await.unwrap();
        });

        let listener = nonblocking_listener();
        let listen_addr = listener.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hello", listen_addr).await.unwrap();
        // Let the datagram land before draining
        tokio::time::sleep(Duration::from_millis(20)).await;

        let summary = run_episode(listener, &echo_addr.to_string(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(
            summary,
            EpisodeSummary {
                datagrams: 1,
                senders: 1,
                replies: 1,
            }
        );

        let mut buf = [0u8; 16];
        let (n, from) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, listen_addr);
    }

    #[test_log::test(tokio::test)]
    async fn test_silent_upstream_ends_at_window() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listener = nonblocking_listener();
        let client = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(b"anyone?", listener.local_addr().unwrap()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let summary = run_episode(
            listener,
            &silent.local_addr().unwrap().to_string(),
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        assert_eq!(summary.datagrams, 1);
        assert_eq!(summary.replies, 0);
    }
}
