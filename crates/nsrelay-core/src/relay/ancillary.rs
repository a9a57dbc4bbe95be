//! Unix relay that forwards passed descriptors along with the data.
//!
//! Every message read from one side is written to the other as a single
//! `sendmsg` carrying the same bytes and the same `SCM_RIGHTS` descriptors.
//! A short write is fatal for the flow: the descriptors ride on the first
//! byte, so a partially forwarded message cannot be completed safely.

use std::io;
use std::os::fd::AsFd;

use nsrelay_config::RelayConfig;
use tokio::io::Interest;
use tokio::net::UnixStream;
use tokio::sync::watch;
use tracing::trace;

use crate::error::RelayError;
use crate::fdpass::{Received, recv_with_fds, send_with_fds};
use crate::relay::Transferred;

/// Relay messages and descriptors between two unix streams until either
/// side ends. Both streams are closed on return.
pub async fn relay_unix(
    source: UnixStream,
    destination: UnixStream,
    config: &RelayConfig,
) -> Result<Transferred, RelayError> {
    let (closed_tx, closed_rx) = watch::channel(false);

    let (forward, backward) = tokio::join!(
        forward_until_closed(&source, &destination, config, &closed_tx, closed_rx.clone()),
        forward_until_closed(&destination, &source, config, &closed_tx, closed_rx),
    );

    Ok(Transferred {
        to_destination: forward?,
        to_source: backward?,
    })
}

async fn forward_until_closed(
    from: &UnixStream,
    to: &UnixStream,
    config: &RelayConfig,
    closed_tx: &watch::Sender<bool>,
    mut closed_rx: watch::Receiver<bool>,
) -> Result<u64, RelayError> {
    let mut copied = 0u64;
    let result = tokio::select! {
        res = forward(from, to, config, &mut copied) => res,
        _ = closed_rx.wait_for(|closed| *closed) => Ok(()),
    };
    closed_tx.send_replace(true);
    result.map(|()| copied)
}

async fn forward(
    from: &UnixStream,
    to: &UnixStream,
    config: &RelayConfig,
    copied: &mut u64,
) -> Result<(), RelayError> {
    let mut buf = vec![0u8; config.buffer_size];
    loop {
        let received = read_message(from, &mut buf).await?;
        if received.bytes == 0 {
            return Ok(());
        }
        if received.truncated {
            return Err(RelayError::ControlTruncated);
        }
        if received.fds.len() > config.max_passed_fds {
            return Err(RelayError::DescriptorLimit {
                count: received.fds.len(),
                limit: config.max_passed_fds,
            });
        }

        let written = write_message(to, &buf[..received.bytes], &received).await?;
        if written != received.bytes {
            return Err(RelayError::AncillaryTransferMismatch {
                read_bytes: received.bytes,
                written_bytes: written,
                read_fds: received.fds.len(),
                written_fds: if written > 0 { received.fds.len() } else { 0 },
            });
        }
        trace!(
            bytes = received.bytes,
            fds = received.fds.len(),
            ignored_cmsgs = received.ignored_cmsgs,
            "Forwarded message"
        );
        *copied += written as u64;
        // The peer now holds its own duplicates
        drop(received);
    }
}

fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

async fn read_message(from: &UnixStream, buf: &mut [u8]) -> io::Result<Received> {
    loop {
        from.readable().await?;
        match from.try_io(Interest::READABLE, || {
            recv_with_fds(from.as_fd(), buf).map_err(io::Error::from)
        }) {
            Ok(received) => return Ok(received),
            Err(e) if is_retryable(&e) => continue,
            Err(e) => return Err(e),
        }
    }
}

async fn write_message(to: &UnixStream, data: &[u8], received: &Received) -> io::Result<usize> {
    loop {
        to.writable().await?;
        match to.try_io(Interest::WRITABLE, || {
            send_with_fds(to.as_fd(), data, &received.fds).map_err(io::Error::from)
        }) {
            Ok(n) => return Ok(n),
            Err(e) if is_retryable(&e) => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, Write};
    use std::os::fd::OwnedFd;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::unix::pipe;
    use tokio::time::timeout;

    fn config() -> RelayConfig {
        RelayConfig::default()
    }

    async fn recv_async(stream: &UnixStream, buf: &mut [u8]) -> Received {
        read_message(stream, buf).await.unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn test_passed_descriptor_reaches_destination() {
        let (client, proxy_in) = UnixStream::pair().unwrap();
        let (proxy_out, server) = UnixStream::pair().unwrap();
        let relay = tokio::spawn(async move { relay_unix(proxy_in, proxy_out, &config()).await });

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"resource").unwrap();
        let passed = vec![OwnedFd::from(file.try_clone().unwrap())];
        client.writable().await.unwrap();
        let sent = send_with_fds(client.as_fd(), b"fd!", &passed).unwrap();
        assert_eq!(sent, 3);

        let mut buf = [0u8; 16];
        let received = recv_async(&server, &mut buf).await;
        assert_eq!(&buf[..received.bytes], b"fd!");
        assert_eq!(received.fds.len(), 1);

        let mut same = std::fs::File::from(received.fds.into_iter().next().unwrap());
        same.rewind().unwrap();
        let mut text = String::new();
        same.read_to_string(&mut text).unwrap();
        assert_eq!(text, "resource");

        drop(client);
        let transferred = relay.await.unwrap().unwrap();
        assert_eq!(transferred.to_destination, 3);
    }

    #[test_log::test(tokio::test)]
    async fn test_forwarded_descriptor_closed_in_relay() {
        let (client, proxy_in) = UnixStream::pair().unwrap();
        let (proxy_out, server) = UnixStream::pair().unwrap();
        let relay = tokio::spawn(async move { relay_unix(proxy_in, proxy_out, &config()).await });

        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let mut read_end = pipe::Receiver::from_owned_fd(read_end).unwrap();
        client.writable().await.unwrap();
        send_with_fds(client.as_fd(), b"w", &[write_end]).unwrap();

        let mut buf = [0u8; 4];
        let received = recv_async(&server, &mut buf).await;
        assert_eq!(received.fds.len(), 1);
        drop(received);

        // EOF only once every copy of the write end, the relay's included, is closed
        let mut rest = Vec::new();
        let n = timeout(Duration::from_secs(5), read_end.read_to_end(&mut rest))
            .await
            .expect("relay still holds the forwarded descriptor")
            .unwrap();
        assert_eq!(n, 0);

        drop(client);
        relay.await.unwrap().unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_plain_messages_flow_both_ways() {
        let (client, proxy_in) = UnixStream::pair().unwrap();
        let (proxy_out, server) = UnixStream::pair().unwrap();
        let relay = tokio::spawn(async move { relay_unix(proxy_in, proxy_out, &config()).await });

        client.writable().await.unwrap();
        send_with_fds(client.as_fd(), b"up", &[]).unwrap();
        let mut buf = [0u8; 8];
        let received = recv_async(&server, &mut buf).await;
        assert_eq!(&buf[..received.bytes], b"up");
        assert!(received.fds.is_empty());

        server.writable().await.unwrap();
        send_with_fds(server.as_fd(), b"down", &[]).unwrap();
        let received = recv_async(&client, &mut buf).await;
        assert_eq!(&buf[..received.bytes], b"down");

        drop(server);
        let transferred = relay.await.unwrap().unwrap();
        assert_eq!(transferred.to_destination, 2);
        assert_eq!(transferred.to_source, 4);
    }

    #[test_log::test(tokio::test)]
    async fn test_too_many_descriptors_fails_flow() {
        let (client, proxy_in) = UnixStream::pair().unwrap();
        let (proxy_out, _server) = UnixStream::pair().unwrap();
        let limited = RelayConfig {
            max_passed_fds: 1,
            ..RelayConfig::default()
        };
        let relay = tokio::spawn(async move { relay_unix(proxy_in, proxy_out, &limited).await });

        let a = OwnedFd::from(tempfile::tempfile().unwrap());
        let b = OwnedFd::from(tempfile::tempfile().unwrap());
        client.writable().await.unwrap();
        send_with_fds(client.as_fd(), b"xx", &[a, b]).unwrap();

        let err = relay.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            RelayError::DescriptorLimit { count: 2, limit: 1 }
        ));
    }
}
