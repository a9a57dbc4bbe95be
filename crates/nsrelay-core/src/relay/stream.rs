//! Generic bidirectional byte relay.
//!
//! Two copy loops run concurrently, one per direction. The first direction
//! to finish, by EOF or error, closes the flow: the other loop is stopped,
//! both write halves are shut down and both connections are dropped.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

use crate::error::RelayError;
use crate::relay::Transferred;

/// Relay bytes between `source` and `destination` until either side ends.
///
/// Both directions are always awaited before returning. If either direction
/// failed its error is returned and the byte counts are discarded.
pub async fn relay_streams<S, D>(source: S, destination: D) -> Result<Transferred, RelayError>
where
    S: AsyncRead + AsyncWrite,
    D: AsyncRead + AsyncWrite,
{
    let (mut source_rd, mut source_wr) = tokio::io::split(source);
    let (mut dest_rd, mut dest_wr) = tokio::io::split(destination);
    let (closed_tx, closed_rx) = watch::channel(false);

    let (forward, backward) = tokio::join!(
        pipe(&mut source_rd, &mut dest_wr, &closed_tx, closed_rx.clone()),
        pipe(&mut dest_rd, &mut source_wr, &closed_tx, closed_rx),
    );

    Ok(Transferred {
        to_destination: forward?,
        to_source: backward?,
    })
}

async fn pipe<R, W>(
    reader: &mut R,
    writer: &mut W,
    closed_tx: &watch::Sender<bool>,
    mut closed_rx: watch::Receiver<bool>,
) -> Result<u64, RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = 0u64;
    let mut buf = vec![0u8; 16 * 1024];

    let result = tokio::select! {
        res = copy(reader, writer, &mut buf, &mut copied) => res,
        _ = closed_rx.wait_for(|closed| *closed) => Ok(()),
    };
    closed_tx.send_replace(true);
    // The peer may already be gone
    let _ = writer.shutdown().await;

    result.map(|()| copied).map_err(RelayError::from)
}

async fn copy<R, W>(
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
    copied: &mut u64,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let n = match reader.read(buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *copied += n as u64;
    }
}
