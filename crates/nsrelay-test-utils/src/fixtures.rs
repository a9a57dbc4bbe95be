//! Echo backends standing in for the connect-side service.
//!
//! Each fixture serves until the test's runtime shuts down.

use std::net::SocketAddr;
use std::path::PathBuf;

use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket, UnixListener};

async fn echo<S>(mut stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if stream.write_all(&buf[..n]).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Start a TCP echo server on an ephemeral loopback port.
pub async fn spawn_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind tcp echo");
    let addr = listener.local_addr().expect("tcp echo has no address");
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(echo(stream));
        }
    });
    addr
}

/// Start a UDP echo server on an ephemeral loopback port.
pub async fn spawn_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("failed to bind udp echo");
    let addr = socket.local_addr().expect("udp echo has no address");
    tokio::spawn(async move {
        let mut buf = [0u8; 65_535];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}

/// A unix echo server and the temp directory holding its socket.
pub struct UnixEcho {
    pub path: PathBuf,
    _dir: TempDir,
}

/// Start a unix stream echo server on a fresh filesystem path.
pub async fn spawn_unix_echo() -> UnixEcho {
    let dir = TempDir::new().expect("failed to create temp dir");
    let path = dir.path().join("echo.sock");
    let listener = UnixListener::bind(&path).expect("failed to bind unix echo");
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(echo(stream));
        }
    });
    UnixEcho { path, _dir: dir }
}
