//! Listener registry: descriptors received over the handoff channel,
//! reassembled into typed listeners.

use std::io;
use std::net::{TcpListener, TcpStream, UdpSocket};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::address::{EndpointSpec, Protocol};

/// A reassembled listening socket.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
    /// Bound datagram socket, kept as-is; each readiness event starts one
    /// relay episode on it.
    Udp(UdpSocket),
}

/// A connection accepted from a stream listener.
#[derive(Debug)]
pub enum Accepted {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Listener {
    fn from_fd(protocol: Protocol, fd: OwnedFd) -> io::Result<Self> {
        let listener = match protocol {
            Protocol::Tcp => Listener::Tcp(TcpListener::from(fd)),
            Protocol::Unix => Listener::Unix(UnixListener::from(fd)),
            Protocol::Udp => Listener::Udp(UdpSocket::from(fd)),
        };
        listener.set_nonblocking()?;
        Ok(listener)
    }

    fn set_nonblocking(&self) -> io::Result<()> {
        match self {
            Listener::Tcp(l) => l.set_nonblocking(true),
            Listener::Unix(l) => l.set_nonblocking(true),
            Listener::Udp(s) => s.set_nonblocking(true),
        }
    }

    /// Whether the multiplexer must use one-shot registration.
    pub fn is_datagram(&self) -> bool {
        matches!(self, Listener::Udp(_))
    }

    /// Accept one pending connection.
    ///
    /// Returns `Ok(None)` once no connection is pending and for datagram
    /// sockets, which do not accept.
    pub fn accept(&self) -> io::Result<Option<Accepted>> {
        let accepted = match self {
            Listener::Tcp(l) => l.accept().map(|(s, _)| Accepted::Tcp(s)),
            Listener::Unix(l) => l.accept().map(|(s, _)| Accepted::Unix(s)),
            Listener::Udp(_) => return Ok(None),
        };
        match accepted {
            Ok(conn) => Ok(Some(conn)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Listener::Tcp(l) => l.as_fd(),
            Listener::Unix(l) => l.as_fd(),
            Listener::Udp(s) => s.as_fd(),
        }
    }
}

/// A listener plus the position of its address in the listen spec.
#[derive(Debug)]
pub struct ListenerHandle {
    pub listener: Listener,
    pub index: usize,
}

/// Every listener of one proxy instance, in listen-address order.
#[derive(Debug)]
pub struct ListenerRegistry {
    handles: Vec<ListenerHandle>,
    socket_path: Option<PathBuf>,
}

impl ListenerRegistry {
    /// Reassemble `fds`, which must be in the address order of `listen`.
    pub fn assemble(listen: &EndpointSpec, fds: Vec<OwnedFd>) -> io::Result<Self> {
        let handles = fds
            .into_iter()
            .enumerate()
            .map(|(index, fd)| {
                let listener = Listener::from_fd(listen.protocol, fd)?;
                debug!(index, fd = ?listener.as_fd(), "Reassembled listener");
                Ok(ListenerHandle { listener, index })
            })
            .collect::<io::Result<Vec<_>>>()?;

        info!(protocol = %listen.protocol, count = handles.len(), "Listener registry assembled");
        Ok(Self {
            handles,
            socket_path: listen.unix_path().map(PathBuf::from),
        })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ListenerHandle> {
        self.handles.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ListenerHandle> {
        self.handles.iter()
    }

    /// Close every listener and remove the filesystem unix socket, if any.
    ///
    /// The path resolves in this process's mount namespace, which need not
    /// be the one the socket was bound in. Only a socket is removed, so a
    /// regular file that happens to share the path survives.
    pub fn close(self) {
        let count = self.handles.len();
        drop(self.handles);
        if let Some(path) = self.socket_path {
            remove_socket_path(&path);
        }
        info!(count, "Closed listeners");
    }
}

fn remove_socket_path(path: &Path) {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "Removed unix socket path"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove unix socket path"),
        },
        Ok(_) => warn!(path = %path.display(), "Not a socket, leaving unix socket path in place"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to inspect unix socket path"),
    }
}
