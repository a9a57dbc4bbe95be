//! Listener handoff between the listen-side and connect-side processes.
//!
//! The channel is an anonymous unix socketpair created before the processes
//! diverge, so it survives every later namespace switch. Each process keeps
//! one end: the listen side becomes a [`HandoffSender`], the connect side a
//! [`HandoffReceiver`]. Descriptors travel one per message, in listen-address
//! order; the transfer is all-or-nothing.

use std::os::fd::{AsFd, OwnedFd, RawFd};

use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use tracing::debug;

use crate::error::{ProxyError, ProxyResult};
use crate::fdpass::{dup_to, recv_with_fds, send_with_fds};
use crate::retry::retry_interrupted;

/// Descriptor number each process pins its channel end to after attaching
/// to its namespaces.
const RESERVED_CHANNEL_FD: RawFd = 200;

/// Both ends of a freshly created handoff channel.
#[derive(Debug)]
pub struct HandoffChannel {
    listen_end: OwnedFd,
    connect_end: OwnedFd,
}

impl HandoffChannel {
    /// Create the socketpair. Must happen before forking.
    pub fn new() -> ProxyResult<Self> {
        let (listen_end, connect_end) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|e| ProxyError::Io(e.into()))?;
        debug!(?listen_end, ?connect_end, "Created handoff socket pair");
        Ok(Self {
            listen_end,
            connect_end,
        })
    }

    /// Both ends in one process, for exercising the transfer without forking.
    #[cfg(test)]
    pub(crate) fn split(self) -> (HandoffSender, HandoffReceiver) {
        (
            HandoffSender {
                fd: self.listen_end,
            },
            HandoffReceiver {
                fd: self.connect_end,
            },
        )
    }

    /// Keep the listen end; the connect end is closed.
    pub fn into_sender(self) -> HandoffSender {
        HandoffSender {
            fd: self.listen_end,
        }
    }

    /// Keep the connect end; the listen end is closed.
    pub fn into_receiver(self) -> HandoffReceiver {
        HandoffReceiver {
            fd: self.connect_end,
        }
    }
}

fn pin(fd: OwnedFd) -> ProxyResult<OwnedFd> {
    let pinned = dup_to(fd.as_fd(), RESERVED_CHANNEL_FD).map_err(|e| ProxyError::Io(e.into()))?;
    debug!(from = ?fd, to = RESERVED_CHANNEL_FD, "Pinned handoff channel");
    Ok(pinned)
}

/// Listen-side end of the channel.
#[derive(Debug)]
pub struct HandoffSender {
    fd: OwnedFd,
}

impl HandoffSender {
    /// Move the channel onto the reserved descriptor number.
    pub fn pin_reserved(self) -> ProxyResult<Self> {
        Ok(Self { fd: pin(self.fd)? })
    }

    /// Send every listener in order. Stops at the first failure.
    pub fn send_all(&self, listeners: &[OwnedFd]) -> ProxyResult<()> {
        for (index, listener) in listeners.iter().enumerate() {
            let sent = retry_interrupted(|| {
                send_with_fds(self.fd.as_fd(), &[0], std::slice::from_ref(listener))
            })
            .map_err(|e| ProxyError::handoff(index, e))?;
            if sent != 1 {
                return Err(ProxyError::handoff(index, "short write"));
            }
            debug!(index, fd = ?listener, "Sent listener descriptor");
        }
        Ok(())
    }
}

/// Connect-side end of the channel.
#[derive(Debug)]
pub struct HandoffReceiver {
    fd: OwnedFd,
}

impl HandoffReceiver {
    /// Move the channel onto the reserved descriptor number.
    pub fn pin_reserved(self) -> ProxyResult<Self> {
        Ok(Self { fd: pin(self.fd)? })
    }

    /// Receive exactly `count` listener descriptors, in sending order.
    ///
    /// On any failure every descriptor received so far is closed.
    pub fn recv_all(&self, count: usize) -> ProxyResult<Vec<OwnedFd>> {
        let mut listeners = Vec::with_capacity(count);
        for index in 0..count {
            let mut marker = [0u8; 1];
            let received = retry_interrupted(|| recv_with_fds(self.fd.as_fd(), &mut marker))
                .map_err(|e| ProxyError::handoff(index, e))?;

            if received.bytes == 0 {
                return Err(ProxyError::handoff(index, "listen side closed the channel"));
            }
            if received.truncated {
                return Err(ProxyError::handoff(index, "control data truncated"));
            }
            let mut fds = received.fds.into_iter();
            let (Some(fd), None) = (fds.next(), fds.next()) else {
                return Err(ProxyError::handoff(
                    index,
                    "expected exactly one descriptor per message",
                ));
            };
            debug!(index, ?fd, "Received listener descriptor");
            listeners.push(fd);
        }
        Ok(listeners)
    }
}
