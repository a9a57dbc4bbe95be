//! `SCM_RIGHTS` descriptor passing over unix sockets.
//!
//! Shared by the listener handoff (one descriptor per message, blocking
//! socketpair) and the ancillary relay (arbitrary payloads, non-blocking
//! sockets driven by tokio readiness).

#![allow(unsafe_code)]

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::cmsg_space;
use nix::libc;
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};

use nsrelay_config::SCM_MAX_FD;

/// One message read from a unix socket.
#[derive(Debug)]
pub struct Received {
    /// Number of data bytes placed in the caller's buffer. Zero means EOF.
    pub bytes: usize,
    /// Descriptors carried by `SCM_RIGHTS` control messages, now owned here.
    pub fds: Vec<OwnedFd>,
    /// Control messages other than `SCM_RIGHTS` that were dropped.
    pub ignored_cmsgs: usize,
    /// The kernel cut the control data short.
    pub truncated: bool,
}

/// Read one message and take ownership of any descriptors it carries.
///
/// Received descriptors are marked close-on-exec.
pub fn recv_with_fds(fd: BorrowedFd<'_>, buf: &mut [u8]) -> nix::Result<Received> {
    let mut cmsg_buf = cmsg_space!([RawFd; SCM_MAX_FD]);
    recv_into(fd, buf, &mut cmsg_buf)
}

fn recv_into(fd: BorrowedFd<'_>, buf: &mut [u8], cmsg_buf: &mut Vec<u8>) -> nix::Result<Received> {
    let mut iov = [IoSliceMut::new(buf)];
    let msg = recvmsg::<()>(
        fd.as_raw_fd(),
        &mut iov,
        Some(&mut *cmsg_buf),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )?;

    let bytes = msg.bytes;
    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        // cmsgs() refuses truncated buffers, but the kernel still installed
        // every descriptor that fit
        return Ok(Received {
            bytes,
            fds: adopt_truncated_rights(cmsg_buf),
            ignored_cmsgs: 0,
            truncated: true,
        });
    }

    let mut fds = Vec::new();
    let mut ignored_cmsgs = 0;
    for cmsg in msg.cmsgs()? {
        match cmsg {
            ControlMessageOwned::ScmRights(raw) => {
                // SAFETY: the kernel just installed these descriptors in our
                // table for this message; nothing else refers to them yet.
                fds.extend(raw.into_iter().map(|r| unsafe { OwnedFd::from_raw_fd(r) }));
            }
            _ => ignored_cmsgs += 1,
        }
    }

    Ok(Received {
        bytes,
        fds,
        ignored_cmsgs,
        truncated: false,
    })
}

/// Walk a control buffer the kernel cut short and take every `SCM_RIGHTS`
/// descriptor in it. The buffer starts zeroed, so a zero-length header marks
/// the end of what the kernel wrote.
fn adopt_truncated_rights(cmsg_buf: &[u8]) -> Vec<OwnedFd> {
    const FD_SIZE: usize = size_of::<RawFd>();
    let header = size_of::<libc::cmsghdr>();
    // SAFETY: CMSG_LEN and CMSG_SPACE are pure arithmetic.
    let data_offset = unsafe { libc::CMSG_LEN(0) } as usize;

    let mut fds = Vec::new();
    let mut offset = 0;
    while offset + header <= cmsg_buf.len() {
        // SAFETY: `header` bytes at `offset` are in bounds; the read is
        // unaligned-tolerant.
        let hdr = unsafe {
            std::ptr::read_unaligned(cmsg_buf[offset..].as_ptr().cast::<libc::cmsghdr>())
        };
        let len = hdr.cmsg_len as usize;
        if len < data_offset || offset + len > cmsg_buf.len() {
            break;
        }
        if hdr.cmsg_level == libc::SOL_SOCKET && hdr.cmsg_type == libc::SCM_RIGHTS {
            for chunk in cmsg_buf[offset + data_offset..offset + len].chunks_exact(FD_SIZE) {
                let mut raw = [0u8; FD_SIZE];
                raw.copy_from_slice(chunk);
                // SAFETY: installed by the kernel for this message.
                fds.push(unsafe { OwnedFd::from_raw_fd(RawFd::from_ne_bytes(raw)) });
            }
        }
        offset += unsafe { libc::CMSG_SPACE((len - data_offset) as libc::c_uint) } as usize;
    }
    fds
}

/// Send `data` with `fds` attached as a single `SCM_RIGHTS` message.
///
/// Returns the number of data bytes the kernel accepted. The descriptors stay
/// open in this process; the peer receives duplicates.
pub fn send_with_fds(fd: BorrowedFd<'_>, data: &[u8], fds: &[OwnedFd]) -> nix::Result<usize> {
    let raw: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
    let iov = [IoSlice::new(data)];
    let rights = [ControlMessage::ScmRights(&raw)];
    let cmsgs: &[ControlMessage<'_>] = if raw.is_empty() { &[] } else { &rights };

    sendmsg::<()>(fd.as_raw_fd(), &iov, cmsgs, MsgFlags::MSG_NOSIGNAL, None)
}

/// Duplicate `fd` onto the exact descriptor number `target`, close-on-exec.
///
/// Any descriptor already at `target` is closed first by the kernel.
pub fn dup_to(fd: BorrowedFd<'_>, target: RawFd) -> nix::Result<OwnedFd> {
    let raw = nix::unistd::dup3(fd.as_raw_fd(), target, nix::fcntl::OFlag::O_CLOEXEC)?;
    // SAFETY: dup3 returned a fresh descriptor that only we hold.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}
