//! Namespace attachment for a target process.
//!
//! | Kind | `/proc/<pid>/ns/` entry | Effect on this process               |
//! |------|-------------------------|--------------------------------------|
//! | User | `user`                  | Credentials and capabilities         |
//! | Net  | `net`                   | Interfaces, routes, socket addresses |
//! | Mnt  | `mnt`                   | Filesystem view, unix socket paths   |
//!
//! The calling process must be single-threaded: the kernel refuses to move a
//! multi-threaded process into another user or mount namespace.

use std::fmt;
use std::fs::File;
use std::os::unix::fs::MetadataExt;

use nix::sched::{CloneFlags, setns};
use nix::unistd::{Gid, Uid, setgid, setgroups, setuid};
use tracing::{debug, info};

use crate::error::{ProxyError, ProxyResult};

/// A namespace kind this proxy can join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceKind {
    User,
    Net,
    Mnt,
}

impl NamespaceKind {
    /// Entry name under `/proc/<pid>/ns/`.
    pub fn proc_name(self) -> &'static str {
        match self {
            NamespaceKind::User => "user",
            NamespaceKind::Net => "net",
            NamespaceKind::Mnt => "mnt",
        }
    }

    fn clone_flag(self) -> CloneFlags {
        match self {
            NamespaceKind::User => CloneFlags::CLONE_NEWUSER,
            NamespaceKind::Net => CloneFlags::CLONE_NEWNET,
            NamespaceKind::Mnt => CloneFlags::CLONE_NEWNS,
        }
    }
}

impl fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.proc_name())
    }
}

fn ns_path(pid: i32, kind: NamespaceKind) -> String {
    format!("/proc/{pid}/ns/{}", kind.proc_name())
}

fn attach_error(pid: i32, kind: NamespaceKind, source: nix::Error) -> ProxyError {
    ProxyError::NamespaceAttach {
        pid,
        kind: kind.proc_name(),
        source,
    }
}

fn open_ns(pid: i32, kind: NamespaceKind) -> ProxyResult<File> {
    File::open(ns_path(pid, kind)).map_err(|e| {
        let errno = e
            .raw_os_error()
            .map_or(nix::Error::UnknownErrno, nix::Error::from_raw);
        attach_error(pid, kind, errno)
    })
}

/// Whether `pid` already lives in our namespace of the given kind.
pub fn shares_namespace(pid: i32, kind: NamespaceKind) -> ProxyResult<bool> {
    let theirs = open_ns(pid, kind)?.metadata()?;
    let ours = std::fs::metadata(format!("/proc/self/ns/{}", kind.proc_name()))?;
    Ok(theirs.ino() == ours.ino() && theirs.dev() == ours.dev())
}

/// Join the `kind` namespace of `pid`.
pub fn attach_namespace(pid: i32, kind: NamespaceKind) -> ProxyResult<()> {
    let ns = open_ns(pid, kind)?;
    setns(&ns, kind.clone_flag()).map_err(|e| attach_error(pid, kind, e))?;
    debug!(pid, %kind, "Attached to namespace");
    Ok(())
}

/// Join the user namespace of `pid` and become root inside it.
///
/// A no-op when `pid` already shares our user namespace.
pub fn attach_user_namespace(pid: i32) -> ProxyResult<()> {
    if shares_namespace(pid, NamespaceKind::User)? {
        debug!(pid, "Target shares our user namespace");
        return Ok(());
    }

    attach_namespace(pid, NamespaceKind::User)?;
    let as_root = |e| attach_error(pid, NamespaceKind::User, e);
    setgid(Gid::from_raw(0)).map_err(as_root)?;
    setuid(Uid::from_raw(0)).map_err(as_root)?;
    if let Err(e) = setgroups(&[]) {
        // Denied when the namespace has setgroups disabled
        debug!(pid, error = %e, "Could not drop supplementary groups");
    }
    Ok(())
}

/// Join the user, network and mount namespaces of `pid`, in that order.
///
/// Network comes before mount so that sockets created afterwards bind in the
/// target's network stack while paths resolve in its filesystem.
pub fn attach_all(pid: i32) -> ProxyResult<()> {
    attach_user_namespace(pid)?;
    attach_namespace(pid, NamespaceKind::Net)?;
    attach_namespace(pid, NamespaceKind::Mnt)?;
    info!(pid, "Attached to target namespaces");
    Ok(())
}
