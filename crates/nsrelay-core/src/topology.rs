//! Process topology of one proxy invocation.
//!
//! ```text
//!   invoker ── fork ──► listen side: attach listen pid, bind, send fds, exit 0
//!      │
//!      │ attach connect pid, wait for listen side, receive fds
//!      ▼
//!   fork ──► intermediate ── fork ──► daemon: setsid, stdio to log, serve
//!      │            └── write daemon pid, exit 0
//!      └── wait for intermediate, exit 0
//! ```
//!
//! Everything here runs before the tokio runtime exists, so every process is
//! single-threaded when it forks or switches namespaces.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use nix::libc;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, dup2, fork, geteuid, setsid};
use nsrelay_config::ProxyConfig;
use tracing::{debug, info};

use crate::address::EndpointSpec;
use crate::error::{ProxyError, ProxyResult};
use crate::handoff::{HandoffChannel, HandoffReceiver, HandoffSender};
use crate::listener::acquire_listeners;
use crate::mapping::PortMapping;
use crate::namespace::attach_all;
use crate::retry::retry_interrupted;

/// Positional arguments of one invocation, in contract order.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub listen_pid: i32,
    pub listen_spec: String,
    pub connect_pid: i32,
    pub connect_spec: String,
    pub log_path: PathBuf,
    pub pid_path: PathBuf,
}

/// Which half of the topology a process is. Fixed at the first fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// Binds the listeners inside the listen-side namespaces.
    ListenSide,
    /// Receives the listeners and becomes the daemon.
    ConnectSide,
}

impl ProcessRole {
    /// The process whose namespaces this role joins.
    pub fn target_pid(self, invocation: &Invocation) -> i32 {
        match self {
            ProcessRole::ListenSide => invocation.listen_pid,
            ProcessRole::ConnectSide => invocation.connect_pid,
        }
    }
}

/// What the current process must do once setup returns.
#[derive(Debug)]
pub enum Established {
    /// This process finished its part and should exit successfully.
    Exit,
    /// This process is the detached daemon.
    Daemon(DaemonSetup),
}

/// Everything the daemon needs to start serving.
#[derive(Debug)]
pub struct DaemonSetup {
    pub mapping: PortMapping,
    /// Listener descriptors in listen-address order.
    pub listeners: Vec<OwnedFd>,
}

/// Log and pid files, opened on the host before any namespace switch.
#[derive(Debug)]
struct Artifacts {
    log: File,
    pid: File,
}

impl Artifacts {
    fn open(invocation: &Invocation) -> ProxyResult<Self> {
        // std rejects append combined with truncate, so truncate separately
        let log = OpenOptions::new()
            .append(true)
            .create(true)
            .mode(0o600)
            .open(&invocation.log_path)?;
        log.set_len(0)?;
        let pid = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&invocation.pid_path)?;
        Ok(Self { log, pid })
    }
}

/// Parse both endpoints and validate their pairing. Touches no OS resource.
pub fn plan(invocation: &Invocation) -> ProxyResult<PortMapping> {
    let listen = EndpointSpec::parse(&invocation.listen_spec)?;
    let connect = EndpointSpec::parse(&invocation.connect_spec)?;
    PortMapping::new(listen, connect)
}

fn require_privilege() -> ProxyResult<()> {
    if geteuid().is_root() {
        Ok(())
    } else {
        Err(ProxyError::PermissionDenied(
            "attaching to other namespaces requires root".to_string(),
        ))
    }
}

#[allow(unsafe_code)]
fn fork_process() -> nix::Result<ForkResult> {
    // SAFETY: no runtime and no other threads exist yet, so the child starts
    // from a consistent single-threaded copy of this process.
    unsafe { fork() }
}

/// Run the whole setup sequence.
///
/// Returns in every process the sequence creates; the caller acts on the
/// returned [`Established`].
pub fn establish(invocation: &Invocation, config: &ProxyConfig) -> ProxyResult<Established> {
    require_privilege()?;
    let mapping = plan(invocation)?;
    let artifacts = Artifacts::open(invocation)?;
    let channel = HandoffChannel::new()?;

    let forked = fork_process().map_err(|e| ProxyError::ChildSetupFailed(format!("fork: {e}")))?;
    match forked {
        ForkResult::Child => {
            drop(artifacts);
            listen_side(invocation, &mapping, channel.into_sender(), config)?;
            Ok(Established::Exit)
        }
        ForkResult::Parent { child } => {
            let receiver = channel.into_receiver();
            let listeners = connect_side(invocation, &mapping, receiver, child)?;
            daemonize(artifacts, DaemonSetup { mapping, listeners })
        }
    }
}

fn listen_side(
    invocation: &Invocation,
    mapping: &PortMapping,
    sender: HandoffSender,
    config: &ProxyConfig,
) -> ProxyResult<()> {
    let role = ProcessRole::ListenSide;
    attach_all(role.target_pid(invocation))?;
    let sender = sender.pin_reserved()?;

    // After the mount switch, so unix paths resolve in the target filesystem
    let listeners = acquire_listeners(mapping.listen(), &config.listen)?;
    sender.send_all(&listeners)?;
    info!(?role, count = listeners.len(), "Handed off listeners");
    Ok(())
}

fn connect_side(
    invocation: &Invocation,
    mapping: &PortMapping,
    receiver: HandoffReceiver,
    child: Pid,
) -> ProxyResult<Vec<OwnedFd>> {
    let role = ProcessRole::ConnectSide;
    attach_all(role.target_pid(invocation))?;
    let receiver = receiver.pin_reserved()?;

    let listeners = collect_listeners(receiver, mapping.listen().len(), || wait_success(child))?;
    info!(?role, count = listeners.len(), "Received listeners");
    Ok(listeners)
}

/// Drain the channel, then reap the listen side with `reap`.
///
/// The listen side blocks in `sendmsg` once the socket buffer fills, so it
/// cannot exit before its messages are read. A non-zero exit outranks any
/// receive error, since it is the cause.
fn collect_listeners(
    receiver: HandoffReceiver,
    count: usize,
    reap: impl FnOnce() -> Result<(), String>,
) -> ProxyResult<Vec<OwnedFd>> {
    let received = receiver.recv_all(count);
    // Unblocks a listen side still sending after a failed receive
    drop(receiver);

    match (received, reap()) {
        (_, Err(status)) => Err(ProxyError::ChildSetupFailed(status)),
        (Err(e), Ok(())) => Err(e),
        (Ok(listeners), Ok(())) => Ok(listeners),
    }
}

/// Wait for `child` and require a zero exit status.
fn wait_success(child: Pid) -> Result<(), String> {
    match retry_interrupted(|| waitpid(child, None)) {
        Ok(WaitStatus::Exited(_, 0)) => Ok(()),
        Ok(status) => Err(format!("pid {child} ended with {status:?}")),
        Err(e) => Err(format!("waiting for pid {child}: {e}")),
    }
}

fn daemonize(artifacts: Artifacts, setup: DaemonSetup) -> ProxyResult<Established> {
    let daemonize_err = |step: &str, e: nix::Error| ProxyError::Daemonize(format!("{step}: {e}"));

    if let ForkResult::Parent { child } = fork_process().map_err(|e| daemonize_err("fork", e))? {
        wait_success(child).map_err(ProxyError::Daemonize)?;
        return Ok(Established::Exit);
    }

    if let ForkResult::Parent { child } = fork_process().map_err(|e| daemonize_err("fork", e))? {
        let Artifacts { mut pid, .. } = artifacts;
        if let Err(e) = write!(pid, "{child}").and_then(|()| pid.sync_all()) {
            // Nobody could ever signal an unrecorded daemon
            let _ = kill(child, Signal::SIGKILL);
            return Err(e.into());
        }
        debug!(pid = %child, "Recorded daemon pid");
        return Ok(Established::Exit);
    }

    setsid().map_err(|e| daemonize_err("setsid", e))?;
    let null = File::open("/dev/null")?;
    redirect(null.as_raw_fd(), libc::STDIN_FILENO)
        .and_then(|()| redirect(artifacts.log.as_raw_fd(), libc::STDOUT_FILENO))
        .and_then(|()| redirect(artifacts.log.as_raw_fd(), libc::STDERR_FILENO))
        .map_err(|e| daemonize_err("redirect stdio", e))?;

    Ok(Established::Daemon(setup))
}

fn redirect(from: RawFd, to: RawFd) -> nix::Result<()> {
    retry_interrupted(|| dup2(from, to)).map(drop)
}
