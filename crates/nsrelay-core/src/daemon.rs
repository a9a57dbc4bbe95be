//! Steady-state daemon: tokio runtime, SIGTERM handling and the multiplexer.

use std::io;
use std::os::fd::OwnedFd;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::getpgrp;
use nsrelay_config::ProxyConfig;
use tokio::runtime::Handle;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};

use crate::build_info::BuildInfo;
use crate::error::{ProxyError, ProxyResult};
use crate::mapping::PortMapping;
use crate::multiplexer::Multiplexer;
use crate::registry::ListenerRegistry;
use crate::topology::DaemonSetup;

/// The detached, long-running relay process.
pub struct Daemon {
    mapping: PortMapping,
    listeners: Vec<OwnedFd>,
    config: ProxyConfig,
}

impl Daemon {
    pub fn new(setup: DaemonSetup, config: ProxyConfig) -> Self {
        Self {
            mapping: setup.mapping,
            listeners: setup.listeners,
            config,
        }
    }

    /// Serve until SIGTERM, then close every listener and kill our own
    /// process group. Only returns if killing the process group fails.
    pub fn run(self) -> ProxyResult<()> {
        let build = BuildInfo::current();
        info!(
            version = build.version,
            git = build.git_hash,
            profile = build.profile,
            pid = std::process::id(),
            listen = %self.mapping.listen(),
            connect = %self.mapping.connect(),
            "nsrelay daemon starting"
        );

        let result = self.serve();
        if let Err(e) = &result {
            error!(error = %e, "Daemon stopped with error");
        }
        terminate_process_group();
        result
    }

    fn serve(self) -> ProxyResult<()> {
        // Built here rather than in main: the process must stay single-threaded
        // until every fork is done.
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;

        let registry = ListenerRegistry::assemble(self.mapping.listen(), self.listeners)?;
        let multiplexer = Multiplexer::new(registry, self.mapping, self.config.relay)?;
        let spawner = runtime.handle().clone();
        runtime.block_on(supervise(multiplexer, spawner))
    }
}

/// Run the multiplexer on a blocking thread and stop it on SIGTERM.
async fn supervise(multiplexer: Multiplexer, spawner: Handle) -> ProxyResult<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    let handle = multiplexer.handle();
    let mut event_loop = tokio::task::spawn_blocking(move || multiplexer.run(spawner));

    let joined = tokio::select! {
        joined = &mut event_loop => joined,
        _ = terminate.recv() => {
            info!("SIGTERM received, shutting down");
            handle.shutdown();
            event_loop.await
        }
    };
    joined.map_err(|e| ProxyError::Io(io::Error::other(e)))?
}

/// SIGKILL every process in our process group, ourselves included.
pub fn terminate_process_group() {
    let group = getpgrp();
    info!(pgid = %group, "Terminating process group");
    if let Err(e) = killpg(group, Signal::SIGKILL) {
        error!(pgid = %group, error = %e, "Failed to kill process group");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::{UnixListener, UnixStream as StdUnixStream};
    use std::time::Duration;

    use nix::sys::signal::raise;
    use nsrelay_test_utils::{TestConfigBuilder, spawn_unix_echo};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    use crate::address::EndpointSpec;

    const WAIT: Duration = Duration::from_secs(5);

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn test_sigterm_closes_listeners() {
        let backend = spawn_unix_echo().await;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("front.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let listen = EndpointSpec::parse(&format!("unix:{}", path.display())).unwrap();
        let connect = EndpointSpec::parse(&format!("unix:{}", backend.path.display())).unwrap();
        let registry = ListenerRegistry::assemble(&listen, vec![OwnedFd::from(listener)]).unwrap();
        let mapping = PortMapping::new(listen, connect).unwrap();
        let config = TestConfigBuilder::new().build();
        let multiplexer = Multiplexer::new(registry, mapping, config.relay).unwrap();
        let supervisor = tokio::spawn(supervise(multiplexer, Handle::current()));

        // The loop only starts after the SIGTERM stream exists, so a relayed
        // round trip means raising the signal is safe
        let mut client = tokio::net::UnixStream::connect(&path).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        timeout(WAIT, client.read_exact(&mut buf))
            .await
            .expect("echo timed out")
            .unwrap();
        assert_eq!(&buf, b"ping");

        raise(Signal::SIGTERM).unwrap();
        timeout(WAIT, supervisor)
            .await
            .expect("SIGTERM did not stop the daemon")
            .unwrap()
            .unwrap();

        assert!(!path.exists());
        assert!(StdUnixStream::connect(&path).is_err());
    }
}
