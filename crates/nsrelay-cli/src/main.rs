#![deny(unsafe_code)]

//! nsrelay CLI: set up one namespace-crossing proxy instance.
//!
//! Setup failures are reported on stderr with a non-zero exit status. On
//! success the invoking process and the setup helpers exit 0 and a detached
//! daemon keeps serving until it receives SIGTERM.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};

use nsrelay_config::ProxyConfig;
use nsrelay_core::{Daemon, Established, Invocation, establish, logging};

/// nsrelay: relay connections from one process's namespaces to another's.
#[derive(Parser, Debug)]
#[command(name = "nsrelay", version, about, long_about = None)]
struct Cli {
    /// Optional TOML file with tunables.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Process whose namespaces hold the listening sockets.
    listen_pid: i32,

    /// Listen address, e.g. `tcp:0.0.0.0:80,8000-8001` or `unix:@name`.
    listen_addr: String,

    /// Process whose namespaces the connections are made from.
    connect_pid: i32,

    /// Connect address, same grammar as the listen address.
    connect_addr: String,

    /// Log file for the daemon, truncated on start.
    log_path: PathBuf,

    /// File receiving the daemon's pid.
    pid_path: PathBuf,
}

impl Cli {
    fn invocation(&self) -> Invocation {
        Invocation {
            listen_pid: self.listen_pid,
            listen_spec: self.listen_addr.clone(),
            connect_pid: self.connect_pid,
            connect_spec: self.connect_addr.clone(),
            log_path: self.log_path.clone(),
            pid_path: self.pid_path.clone(),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    logging::init(logging::effective_level(&config.logging.level, cli.verbose));
    if cli.config.is_none() {
        info!("No config file given, using defaults");
    }

    let invocation = cli.invocation();
    debug!(?invocation, "Starting setup");

    match establish(&invocation, &config).context("proxy setup failed")? {
        Established::Exit => Ok(()),
        Established::Daemon(setup) => {
            Daemon::new(setup, config).run()?;
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ProxyConfig> {
    ProxyConfig::load_or_default(path).with_context(|| format!("invalid configuration {path:?}"))
}
