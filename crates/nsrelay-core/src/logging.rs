//! Tracing subscriber setup.
//!
//! Everything is written to stderr without ANSI colours. Until the daemon
//! detaches, stderr is the invoking terminal; afterwards it is the log file.

use tracing_subscriber::EnvFilter;

/// Level selected by `-v` flags, falling back to the configured level.
pub fn effective_level(configured: &str, verbose: u8) -> &str {
    match verbose {
        0 => configured,
        1 => "debug",
        _ => "trace",
    }
}

/// `RUST_LOG` if set, otherwise `level`.
pub fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber. Later calls are ignored.
pub fn init(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .try_init();
}
