//! Build-time metadata embedded by the build script.
//!
//! Logged once by the daemon at startup so a log file can be matched to the
//! binary that wrote it.

use std::fmt;

/// Identity of the running binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildInfo {
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Short git hash, `unknown` outside a checkout.
    pub git_hash: &'static str,
    /// Cargo profile the binary was built with.
    pub profile: &'static str,
}

impl BuildInfo {
    pub const fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            git_hash: env!("NSRELAY_GIT_HASH"),
            profile: env!("NSRELAY_BUILD_PROFILE"),
        }
    }
}

impl fmt::Display for BuildInfo {
    /// `0.1.0 (abc1234, debug)`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.version, self.git_hash, self.profile)
    }
}
