#![deny(unsafe_code)]

//! Shared test utilities for the nsrelay workspace.
//!
//! Provides echo backends, config builders, and tracing helpers so relay and
//! multiplexer tests run without namespaces or root.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! nsrelay-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod fixtures;
pub mod tracing_setup;

pub use config::{TestConfigBuilder, TestConfigFile};
pub use fixtures::{UnixEcho, spawn_tcp_echo, spawn_udp_echo, spawn_unix_echo};
pub use tracing_setup::init_test_tracing;
