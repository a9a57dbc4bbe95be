#![deny(unsafe_code)]

//! Tunables for the nsrelay proxy.
//!
//! The positional invocation describes *what* to proxy; this crate covers
//! *how*: bind retry policy, relay buffer sizing, datagram reply window and
//! log verbosity. Every field has a default, so an absent or empty file is a
//! valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Largest number of descriptors the kernel accepts in one `SCM_RIGHTS`
/// message (`SCM_MAX_FD`).
pub const SCM_MAX_FD: usize = 253;

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level proxy configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Listener acquisition policy.
    #[serde(default)]
    pub listen: ListenConfig,

    /// Relay engine and multiplexer tunables.
    #[serde(default)]
    pub relay: RelayConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How hard to try when binding a listen address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Number of bind attempts before giving up.
    #[serde(default = "default_bind_attempts")]
    pub bind_attempts: u32,

    /// Fixed pause between two bind attempts, in milliseconds.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl ListenConfig {
    /// The pause between bind attempts as a [`Duration`].
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind_attempts: default_bind_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_bind_attempts() -> u32 {
    10
}

fn default_retry_backoff_ms() -> u64 {
    500
}

/// Relay engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Data buffer size used per direction by the ancillary relay.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// How many descriptors one relayed message may carry.
    #[serde(default = "default_max_passed_fds")]
    pub max_passed_fds: usize,

    /// How long a datagram episode waits for upstream replies, in milliseconds.
    #[serde(default = "default_udp_reply_window_ms")]
    pub udp_reply_window_ms: u64,

    /// Readiness events fetched per multiplexer wakeup.
    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

impl RelayConfig {
    /// The datagram reply window as a [`Duration`].
    pub fn udp_reply_window(&self) -> Duration {
        Duration::from_millis(self.udp_reply_window_ms)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            max_passed_fds: default_max_passed_fds(),
            udp_reply_window_ms: default_udp_reply_window_ms(),
            max_events: default_max_events(),
        }
    }
}

fn default_buffer_size() -> usize {
    4096
}

fn default_max_passed_fds() -> usize {
    SCM_MAX_FD
}

fn default_udp_reply_window_ms() -> u64 {
    1000
}

fn default_max_events() -> usize {
    10
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ProxyConfig {
    /// Load configuration from a TOML file at the given path.
    ///
    /// Blocking on purpose: configuration is read before the process forks,
    /// when no async runtime may exist yet.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content)?;
        tracing::debug!(path = %path.display(), "Loaded proxy configuration");
        Ok(config)
    }

    /// Load from `path` when it is given, otherwise use defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: ProxyConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.bind_attempts == 0 {
            return Err(ConfigError::Validation(
                "listen.bind_attempts must be at least 1".to_string(),
            ));
        }
        if self.relay.buffer_size == 0 {
            return Err(ConfigError::Validation(
                "relay.buffer_size must be non-zero".to_string(),
            ));
        }
        if self.relay.max_passed_fds == 0 || self.relay.max_passed_fds > SCM_MAX_FD {
            return Err(ConfigError::Validation(format!(
                "relay.max_passed_fds must be in 1..={SCM_MAX_FD}, got {}",
                self.relay.max_passed_fds
            )));
        }
        if self.relay.max_events == 0 {
            return Err(ConfigError::Validation(
                "relay.max_events must be at least 1".to_string(),
            ));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.level must be one of {:?}, got {:?}",
                valid_levels, self.logging.level
            )));
        }

        Ok(())
    }
}
