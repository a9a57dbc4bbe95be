//! Configuration builders for tests.

use std::path::PathBuf;

use nsrelay_config::ProxyConfig;
use tempfile::TempDir;

/// Fluent builder for [`ProxyConfig`] in tests.
///
/// Defaults to fast bind retries so failure paths do not sleep for seconds.
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .udp_reply_window_ms(100)
///     .max_passed_fds(4)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: ProxyConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let mut config = ProxyConfig::default();
        config.listen.bind_attempts = 2;
        config.listen.retry_backoff_ms = 1;
        Self { config }
    }

    pub fn bind_attempts(mut self, attempts: u32) -> Self {
        self.config.listen.bind_attempts = attempts;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.listen.retry_backoff_ms = ms;
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.relay.buffer_size = size;
        self
    }

    pub fn max_passed_fds(mut self, n: usize) -> Self {
        self.config.relay.max_passed_fds = n;
        self
    }

    pub fn udp_reply_window_ms(mut self, ms: u64) -> Self {
        self.config.relay.udp_reply_window_ms = ms;
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.config.relay.max_events = n;
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn build(self) -> ProxyConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A TOML config written into a temp directory that lives as long as this
/// value.
pub struct TestConfigFile {
    pub path: PathBuf,
    _dir: TempDir,
}

impl TestConfigFile {
    pub fn with_toml(content: &str) -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("nsrelay.toml");
        std::fs::write(&path, content).expect("failed to write test config");
        Self { path, _dir: dir }
    }
}
