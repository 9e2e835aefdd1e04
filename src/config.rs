//! flockrs Configuration
//!
//! Programmatic options for constructing a [`crate::flock::Flock`]
//! (`FlockOptions`), and the TOML-file configuration consumed by the
//! `flockctl` demo binary (`FlockctlConfig`).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Which transport tier to use for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Probe capabilities in order: UDP broadcast, then shared-file, then
    /// loopback-only. This is what every real deployment should use.
    #[default]
    Auto,
    /// Force the UDP broadcast tier; fail to construct if unavailable.
    UdpBroadcast,
    /// Force the shared-file tier; fail to construct if unavailable.
    SharedFile,
    /// Force the in-process loopback-only tier. Always succeeds.
    Loopback,
}

/// Construction options for a [`crate::flock::Flock`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlockOptions {
    /// Multiton key; isolates flocks from one another.
    #[serde(default = "default_channel_name")]
    pub channel_name: String,

    /// Leader heartbeat period, in milliseconds.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Follower timeout before calling an election, in milliseconds.
    /// Must be greater than `heartbeat_interval_ms`.
    #[serde(default = "default_heartbeat_ttl_ms")]
    pub heartbeat_ttl_ms: u64,

    /// Enables diagnostic (trace-level) envelope logging.
    #[serde(default)]
    pub debug: bool,

    /// Which transport tier to use.
    #[serde(default)]
    pub transport: TransportKind,

    /// Shared directory for the `SharedFile` transport tier. Defaults to
    /// a `flockrs` subdirectory of the OS temp directory.
    #[serde(default)]
    pub shared_dir: Option<PathBuf>,
}

impl Default for FlockOptions {
    fn default() -> Self {
        Self {
            channel_name: default_channel_name(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_ttl_ms: default_heartbeat_ttl_ms(),
            debug: false,
            transport: TransportKind::default(),
            shared_dir: None,
        }
    }
}

fn default_channel_name() -> String {
    "flock_channel_v1".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    2000
}

fn default_heartbeat_ttl_ms() -> u64 {
    5000
}

impl FlockOptions {
    /// Validate cross-field invariants: the heartbeat TTL must exceed the
    /// heartbeat interval, or followers would call elections against a
    /// live leader.
    pub fn validate(&self) -> crate::Result<()> {
        if self.channel_name.is_empty() {
            return Err(crate::Error::Config("channel_name cannot be empty".into()));
        }
        if self.heartbeat_ttl_ms <= self.heartbeat_interval_ms {
            return Err(crate::Error::Config(format!(
                "heartbeat_ttl_ms ({}) must be greater than heartbeat_interval_ms ({})",
                self.heartbeat_ttl_ms, self.heartbeat_interval_ms
            )));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ttl_ms)
    }

    /// Default per-request timeout: `heartbeat_ttl + 500ms`.
    pub fn default_request_timeout(&self) -> Duration {
        self.heartbeat_ttl() + Duration::from_millis(500)
    }
}

/// Logging configuration for the `flockctl` demo binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json).
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// TOML-file configuration for the `flockctl` demo binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlockctlConfig {
    /// Display name for this node (defaults to a generated member ID if unset).
    #[serde(default)]
    pub name: Option<String>,

    /// Flock construction options.
    pub flock: FlockOptions,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl FlockctlConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FlockctlConfig = toml::from_str(&content)?;
        config.flock.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: FlockctlConfig = toml::from_str(content)?;
        config.flock.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let opts = FlockOptions::default();
        assert!(opts.validate().is_ok());
        assert_eq!(opts.channel_name, "flock_channel_v1");
    }

    #[test]
    fn rejects_ttl_not_greater_than_interval() {
        let mut opts = FlockOptions::default();
        opts.heartbeat_ttl_ms = opts.heartbeat_interval_ms;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn parses_toml() {
        let toml = r#"
name = "node-a"

[flock]
channel_name = "test-channel"
heartbeat_interval_ms = 100
heartbeat_ttl_ms = 300
"#;
        let config = FlockctlConfig::from_str(toml).unwrap();
        assert_eq!(config.name.as_deref(), Some("node-a"));
        assert_eq!(config.flock.channel_name, "test-channel");
        assert_eq!(config.flock.heartbeat_ttl_ms, 300);
    }
}
