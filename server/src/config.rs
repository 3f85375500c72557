//! Server configuration.
//!
//! Loaded from a TOML file; every section has working defaults so an
//! empty file (or no file) is a valid configuration.

use serde::Deserialize;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub workers: WorkersConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&raw).map_err(ConfigError::Parse)
    }
}

/// Listener and connection lifecycle settings.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address the listener binds to.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// TCP listen backlog.
    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// Idle deadline per connection, reset on every read or write
    /// readiness. Expiry closes the connection.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Upper bound on how long one loop cycle may block waiting for
    /// readiness.
    #[serde(default = "default_cycle_interval_ms")]
    pub cycle_interval_ms: u64,

    /// Whether accepted connections start in keep-alive mode. Handlers
    /// may override per connection.
    #[serde(default)]
    pub keep_alive: bool,

    /// Set TCP_NODELAY on accepted connections.
    #[serde(default = "default_true")]
    pub nodelay: bool,

    /// Set SO_KEEPALIVE on accepted connections.
    #[serde(default)]
    pub tcp_keepalive: bool,
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: default_listen(),
            backlog: default_backlog(),
            idle_timeout_ms: default_idle_timeout_ms(),
            cycle_interval_ms: default_cycle_interval_ms(),
            keep_alive: false,
            nodelay: true,
            tcp_keepalive: false,
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkersConfig {
    /// Number of worker threads. 0 = number of CPUs.
    #[serde(default)]
    pub threads: usize,
}

/// Logging settings. The RUST_LOG environment variable takes precedence
/// over `level`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Include the module path in log lines.
    #[serde(default = "default_true")]
    pub target: bool,

    /// Include thread names in log lines.
    #[serde(default)]
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: LogFormat::default(),
            target: true,
            thread_names: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "failed to read config: {e}"),
            ConfigError::Parse(e) => write!(f, "failed to parse config: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 7700))
}

fn default_backlog() -> u32 {
    1024
}

fn default_idle_timeout_ms() -> u64 {
    5_000
}

fn default_cycle_interval_ms() -> u64 {
    1_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.backlog, 1024);
        assert_eq!(config.server.idle_timeout(), Duration::from_secs(5));
        assert!(!config.server.keep_alive);
        assert!(config.server.nodelay);
        assert_eq!(config.workers.threads, 0);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn parses_full_config() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:9000"
            backlog = 256
            idle_timeout_ms = 30000
            cycle_interval_ms = 100
            keep_alive = true
            nodelay = false
            tcp_keepalive = true

            [workers]
            threads = 4

            [logging]
            level = "debug"
            format = "json"
            thread_names = true
            "#,
        )
        .unwrap();

        assert_eq!(config.server.listen.port(), 9000);
        assert_eq!(config.server.backlog, 256);
        assert!(config.server.keep_alive);
        assert!(!config.server.nodelay);
        assert_eq!(config.workers.threads, 4);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn rejects_unknown_fields() {
        let result: Result<Config, _> = toml::from_str(
            r#"
            [server]
            listne = "0.0.0.0:9000"
            "#,
        );
        assert!(result.is_err());
    }
}
