//! Configuration for the echo server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::error::{Error, Result};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// Which I/O engine drives the endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// io_uring completion port (Linux only)
    Completion,
    /// mio readiness loop (epoll on Linux, kqueue on macOS)
    Readiness,
}

/// Command-line arguments for the echo server
#[derive(Parser, Debug, Default)]
#[command(name = "endpoint-io")]
#[command(version)]
#[command(about = "Pooled socket endpoints serving a TCP echo", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// I/O engine
    #[arg(short, long, value_enum)]
    pub backend: Option<Backend>,

    /// Number of completion worker threads (defaults to number of CPU cores)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Connection objects created up front
    #[arg(long)]
    pub pool_size: Option<usize>,

    /// Per-connection read and write buffer size in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// io_uring submission queue entries
    #[arg(long)]
    pub ring_size: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backend")]
    pub backend: Backend,
    pub workers: Option<usize>,
    #[serde(default = "default_ring_size")]
    pub ring_size: u32,
    /// Readiness events drained per poll
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backend: default_backend(),
            workers: None,
            ring_size: default_ring_size(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Connection pool configuration
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_size")]
    pub size: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            buffer_size: default_buffer_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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

fn default_host() -> String {
    "::1".to_string()
}

fn default_port() -> u16 {
    7777
}

fn default_backend() -> Backend {
    Backend::Readiness
}

fn default_ring_size() -> u32 {
    256
}

fn default_event_capacity() -> usize {
    1024
}

fn default_pool_size() -> usize {
    16
}

fn default_buffer_size() -> usize {
    crate::runtime::DEFAULT_BUFFER_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backend: Backend,
    pub workers: Option<usize>,
    pub pool_size: usize,
    pub buffer_size: usize,
    pub ring_size: u32,
    pub event_capacity: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve parsed CLI args against the config file they name, if any.
    pub fn from_args(cli: CliArgs) -> std::result::Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Reject values no engine can run with.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        // A zero-length receive completes as if the peer had closed.
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size", "must be at least 1".into()));
        }
        if self.ring_size == 0 {
            return Err(ConfigError::Invalid("ring_size", "must be at least 1".into()));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity", "must be at least 1".into()));
        }
        Ok(())
    }

    /// Merge CLI args with TOML config (CLI takes precedence).
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            backend: cli.backend.unwrap_or(toml_config.server.backend),
            workers: cli.workers.or(toml_config.server.workers),
            pool_size: cli.pool_size.unwrap_or(toml_config.pool.size),
            buffer_size: cli.buffer_size.unwrap_or(toml_config.pool.buffer_size),
            ring_size: cli.ring_size.unwrap_or(toml_config.server.ring_size),
            event_capacity: toml_config.server.event_capacity,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// Socket address to listen on.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|e| Error::Config(format!("invalid host '{}': {}", self.host, e)))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Completion worker threads to run: configured value or one per core.
    pub fn worker_count(&self) -> usize {
        match self.workers {
            Some(n) if n > 0 => n,
            _ => num_cpus(),
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {1}", path = .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{path}': {1}", path = .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid {0}: {1}")]
    Invalid(&'static str, String),
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.host, "::1");
        assert_eq!(config.port, 7777);
        assert_eq!(config.backend, Backend::Readiness);
        assert_eq!(config.pool_size, 16);
        assert_eq!(config.buffer_size, 1024);
        assert_eq!(config.ring_size, 256);
        assert_eq!(config.log_level, "info");
        assert!(config.worker_count() >= 1);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 9000
            backend = "completion"
            workers = 4
            ring_size = 512

            [pool]
            size = 8
            buffer_size = 4096

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.backend, Backend::Completion);
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.server.ring_size, 512);
        assert_eq!(config.pool.size, 8);
        assert_eq!(config.pool.buffer_size, 4096);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 9000
            [pool]
            size = 8
        "#,
        )
        .unwrap();

        let cli = CliArgs::parse_from(["endpoint-io", "--port", "9100", "--backend", "completion"]);
        let config = Config::merge(cli, file);

        assert_eq!(config.port, 9100);
        assert_eq!(config.backend, Backend::Completion);
        // Untouched values fall through to the file
        assert_eq!(config.pool_size, 8);
        assert_eq!(config.host, "::1");
    }

    #[test]
    fn test_listen_addr() {
        let mut config = Config::default();
        assert_eq!(config.listen_addr().unwrap(), "[::1]:7777".parse().unwrap());

        config.host = "not an address".to_string();
        assert!(matches!(config.listen_addr(), Err(Error::Config(_))));
    }

    #[test]
    fn test_worker_count_zero_means_auto() {
        let config = Config {
            workers: Some(0),
            ..Config::default()
        };
        assert_eq!(config.worker_count(), num_cpus());

        let config = Config {
            workers: Some(3),
            ..Config::default()
        };
        assert_eq!(config.worker_count(), 3);
    }

    #[test]
    fn test_missing_config_file() {
        let cli = CliArgs {
            config: Some(PathBuf::from("/nonexistent/endpoint-io.toml")),
            ..CliArgs::default()
        };
        let err = Config::from_args(cli).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead(..)));
        assert!(err.to_string().contains("/nonexistent/endpoint-io.toml"));
    }

    #[test]
    fn test_config_error_messages() {
        let err = ConfigError::FileRead(
            PathBuf::from("/etc/endpoint-io.toml"),
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        let msg = err.to_string();
        assert!(msg.starts_with("Failed to read config file '/etc/endpoint-io.toml': "));
        assert!(std::error::Error::source(&err).is_some());

        let parse_err = toml::from_str::<TomlConfig>("[server\n").unwrap_err();
        let err = ConfigError::TomlParse(PathBuf::from("bad.toml"), parse_err);
        assert!(err
            .to_string()
            .starts_with("Failed to parse config file 'bad.toml': "));
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        assert!(Config::default().validate().is_ok());

        let config = Config {
            buffer_size: 0,
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("buffer_size", _)));
        assert!(matches!(Error::from(err), Error::Config(_)));

        let config = Config {
            ring_size: 0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid("ring_size", _))
        ));

        let cli = CliArgs::parse_from(["endpoint-io", "--buffer-size", "0"]);
        assert!(matches!(
            Config::from_args(cli),
            Err(ConfigError::Invalid("buffer_size", _))
        ));
    }
}
