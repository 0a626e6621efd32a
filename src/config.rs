//! Configuration for the shardline server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Message handler run by the `shardline` binary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    /// Write every message straight back
    #[default]
    Echo,
    /// Line-based PING/PONG
    Ping,
    /// Read and drop everything
    Discard,
}

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "shardline")]
#[command(author = "shardline authors")]
#[command(version = "0.1.0")]
#[command(about = "A sharded multi-threaded TCP server engine", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<IpAddr>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of worker shards (defaults to number of CPU cores)
    #[arg(short = 's', long)]
    pub shards: Option<usize>,

    /// Message handler to run
    #[arg(long, value_enum)]
    pub protocol: Option<ProtocolType>,

    /// Upper bound on one readiness wait of the read loop, in milliseconds
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Largest number of bytes delivered as one message
    #[arg(long)]
    pub max_message_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Listener and handler selection
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub protocol: ProtocolType,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            protocol: ProtocolType::default(),
        }
    }
}

/// Engine tuning
#[derive(Debug, Deserialize)]
pub struct EngineSection {
    /// Number of worker shards
    pub shards: Option<usize>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_worker_wait_ms")]
    pub worker_wait_ms: u64,
    #[serde(default = "default_writer_wait_ms")]
    pub writer_wait_ms: u64,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            shards: None,
            poll_interval_ms: default_poll_interval_ms(),
            worker_wait_ms: default_worker_wait_ms(),
            writer_wait_ms: default_writer_wait_ms(),
            backlog: default_backlog(),
            max_message_size: default_max_message_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_worker_wait_ms() -> u64 {
    10
}

fn default_writer_wait_ms() -> u64 {
    5
}

fn default_backlog() -> i32 {
    1024
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_shards() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Settings fixed for the lifetime of one [`Server`](crate::runtime::Server).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub host: IpAddr,
    pub port: u16,
    /// Number of worker shards, at least one.
    pub shards: usize,
    pub backlog: i32,
    /// Upper bound on a single readiness wait of the read loop.
    pub poll_interval: Duration,
    /// Upper bound on an idle worker's wait before re-checking shutdown.
    pub worker_wait: Duration,
    /// Upper bound on an idle writer's wait before re-checking closing.
    pub writer_wait: Duration,
    /// Largest single read handed to the handler as one message.
    pub max_message_size: usize,
}

impl EngineConfig {
    /// Engine listening on every interface at `port` with `shards` workers.
    pub fn new(shards: usize, port: u16) -> Self {
        Self {
            shards,
            port,
            ..Self::default()
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shards == 0 {
            return Err(ConfigError::Invalid("shards must be at least 1".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll interval must be non-zero".into()));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid(
                "max message size must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let section = EngineSection::default();
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: default_port(),
            shards: default_shards(),
            backlog: section.backlog,
            poll_interval: Duration::from_millis(section.poll_interval_ms),
            worker_wait: Duration::from_millis(section.worker_wait_ms),
            writer_wait: Duration::from_millis(section.writer_wait_ms),
            max_message_size: section.max_message_size,
        }
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub engine: EngineConfig,
    pub protocol: ProtocolType,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args over file values and validate the result.
    pub fn resolve(cli: CliArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let host = match cli.host {
            Some(host) => host,
            None => file.server.host.parse().map_err(|_| {
                ConfigError::Invalid(format!("invalid host address '{}'", file.server.host))
            })?,
        };

        let engine = EngineConfig {
            host,
            port: cli.port.unwrap_or(file.server.port),
            shards: cli
                .shards
                .or(file.engine.shards)
                .unwrap_or_else(default_shards),
            backlog: file.engine.backlog,
            poll_interval: Duration::from_millis(
                cli.poll_interval_ms.unwrap_or(file.engine.poll_interval_ms),
            ),
            worker_wait: Duration::from_millis(file.engine.worker_wait_ms),
            writer_wait: Duration::from_millis(file.engine.writer_wait_ms),
            max_message_size: cli
                .max_message_size
                .unwrap_or(file.engine.max_message_size),
        };
        engine.validate()?;

        Ok(Config {
            engine,
            protocol: cli.protocol.unwrap_or(file.server.protocol),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                file.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("shardline").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.protocol, ProtocolType::Echo);
        assert_eq!(config.engine.poll_interval_ms, 10);
        assert_eq!(config.engine.max_message_size, 64 * 1024);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 9000
            protocol = "ping"

            [engine]
            shards = 4
            poll_interval_ms = 25
            max_message_size = 4096

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.protocol, ProtocolType::Ping);
        assert_eq!(config.engine.shards, Some(4));
        assert_eq!(config.engine.poll_interval_ms, 25);
        assert_eq!(config.engine.writer_wait_ms, 5);
        assert_eq!(config.engine.max_message_size, 4096);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 9000
            protocol = "ping"

            [engine]
            shards = 4

            [logging]
            level = "warn"
            "#,
        )
        .unwrap();

        let config = Config::resolve(
            cli(&["--port", "7000", "--shards", "2", "--protocol", "discard"]),
            file,
        )
        .unwrap();
        assert_eq!(config.engine.port, 7000);
        assert_eq!(config.engine.shards, 2);
        assert_eq!(config.protocol, ProtocolType::Discard);
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.engine.host, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn test_rejects_zero_shards() {
        let err = Config::resolve(cli(&["--shards", "0"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_bad_host() {
        let file: TomlConfig = toml::from_str("[server]\nhost = \"not-an-ip\"\n").unwrap();
        let err = Config::resolve(cli(&[]), file).unwrap_err();
        assert!(err.to_string().contains("not-an-ip"));
    }

    #[test]
    fn test_engine_config_new() {
        let engine = EngineConfig::new(2, 0);
        assert_eq!(engine.shards, 2);
        assert_eq!(engine.port, 0);
        assert_eq!(engine.poll_interval, Duration::from_millis(10));
        assert!(engine.validate().is_ok());
        assert_eq!(engine.listen_addr().port(), 0);
    }
}
