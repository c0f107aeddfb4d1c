//! Configuration module for the chat-echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::connection::ConnectionSettings;
use crate::protocol::{
    BufferLimits, DEFAULT_READ_CAPACITY, DEFAULT_WRITE_CAPACITY, MAX_BUFFER_CAPACITY,
};
use bytes::Bytes;
use clap::error::ErrorKind;
use clap::Parser;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "chat-echo")]
#[command(author = "chat-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP server that echoes each message back with a newline", long_about = None)]
pub struct CliArgs {
    /// Port to listen on (1-65535)
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    pub port: Option<u16>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1)
    #[arg(long)]
    pub host: Option<IpAddr>,

    /// Read buffer size in bytes
    #[arg(long)]
    pub read_buffer: Option<usize>,

    /// Write buffer size in bytes (must fit a message plus its newline)
    #[arg(long)]
    pub write_buffer: Option<usize>,

    /// Message sent to every client on connect
    #[arg(long)]
    pub greeting: Option<String>,

    /// Close connections idle for this many seconds (0 = never)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

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
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: IpAddr,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Pending connection queue length
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Maximum concurrent connections
    pub max_connections: Option<usize>,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            max_connections: None,
            workers: None,
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,
    /// Sent to every client on connect
    pub greeting: Option<String>,
    /// Idle timeout in seconds (0 = never)
    #[serde(default)]
    pub idle_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: default_read_buffer_size(),
            write_buffer_size: default_write_buffer_size(),
            greeting: None,
            idle_timeout_secs: 0,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
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

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    12345
}

fn default_backlog() -> i32 {
    128
}

fn default_read_buffer_size() -> usize {
    DEFAULT_READ_CAPACITY
}

fn default_write_buffer_size() -> usize {
    DEFAULT_WRITE_CAPACITY
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub backlog: i32,
    pub max_connections: Option<usize>,
    pub workers: Option<usize>,
    pub limits: BufferLimits,
    pub greeting: Option<String>,
    pub idle_timeout: Option<Duration>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = match CliArgs::try_parse() {
            Ok(cli) => cli,
            Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
                e.exit()
            }
            Err(e) => return Err(ConfigError::Cli(e)),
        };

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let port = cli.port.unwrap_or(toml_config.server.port);
        if port == 0 {
            return Err(ConfigError::InvalidPort(port));
        }

        let read = cli
            .read_buffer
            .unwrap_or(toml_config.connection.read_buffer_size);
        let write = cli
            .write_buffer
            .unwrap_or(toml_config.connection.write_buffer_size);
        let limits =
            BufferLimits::new(read, write).ok_or(ConfigError::InvalidBufferSizes { read, write })?;

        let greeting = cli.greeting.or(toml_config.connection.greeting);
        if let Some(ref greeting) = greeting {
            // The greeting is echoed through the write buffer like any message
            if greeting.len() > limits.max_message_len() {
                return Err(ConfigError::GreetingTooLarge {
                    size: greeting.len() + 1,
                    capacity: limits.write_capacity(),
                });
            }
        }

        let workers = cli.workers.or(toml_config.server.workers);
        if workers == Some(0) {
            return Err(ConfigError::InvalidWorkers);
        }

        let idle_secs = cli
            .idle_timeout
            .unwrap_or(toml_config.connection.idle_timeout_secs);

        Ok(Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port,
            backlog: toml_config.server.backlog,
            max_connections: cli.max_connections.or(toml_config.server.max_connections),
            workers,
            limits,
            greeting,
            idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            limits: self.limits,
            greeting: self.greeting.clone().map(Bytes::from),
            idle_timeout: self.idle_timeout,
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    Cli(clap::Error),
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidPort(u16),
    InvalidBufferSizes { read: usize, write: usize },
    InvalidWorkers,
    GreetingTooLarge { size: usize, capacity: usize },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Cli(e) => write!(f, "{}", e),
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidPort(port) => {
                write!(f, "Invalid port {}: must be between 1 and 65535", port)
            }
            ConfigError::InvalidBufferSizes { read, write } => write!(
                f,
                "Invalid buffer sizes (read {}, write {}): both must be between 1 and {}",
                read, write, MAX_BUFFER_CAPACITY
            ),
            ConfigError::InvalidWorkers => write!(f, "Invalid worker count: must be at least 1"),
            ConfigError::GreetingTooLarge { size, capacity } => write!(
                f,
                "Greeting too large for write buffer (size {}, max {})",
                size, capacity
            ),
        }
    }
}

impl std::error::Error for ConfigError {}
