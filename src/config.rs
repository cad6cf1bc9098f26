//! Configuration module for grow-a-websocket server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocols::websocket::Limits;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Largest value accepted for any byte-size setting.
pub const MAX_SIZE_LIMIT: usize = u32::MAX as usize;

/// Which I/O driver runs the connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Readiness event loop, one poller per worker thread
    #[default]
    Mio,
    /// Task per connection on a tokio multi-thread runtime
    Tokio,
}

/// Command-line arguments for the WebSocket server
#[derive(Parser, Debug, Default)]
#[command(name = "grow-a-websocket")]
#[command(author = "grow-a-websocket authors")]
#[command(version = "0.1.0")]
#[command(about = "A WebSocket echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:9001)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// I/O runtime
    #[arg(short = 'r', long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Maximum payload of a single frame in bytes
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Maximum size of a reassembled message in bytes
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
    pub server: ServerConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub runtime: RuntimeType,
    /// Number of worker threads
    pub workers: Option<usize>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Events drained per poll call
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Bytes queued for a slow reader before it is dropped
    #[serde(default = "default_max_write_backlog")]
    pub max_write_backlog: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            runtime: RuntimeType::default(),
            workers: None,
            max_connections: default_max_connections(),
            batch_size: default_batch_size(),
            read_buffer_size: default_read_buffer_size(),
            max_write_backlog: default_max_write_backlog(),
        }
    }
}

/// Protocol limits
#[derive(Debug, Deserialize)]
pub struct WebSocketConfig {
    /// Growth increment of per-connection buffers
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_max_handshake_size")]
    pub max_handshake_size: usize,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_handshake_size: default_max_handshake_size(),
            max_frame_size: default_max_frame_size(),
            max_message_size: default_max_message_size(),
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

fn default_listen() -> String {
    "127.0.0.1:9001".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    1024
}

fn default_read_buffer_size() -> usize {
    16 * 1024
}

fn default_max_write_backlog() -> usize {
    64 * 1024 * 1024 // 64 MB
}

fn default_chunk_size() -> usize {
    Limits::default().chunk_size
}

fn default_max_handshake_size() -> usize {
    Limits::default().max_handshake_size
}

fn default_max_frame_size() -> usize {
    Limits::default().max_frame_size
}

fn default_max_message_size() -> usize {
    Limits::default().max_message_size
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub runtime: RuntimeType,
    /// Worker threads; 0 means one per CPU
    pub workers: usize,
    pub max_connections: usize,
    pub batch_size: usize,
    pub read_buffer_size: usize,
    pub max_write_backlog: usize,
    pub chunk_size: usize,
    pub max_handshake_size: usize,
    pub max_frame_size: usize,
    pub max_message_size: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let server = ServerConfig::default();
        let limits = Limits::default();
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 9001)),
            runtime: server.runtime,
            workers: 0,
            max_connections: server.max_connections,
            batch_size: server.batch_size,
            read_buffer_size: server.read_buffer_size,
            max_write_backlog: server.max_write_backlog,
            chunk_size: limits.chunk_size,
            max_handshake_size: limits.max_handshake_size,
            max_frame_size: limits.max_frame_size,
            max_message_size: limits.max_message_size,
            log_level: default_log_level(),
        }
    }
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

        Self::from_sources(cli, toml_config)
    }

    /// Merge parsed CLI args over a parsed TOML file and validate the result.
    pub fn from_sources(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid listen address '{listen}'")))?;

        let config = Config {
            listen,
            runtime: cli.runtime.unwrap_or(toml_config.server.runtime),
            workers: cli.workers.or(toml_config.server.workers).unwrap_or(0),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            batch_size: toml_config.server.batch_size,
            read_buffer_size: toml_config.server.read_buffer_size,
            max_write_backlog: toml_config.server.max_write_backlog,
            chunk_size: toml_config.websocket.chunk_size,
            max_handshake_size: toml_config.websocket.max_handshake_size,
            max_frame_size: cli
                .max_frame_size
                .unwrap_or(toml_config.websocket.max_frame_size),
            max_message_size: cli
                .max_message_size
                .unwrap_or(toml_config.websocket.max_message_size),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("chunk_size", self.chunk_size),
            ("max_connections", self.max_connections),
            ("batch_size", self.batch_size),
            ("read_buffer_size", self.read_buffer_size),
            ("max_handshake_size", self.max_handshake_size),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }
        let sizes = [
            ("chunk_size", self.chunk_size),
            ("read_buffer_size", self.read_buffer_size),
            ("max_write_backlog", self.max_write_backlog),
            ("max_handshake_size", self.max_handshake_size),
            ("max_frame_size", self.max_frame_size),
            ("max_message_size", self.max_message_size),
        ];
        for (name, value) in sizes {
            if value > MAX_SIZE_LIMIT {
                return Err(ConfigError::Invalid(format!(
                    "{name} ({value}) exceeds {MAX_SIZE_LIMIT}"
                )));
            }
        }
        if self.max_frame_size > self.max_message_size {
            return Err(ConfigError::Invalid(format!(
                "max_frame_size ({}) exceeds max_message_size ({})",
                self.max_frame_size, self.max_message_size
            )));
        }
        Ok(())
    }

    /// Per-connection protocol limits.
    pub fn limits(&self) -> Limits {
        Limits {
            chunk_size: self.chunk_size,
            max_handshake_size: self.max_handshake_size,
            max_frame_size: self.max_frame_size,
            max_message_size: self.max_message_size,
        }
    }

    /// Resolved worker thread count.
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.workers
        }
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
