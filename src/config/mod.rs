//! Configuration management for ClipShare
//!
//! This module handles loading, validating, and saving the TOML
//! configuration, and converts it into the settings of each component.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::progress::ProgressSignaler;
use crate::transport::chunk::{chunk_count, RejoinerConfig, MAX_DECODE_SIZE};
use crate::transport::server::ServerProtocol;
use crate::transport::{connector_for_url, ReconnectionConfig, RemoteNodeConfig, ServerConfig};

/// Environment variable naming a config file
pub const CONFIG_ENV: &str = "CLIPSHARE_CONFIG";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("Failed to write TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error
    #[error("Config validation failed: {0}")]
    Validation(String),
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Listening side
    #[serde(default)]
    pub server: ServerSettings,

    /// Outbound connection
    #[serde(default)]
    pub client: ClientSettings,

    /// Chunking and connection timing
    #[serde(default)]
    pub transport: TransportSettings,

    /// Clipboard configuration
    #[serde(default)]
    pub clipboard: ClipboardSettings,
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Accept connections from peers
    #[serde(default = "default_server_enabled")]
    pub enabled: bool,

    /// Network address to listen on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// websocket or tcp
    #[serde(default)]
    pub protocol: ServerProtocol,
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Keep a connection to `url` open
    #[serde(default)]
    pub enabled: bool,

    /// Server to connect to, `ws://host:port` or `tcp://host:port`
    #[serde(default = "default_client_url")]
    pub url: String,
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Payload bytes per chunk
    #[serde(default = "default_split_size")]
    pub split_size: usize,

    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    /// Drop partially received messages idle for this long
    #[serde(default = "default_reassembly_timeout_secs")]
    pub reassembly_timeout_secs: u64,

    /// Largest chunk count accepted for one message
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,

    /// Largest frame accepted on a raw TCP socket
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

/// Clipboard configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipboardSettings {
    /// Maximum payload size in bytes
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// How often the system clipboard is checked for changes
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_server_enabled() -> bool {
    true
}

fn default_listen_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_client_url() -> String {
    "ws://localhost:8000".to_string()
}

fn default_split_size() -> usize {
    crate::DEFAULT_SPLIT_SIZE
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    7
}

fn default_keepalive_interval_secs() -> u64 {
    30
}

fn default_reassembly_timeout_secs() -> u64 {
    300
}

fn default_max_chunks() -> usize {
    crate::transport::chunk::DEFAULT_MAX_CHUNKS
}

fn default_max_frame_size() -> usize {
    crate::transport::framed::DEFAULT_MAX_FRAME_SIZE
}

fn default_max_size() -> usize {
    5_242_880 // 5MB
}

fn default_poll_interval_ms() -> u64 {
    250
}

// Default implementations
impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: default_server_enabled(),
            listen_addr: default_listen_addr(),
            protocol: ServerProtocol::default(),
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_client_url(),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            split_size: default_split_size(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            reassembly_timeout_secs: default_reassembly_timeout_secs(),
            max_chunks: default_max_chunks(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl Default for ClipboardSettings {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            server: ServerSettings::default(),
            client: ClientSettings::default(),
            transport: TransportSettings::default(),
            clipboard: ClipboardSettings::default(),
        }
    }
}

/// Room left in a frame for the chunk header
const CHUNK_HEADER_ALLOWANCE: usize = 64;

impl TransportSettings {
    pub fn reconnection(&self) -> ReconnectionConfig {
        ReconnectionConfig {
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            keepalive_interval: Duration::from_secs(self.keepalive_interval_secs),
        }
    }

    pub fn rejoiner(&self) -> RejoinerConfig {
        RejoinerConfig {
            max_chunks: self.max_chunks,
            reassembly_timeout: Duration::from_secs(self.reassembly_timeout_secs),
        }
    }

    /// Settings for remote nodes, reporting progress to `progress`
    pub fn remote_node(&self, progress: ProgressSignaler) -> RemoteNodeConfig {
        RemoteNodeConfig {
            split_size: self.split_size,
            rejoiner: self.rejoiner(),
            progress,
            idle_timeout: Duration::from_secs(self.keepalive_interval_secs * 2),
        }
    }
}

impl ClipboardSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Checks in order:
    /// 1. Path from CLIPSHARE_CONFIG environment variable
    /// 2. ~/.config/clipshare/config.toml
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_path() {
            Some(path) => Self::load_from_path(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration with optional custom path
    pub fn load_config(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        match config_path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Find configuration file path
    fn find_config_path() -> Option<PathBuf> {
        // Check environment variable first
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        Self::default_path().filter(|p| p.exists())
    }

    /// ~/.config/clipshare/config.toml, or the platform equivalent
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("clipshare").join("config.toml"))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let transport = &self.transport;

        if transport.split_size == 0 {
            return Err(ConfigError::Validation(
                "split_size must be at least 1 byte".to_string(),
            ));
        }
        if transport.split_size + CHUNK_HEADER_ALLOWANCE > transport.max_frame_size {
            return Err(ConfigError::Validation(format!(
                "split_size must leave room for chunk headers within max_frame_size ({} bytes)",
                transport.max_frame_size
            )));
        }
        if transport.max_frame_size > MAX_DECODE_SIZE {
            return Err(ConfigError::Validation(format!(
                "max_frame_size must not exceed {} bytes",
                MAX_DECODE_SIZE
            )));
        }
        if transport.max_chunks == 0 {
            return Err(ConfigError::Validation(
                "max_chunks must be at least 1".to_string(),
            ));
        }
        // Peers drop messages announcing more chunks than this
        let largest = chunk_count(self.clipboard.max_size, transport.split_size);
        if largest > transport.max_chunks {
            return Err(ConfigError::Validation(format!(
                "a {} byte clipboard needs {} chunks at split_size {}, more than max_chunks ({})",
                self.clipboard.max_size, largest, transport.split_size, transport.max_chunks
            )));
        }

        for (name, value) in [
            ("connect_timeout_secs", transport.connect_timeout_secs),
            ("keepalive_interval_secs", transport.keepalive_interval_secs),
            ("reassembly_timeout_secs", transport.reassembly_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        // Validate max_size range (1KB to 50MB)
        if self.clipboard.max_size < 1024 {
            return Err(ConfigError::Validation(
                "max_size must be at least 1024 bytes (1KB)".to_string(),
            ));
        }
        if self.clipboard.max_size > 52_428_800 {
            return Err(ConfigError::Validation(
                "max_size must not exceed 52428800 bytes (50MB)".to_string(),
            ));
        }
        if self.clipboard.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        self.listen_addr()?;

        if self.client.enabled {
            connector_for_url(&self.client.url, self.transport.max_frame_size)
                .map_err(|e| ConfigError::Validation(e.to_string()))?;
        }

        Ok(())
    }

    /// Parsed server listen address
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server.listen_addr.parse().map_err(|_| {
            ConfigError::Validation(format!(
                "listen_addr '{}' is not a valid host:port address",
                self.server.listen_addr
            ))
        })
    }

    /// Settings for the listening side
    pub fn server_config(&self) -> Result<ServerConfig, ConfigError> {
        Ok(ServerConfig {
            listen_addr: self.listen_addr()?,
            protocol: self.server.protocol,
            connect_timeout: Duration::from_secs(self.transport.connect_timeout_secs),
            keepalive_interval: Duration::from_secs(self.transport.keepalive_interval_secs),
            max_frame_size: self.transport.max_frame_size,
        })
    }

    /// Save configuration to default location
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path().ok_or_else(|| {
            ConfigError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not find config directory",
            ))
        })?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save configuration to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }

    /// Write the commented example configuration to `path`
    pub fn write_example(path: &Path, force: bool) -> Result<(), ConfigError> {
        if !force && path.exists() {
            return Err(ConfigError::Validation(
                "Config file already exists. Use --force to overwrite.".to_string(),
            ));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, Self::generate_example())?;
        Ok(())
    }

    /// Generate example configuration file
    pub fn generate_example() -> String {
        let config = Config::default();

        format!(
            r#"# ClipShare Configuration File
# Location: ~/.config/clipshare/config.toml

# Logging level (trace, debug, info, warn, error)
log_level = "{}"

# Accept connections from other devices
[server]
enabled = {}
# Address and port to listen on
listen_addr = "{}"
# Wire protocol: "websocket" or "tcp"
protocol = "{}"

# Connect to another device running a server
[client]
enabled = {}
# ws://host:port or tcp://host:port
url = "{}"

# Chunking and connection timing
[transport]
# Bytes of clipboard data per chunk
split_size = {}
# Wait before reconnecting after a lost connection
reconnect_delay_secs = {}
# Give up on a connection attempt after this long
connect_timeout_secs = {}
# Keep-alive interval while connected
keepalive_interval_secs = {}
# Drop partially received clipboard content idle for this long
reassembly_timeout_secs = {}
# Largest number of chunks accepted for one clipboard entry
max_chunks = {}
# Largest frame accepted on a tcp connection
max_frame_size = {}

# Clipboard settings
[clipboard]
# Maximum clipboard payload size in bytes (5MB default)
max_size = {}
# How often the system clipboard is checked, in milliseconds
poll_interval_ms = {}
"#,
            config.log_level,
            config.server.enabled,
            config.server.listen_addr,
            config.server.protocol,
            config.client.enabled,
            config.client.url,
            config.transport.split_size,
            config.transport.reconnect_delay_secs,
            config.transport.connect_timeout_secs,
            config.transport.keepalive_interval_secs,
            config.transport.reassembly_timeout_secs,
            config.transport.max_chunks,
            config.transport.max_frame_size,
            config.clipboard.max_size,
            config.clipboard.poll_interval_ms,
        )
    }
}
