//! Client configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via RESPLINK_CONFIG)
//! 3. Environment variables

use crate::error::ClientError;
use crate::queue::QueueConfig;
use resplink_protocol::{DecodeConfig, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default read buffer size (16 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 16 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Default corked write size (64 KiB).
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address (`host:port`).
    pub addr: String,
    /// RESP protocol version to negotiate (2 or 3).
    pub protocol: u8,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Name announced with `HELLO SETNAME` / `CLIENT SETNAME`.
    pub client_name: Option<String>,
    /// Database selected after every (re)connect.
    pub database: u32,
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Default per-request timeout in milliseconds (none when unset).
    pub request_timeout_ms: Option<u64>,
    /// Maximum pending requests (unbounded when unset).
    pub max_queue_length: Option<usize>,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Upper bound for one corked write.
    pub write_buffer_size: usize,
    /// Reconnect after the connection drops.
    pub reconnect: bool,
    /// Delay between reconnect attempts in milliseconds.
    pub reconnect_delay_ms: u64,
    /// Reconnect attempts before giving up (unlimited when unset).
    pub max_reconnect_attempts: Option<u32>,
    /// Keepalive `PING` interval in milliseconds (disabled when unset).
    pub ping_interval_ms: Option<u64>,
    /// Default decode configuration for replies.
    pub decode: DecodeConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: format!("127.0.0.1:{}", DEFAULT_PORT),
            protocol: 3,
            username: None,
            password: None,
            client_name: None,
            database: 0,
            connect_timeout_ms: 10_000,
            request_timeout_ms: None,
            max_queue_length: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            reconnect: true,
            reconnect_delay_ms: 500,
            max_reconnect_attempts: None,
            ping_interval_ms: None,
            decode: DecodeConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Self::default()
        }
    }

    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("RESPLINK_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: ClientConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("RESPLINK_ADDR") {
            self.addr = addr;
        }

        if let Ok(protocol) = std::env::var("RESPLINK_PROTOCOL") {
            if let Ok(v) = protocol.parse() {
                self.protocol = v;
            }
        }

        if let Ok(username) = std::env::var("RESPLINK_USERNAME") {
            self.username = Some(username);
        }

        if let Ok(password) = std::env::var("RESPLINK_PASSWORD") {
            self.password = Some(password);
        }

        if let Ok(db) = std::env::var("RESPLINK_DATABASE") {
            if let Ok(v) = db.parse() {
                self.database = v;
            }
        }

        if let Ok(max) = std::env::var("RESPLINK_MAX_QUEUE") {
            if let Ok(n) = max.parse() {
                self.max_queue_length = Some(n);
            }
        }

        if let Ok(timeout) = std::env::var("RESPLINK_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.request_timeout_ms = Some(ms);
            }
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.protocol, 2 | 3) {
            return Err(ConfigError::ValidationError(format!(
                "unsupported protocol version {}",
                self.protocol
            )));
        }
        if self.addr.is_empty() {
            return Err(ConfigError::ValidationError(
                "addr must not be empty".to_string(),
            ));
        }
        if self.max_queue_length == Some(0) {
            return Err(ConfigError::ValidationError(
                "max_queue_length must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    pub fn with_protocol(mut self, protocol: u8) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_auth(mut self, username: Option<String>, password: impl Into<String>) -> Self {
        self.username = username;
        self.password = Some(password.into());
        self
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn with_database(mut self, database: u32) -> Self {
        self.database = database;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_max_queue_length(mut self, max: usize) -> Self {
        self.max_queue_length = Some(max);
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size.max(1);
        self
    }

    pub fn with_reconnect(mut self, enabled: bool) -> Self {
        self.reconnect = enabled;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn with_decode(mut self, decode: DecodeConfig) -> Self {
        self.decode = decode;
        self
    }

    /// Returns connect timeout as Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Returns the default request timeout as Duration.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Returns reconnect delay as Duration.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Returns keepalive interval as Duration.
    pub fn ping_interval(&self) -> Option<Duration> {
        self.ping_interval_ms.map(Duration::from_millis)
    }

    /// Read buffer size, clamped to the supported range.
    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_size
            .clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE)
    }

    /// Queue settings derived from this configuration.
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_length: self.max_queue_length,
            default_decode: self.decode,
            protocol: self.protocol,
        }
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file {}: {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file {}: {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "invalid configuration: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for ClientError {
    fn from(err: ConfigError) -> Self {
        ClientError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resplink_protocol::BlobMode;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.addr, "127.0.0.1:6379");
        assert_eq!(config.protocol, 3);
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.request_timeout(), None);
        assert!(config.reconnect);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_buffer_clamping() {
        let config = ClientConfig::default().with_read_buffer_size(100);
        assert_eq!(config.read_buffer_size, MIN_READ_BUFFER_SIZE);

        let config = ClientConfig::default().with_read_buffer_size(10 * 1024 * 1024);
        assert_eq!(config.read_buffer_size, MAX_READ_BUFFER_SIZE);
    }

    #[test]
    fn test_validation() {
        let config = ClientConfig::default().with_protocol(4);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let config = ClientConfig::default().with_max_queue_length(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_queue_config() {
        let decode = DecodeConfig::new().with_blob_string(BlobMode::Bytes);
        let config = ClientConfig::default()
            .with_protocol(2)
            .with_max_queue_length(16)
            .with_decode(decode);
        let queue = config.queue_config();
        assert_eq!(queue.max_length, Some(16));
        assert_eq!(queue.protocol, 2);
        assert_eq!(queue.default_decode, decode);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = ClientConfig::new("cache.internal:6380")
            .with_database(2)
            .with_request_timeout(Duration::from_millis(250));
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: ClientConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let parsed: ClientConfig =
            serde_yaml::from_str("addr: \"10.0.0.5:7000\"\nprotocol: 2\n").unwrap();
        assert_eq!(parsed.addr, "10.0.0.5:7000");
        assert_eq!(parsed.protocol, 2);
        assert_eq!(parsed.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
    }

    #[test]
    fn test_config_error_into_client_error() {
        let err: ClientError = ConfigError::ValidationError("bad".to_string()).into();
        assert!(matches!(err, ClientError::Config(msg) if msg.contains("bad")));
    }
}
