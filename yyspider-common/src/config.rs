//! Configuration loading
//!
//! Each binary reads one TOML file into its config struct. Resolution order:
//! 1. Command-line argument / environment variable (applied by the binary)
//! 2. TOML config file
//! 3. Compiled defaults (every field has one)
//!
//! A missing default config file is not fatal: a warning is logged and the
//! compiled defaults are used. A config path given explicitly must exist.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::codec::DEFAULT_MAX_FRAME_LEN;
use crate::{Error, Result};

/// Default coordinator port
pub const DEFAULT_PORT: u16 = 7711;

/// File name of the server config under the config directory
pub const SERVER_CONFIG_FILE: &str = "yyspider-server.toml";

/// File name of the worker config under the config directory
pub const WORKER_CONFIG_FILE: &str = "yyspider-worker.toml";

/// `[logging]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is not set (e.g. "info", "yyspider_server=debug")
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Shared key workers hash together with their name
    pub secret_key: String,
    pub db_path: PathBuf,
    pub max_frame_len: usize,
    /// Per-collection write queue bound; reaching it forces an inline flush
    pub write_queue_max: usize,
    pub cleanup_interval_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Push ECHO_MESSAGE to every peer at this interval (unset = never)
    pub keepalive_interval_ms: Option<u64>,
    /// Re-lease CRAWLING tasks whose lease is older than this (unset = never)
    pub lease_timeout_secs: Option<u64>,
    /// Serve /health and /status on this port (unset = disabled)
    pub status_port: Option<u16>,
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            secret_key: String::new(),
            db_path: default_db_path(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            write_queue_max: 1000,
            cleanup_interval_ms: 5_000,
            handshake_timeout_ms: 10_000,
            keepalive_interval_ms: None,
            lease_timeout_secs: None,
            status_port: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.keepalive_interval_ms.map(Duration::from_millis)
    }

    pub fn lease_timeout(&self) -> Option<Duration> {
        self.lease_timeout_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.secret_key.is_empty() {
            return Err(Error::Config("secret_key must be set".to_string()));
        }
        if self.max_frame_len == 0 {
            return Err(Error::Config("max_frame_len must be positive".to_string()));
        }
        if self.write_queue_max == 0 {
            return Err(Error::Config("write_queue_max must be positive".to_string()));
        }
        if self.cleanup_interval_ms == 0 {
            return Err(Error::Config("cleanup_interval_ms must be positive".to_string()));
        }
        if self.keepalive_interval_ms == Some(0) {
            return Err(Error::Config("keepalive_interval_ms must be positive".to_string()));
        }
        Ok(())
    }
}

/// Worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub host: String,
    pub port: u16,
    /// Display name sent in the handshake
    pub name: String,
    pub secret_key: String,
    /// Collection to lease tasks from
    pub coll_name: String,
    /// Extra equality conditions for GET_TASK
    pub task_cond: serde_json::Map<String, serde_json::Value>,
    /// Bound of the local leased-task queue
    pub task_queue_size: usize,
    /// Most tasks requested per GET_TASK
    pub task_batch_size: u32,
    pub result_queue_size: usize,
    /// Sleep after the server had no tasks to lease
    pub empty_backoff_ms: u64,
    /// Sleep while the local task queue is full
    pub poll_interval_ms: u64,
    /// Reconnect delay after a connect or transport failure
    pub connect_retry_ms: u64,
    /// Reconnect delay after the handshake was rejected
    pub auth_retry_ms: u64,
    pub read_timeout_ms: u64,
    /// Attempts for a result the server answered with FAIL
    pub request_fail_retries: u32,
    pub crawl_concurrency: usize,
    pub crawl_timeout_ms: u64,
    /// Page bodies are truncated to this many bytes
    pub max_body_len: usize,
    /// How long the result saver keeps draining after shutdown
    pub shutdown_grace_ms: u64,
    pub max_frame_len: usize,
    pub logging: LoggingConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            name: "worker".to_string(),
            secret_key: String::new(),
            coll_name: "tasks".to_string(),
            task_cond: serde_json::Map::new(),
            task_queue_size: 100,
            task_batch_size: 20,
            result_queue_size: 1000,
            empty_backoff_ms: 10_000,
            poll_interval_ms: 1_000,
            connect_retry_ms: 30_000,
            auth_retry_ms: 60_000,
            read_timeout_ms: 600_000,
            request_fail_retries: 3,
            crawl_concurrency: 4,
            crawl_timeout_ms: 30_000,
            max_body_len: 512 * 1024,
            shutdown_grace_ms: 10_000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            logging: LoggingConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn empty_backoff(&self) -> Duration {
        Duration::from_millis(self.empty_backoff_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }

    pub fn auth_retry(&self) -> Duration {
        Duration::from_millis(self.auth_retry_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn crawl_timeout(&self) -> Duration {
        Duration::from_millis(self.crawl_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.secret_key.is_empty() {
            return Err(Error::Config("secret_key must be set".to_string()));
        }
        if self.name.is_empty() || self.name.contains(crate::auth::HANDSHAKE_DELIMITER) {
            return Err(Error::Config(format!("invalid worker name '{}'", self.name)));
        }
        if self.coll_name.is_empty() {
            return Err(Error::Config("coll_name must be set".to_string()));
        }
        if self.task_queue_size == 0 || self.result_queue_size == 0 {
            return Err(Error::Config("queue sizes must be positive".to_string()));
        }
        if self.task_batch_size == 0 {
            return Err(Error::Config("task_batch_size must be positive".to_string()));
        }
        if self.crawl_concurrency == 0 {
            return Err(Error::Config("crawl_concurrency must be positive".to_string()));
        }
        if self.max_body_len >= self.max_frame_len {
            return Err(Error::Config(format!(
                "max_body_len ({}) must be below max_frame_len ({})",
                self.max_body_len, self.max_frame_len
            )));
        }
        Ok(())
    }
}

/// Parse a config struct from TOML text
pub fn parse_config<T: DeserializeOwned>(content: &str) -> Result<T> {
    toml::from_str(content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
}

/// Platform config path for `file_name`, e.g. ~/.config/yyspider/yyspider-server.toml
pub fn default_config_path(file_name: &str) -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("yyspider").join(file_name))
}

/// Load a config struct
///
/// `explicit` is a path given on the command line or via environment; it
/// must exist. Without it the platform default path is tried and missing
/// files fall back to `T::default()`.
pub fn load_config<T>(explicit: Option<&Path>, file_name: &str) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if let Some(path) = explicit {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Read config {} failed: {}", path.display(), e))
        })?;
        info!("Loaded config from {}", path.display());
        return parse_config(&content);
    }

    match default_config_path(file_name) {
        Some(path) if path.exists() => {
            let content = std::fs::read_to_string(&path).map_err(|e| {
                Error::Config(format!("Read config {} failed: {}", path.display(), e))
            })?;
            info!("Loaded config from {}", path.display());
            parse_config(&content)
        }
        Some(path) => {
            warn!("Config file {} not found, using defaults", path.display());
            Ok(T::default())
        }
        None => {
            warn!("Could not determine config directory, using defaults");
            Ok(T::default())
        }
    }
}

/// OS-dependent default database location
fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("yyspider"))
        .unwrap_or_else(|| PathBuf::from("./yyspider_data"))
        .join("yyspider.db")
}
