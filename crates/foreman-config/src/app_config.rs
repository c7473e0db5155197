//! Application configuration structures.

use foreman_core::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application name and metadata.
    #[serde(default)]
    pub app: AppMetadata,

    /// Listener configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Job engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Persistence backend configuration.
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Application metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppMetadata {
    /// Application name.
    pub name: String,
    /// Application version.
    pub version: String,
    /// Environment (development, staging, production).
    pub environment: String,
}

impl Default for AppMetadata {
    fn default() -> Self {
        Self {
            name: "foreman".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest binary payload accepted from a peer, in bytes.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Longest text command line accepted from a peer, in bytes.
    #[serde(default = "default_max_text_line")]
    pub max_text_line: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    4730
}

fn default_max_packet_size() -> usize {
    64 * 1024 * 1024 // 64MB
}

fn default_max_text_line() -> usize {
    8 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_packet_size: default_max_packet_size(),
            max_text_line: default_max_text_line(),
        }
    }
}

impl ServerConfig {
    /// Returns the listener bind address.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// What happens to a job whose worker disconnects while it is WORKING.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerDisconnectPolicy {
    /// Put the job back on its queue, keeping its handle and waiters.
    #[default]
    Requeue,
    /// Report WORK_FAIL to the waiters and destroy the job.
    Fail,
}

impl fmt::Display for WorkerDisconnectPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requeue => write!(f, "requeue"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

/// Job engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Host name embedded in job handles (`H:<hostname>:<seq>`).
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Upper bound on how long a sleeping worker waits before it is
    /// told to poll again, in seconds.
    #[serde(default = "default_long_poll_interval")]
    pub long_poll_interval_secs: u64,

    /// Per-function queue capacity (0 = unlimited).
    #[serde(default)]
    pub max_queue_size: usize,

    /// Handling of jobs held by a worker that disconnects.
    #[serde(default)]
    pub worker_disconnect_policy: WorkerDisconnectPolicy,
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_long_poll_interval() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            long_poll_interval_secs: default_long_poll_interval(),
            max_queue_size: 0,
            worker_disconnect_policy: WorkerDisconnectPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Returns the long-poll interval as a Duration.
    #[must_use]
    pub fn long_poll_interval(&self) -> Duration {
        Duration::from_secs(self.long_poll_interval_secs)
    }
}

/// Persistence backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceBackend {
    /// In-process map; nothing survives a restart.
    #[default]
    Memory,
    /// Redis hashes via a connection pool.
    Redis,
}

impl fmt::Display for PersistenceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Redis => write!(f, "redis"),
        }
    }
}

/// Persistence configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Which engine stores submitted jobs.
    #[serde(default)]
    pub backend: PersistenceBackend,

    /// Redis settings, used when `backend = "redis"`.
    #[serde(default)]
    pub redis: RedisConfig,
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Key prefix for all job keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_key_prefix() -> String {
    "foreman".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            key_prefix: default_key_prefix(),
        }
    }
}
