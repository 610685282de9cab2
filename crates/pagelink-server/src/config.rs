//! Server configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Bounded retry for writing a frame to a connection's send queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay_ms: u64,
}

impl RetryPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 100,
            delay_ms: 1,
        }
    }
}

/// Which live connections receive an outbound call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastPolicy {
    /// Every live connection (of the target page, when one is given).
    #[default]
    AllConnections,
    /// Only the most recently attached connection of each page.
    LatestPerPage,
}

/// Configuration for the pagelink server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `8000`, `0` to auto-assign).
    pub port: u16,
    /// Frames buffered per connection before sends start retrying.
    pub max_send_queue: usize,
    /// How long the poll path waits for a peer result.
    pub result_timeout_ms: u64,
    pub send_retry: RetryPolicy,
    pub broadcast: BroadcastPolicy,
    /// Unread results older than this are dropped. `None` keeps them forever.
    pub unread_result_ttl_secs: Option<u64>,
    /// How often expired unread results are swept.
    pub sweep_interval_secs: u64,
    /// Page key for connections that do not send one.
    pub default_page: String,
    /// Websocket ping interval.
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
            max_send_queue: 256,
            result_timeout_ms: 10_000,
            send_retry: RetryPolicy::default(),
            broadcast: BroadcastPolicy::default(),
            unread_result_ttl_secs: Some(300),
            sweep_interval_secs: 60,
            default_page: "default".into(),
            heartbeat_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.result_timeout_ms == 0 {
            return Err(ConfigError::Invalid("result_timeout_ms must be > 0".into()));
        }
        if self.send_retry.attempts == 0 {
            return Err(ConfigError::Invalid("send_retry.attempts must be > 0".into()));
        }
        if self.max_send_queue == 0 {
            return Err(ConfigError::Invalid("max_send_queue must be > 0".into()));
        }
        if self.sweep_interval_secs == 0 || self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid("intervals must be > 0".into()));
        }
        if self.default_page.is_empty() {
            return Err(ConfigError::Invalid("default_page must not be empty".into()));
        }
        Ok(())
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_millis(self.result_timeout_ms)
    }

    pub fn unread_result_ttl(&self) -> Option<Duration> {
        self.unread_result_ttl_secs.map(Duration::from_secs)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
