//! Server configuration.
//!
//! Defaults suit local development. [`ServerConfig::from_env`] overrides
//! individual fields from `SQUID_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const ENV_BIND_ADDR: &str = "SQUID_BIND_ADDR";
pub const ENV_STORAGE_PATH: &str = "SQUID_STORAGE_PATH";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "SQUID_REQUEST_TIMEOUT_MS";
pub const ENV_SEND_TIMEOUT_MS: &str = "SQUID_SEND_TIMEOUT_MS";
pub const ENV_OUTBOUND_BUFFER: &str = "SQUID_OUTBOUND_BUFFER";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },
    #[error("{var} must not be empty")]
    Empty { var: &'static str },
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind the WebSocket listener to
    pub bind_addr: String,
    /// RocksDB directory
    pub storage_path: PathBuf,
    /// Deadline for a whole mutation or read request
    pub request_timeout: Duration,
    /// Longest a broadcast waits on one slow connection before evicting it
    pub send_timeout: Duration,
    /// Outbound frames buffered per connection
    pub outbound_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: PathBuf::from("squid_data"),
            request_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(2),
            outbound_buffer: 64,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by whatever `SQUID_*` variables are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup(ENV_BIND_ADDR) {
            config.bind_addr = non_empty(ENV_BIND_ADDR, addr)?;
        }
        if let Some(path) = lookup(ENV_STORAGE_PATH) {
            config.storage_path = PathBuf::from(non_empty(ENV_STORAGE_PATH, path)?);
        }
        if let Some(ms) = lookup(ENV_REQUEST_TIMEOUT_MS) {
            config.request_timeout = Duration::from_millis(positive(ENV_REQUEST_TIMEOUT_MS, ms)?);
        }
        if let Some(ms) = lookup(ENV_SEND_TIMEOUT_MS) {
            config.send_timeout = Duration::from_millis(positive(ENV_SEND_TIMEOUT_MS, ms)?);
        }
        if let Some(n) = lookup(ENV_OUTBOUND_BUFFER) {
            config.outbound_buffer = positive(ENV_OUTBOUND_BUFFER, n)? as usize;
        }

        Ok(config)
    }
}

fn non_empty(var: &'static str, value: String) -> Result<String, ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Empty { var });
    }
    Ok(trimmed.to_string())
}

fn positive(var: &'static str, value: String) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidNumber { var, value }),
    }
}
