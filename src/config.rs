//! Proxy configuration
//!
//! Every setting has a default; `ProxyConfig::from_env` overlays the
//! `STUDYGUARD_*` environment variables on top of them.

use crate::blocklist::MatchPolicy;
use crate::dispatch::OverflowPolicy;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const ENV_HOST: &str = "STUDYGUARD_HOST";
pub const ENV_PORT: &str = "STUDYGUARD_PORT";
pub const ENV_BACKEND_URL: &str = "STUDYGUARD_BACKEND_URL";
pub const ENV_REFRESH_INTERVAL_SECS: &str = "STUDYGUARD_REFRESH_INTERVAL_SECS";
pub const ENV_MAX_CONNECTIONS: &str = "STUDYGUARD_MAX_CONNECTIONS";
pub const ENV_CONNECTION_TIMEOUT_SECS: &str = "STUDYGUARD_CONNECTION_TIMEOUT_SECS";
pub const ENV_MATCH_POLICY: &str = "STUDYGUARD_MATCH_POLICY";
pub const ENV_BACKEND_TIMEOUT_SECS: &str = "STUDYGUARD_BACKEND_TIMEOUT_SECS";
pub const ENV_LOG_QUEUE_CAPACITY: &str = "STUDYGUARD_LOG_QUEUE_CAPACITY";
pub const ENV_LOG_OVERFLOW: &str = "STUDYGUARD_LOG_OVERFLOW";
pub const ENV_LOG_RETRY_BACKOFF_MS: &str = "STUDYGUARD_LOG_RETRY_BACKOFF_MS";
pub const ENV_LOG_DIR: &str = "STUDYGUARD_LOG_DIR";

/// Configuration loading failure
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Log dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum number of outcomes held in the queue
    pub capacity: usize,
    /// What to discard when the queue is full
    pub overflow: OverflowPolicy,
    /// Pause after a failed delivery before the next attempt
    pub retry_backoff: Duration,
    /// How long the consumer waits for an item before re-checking shutdown
    pub dequeue_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            overflow: OverflowPolicy::DropOldest,
            retry_backoff: Duration::from_millis(2000),
            dequeue_timeout: Duration::from_secs(1),
        }
    }
}

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Bind address (e.g., "127.0.0.1")
    pub bind_address: String,
    /// Port to listen on
    pub port: u16,
    /// Base URL of the management backend, without trailing slash
    pub backend_url: String,
    /// How often the blocklist is re-fetched
    pub refresh_interval: Duration,
    /// Number of connections handled concurrently
    pub max_connections: usize,
    /// Read/connect/idle timeout applied to every socket operation
    pub connection_timeout: Duration,
    /// How a host is compared against blocklist entries
    pub match_policy: MatchPolicy,
    /// Timeout for requests to the management backend
    pub backend_timeout: Duration,
    pub dispatcher: DispatcherConfig,
    /// Directory for rolling log files; stderr when unset
    pub log_dir: Option<PathBuf>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8080,
            backend_url: "http://127.0.0.1:8000".to_string(),
            refresh_interval: Duration::from_secs(10),
            max_connections: 50,
            connection_timeout: Duration::from_secs(30),
            match_policy: MatchPolicy::Substring,
            backend_timeout: Duration::from_secs(5),
            dispatcher: DispatcherConfig::default(),
            log_dir: None,
        }
    }
}

impl ProxyConfig {
    /// Build a configuration from defaults overlaid with the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup(ENV_HOST) {
            config.bind_address = host;
        }
        if let Some(port) = parse_var::<u16, _>(&lookup, ENV_PORT)? {
            config.port = port;
        }
        if let Some(url) = lookup(ENV_BACKEND_URL) {
            config.backend_url = normalize_backend_url(&url);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_REFRESH_INTERVAL_SECS)? {
            config.refresh_interval = Duration::from_secs(secs);
        }
        if let Some(max) = parse_var::<usize, _>(&lookup, ENV_MAX_CONNECTIONS)? {
            config.max_connections = non_zero(ENV_MAX_CONNECTIONS, max)?;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_CONNECTION_TIMEOUT_SECS)? {
            config.connection_timeout = Duration::from_secs(secs);
        }
        if let Some(policy) = parse_var::<MatchPolicy, _>(&lookup, ENV_MATCH_POLICY)? {
            config.match_policy = policy;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_BACKEND_TIMEOUT_SECS)? {
            config.backend_timeout = Duration::from_secs(secs);
        }
        if let Some(capacity) = parse_var::<usize, _>(&lookup, ENV_LOG_QUEUE_CAPACITY)? {
            config.dispatcher.capacity = non_zero(ENV_LOG_QUEUE_CAPACITY, capacity)?;
        }
        if let Some(overflow) = parse_var::<OverflowPolicy, _>(&lookup, ENV_LOG_OVERFLOW)? {
            config.dispatcher.overflow = overflow;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_LOG_RETRY_BACKOFF_MS)? {
            config.dispatcher.retry_backoff = Duration::from_millis(ms);
        }
        if let Some(dir) = lookup(ENV_LOG_DIR).filter(|d| !d.trim().is_empty()) {
            config.log_dir = Some(PathBuf::from(dir));
        }

        Ok(config)
    }

    /// `host:port` the listener binds to
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn blocked_sites_url(&self) -> String {
        format!("{}/blocked-sites", self.backend_url)
    }

    pub fn logs_url(&self) -> String {
        format!("{}/logs", self.backend_url)
    }
}

fn normalize_backend_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

fn non_zero(var: &'static str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}
