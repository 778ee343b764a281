//! Configuration management for the relay
//!
//! Loads configuration from config.toml at startup (`CONFIG_PATH` overrides
//! the location). Every field has a default, so a missing file or a partial
//! file is fine.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::provider::chart::ChartSessionConfig;
use crate::provider::stream::StreamSessionConfig;
use crate::provider::SupervisorConfig;
use crate::ws::BackoffConfig;

/// Relay configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub chart: ChartConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Downstream WebSocket + status API server
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Binary stream provider
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_stream_url")]
    pub url: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub account_id: u64,
    #[serde(default)]
    pub access_token: String,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_max_missed")]
    pub max_missed_heartbeats: u32,
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

/// Chart provider
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChartConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_chart_url")]
    pub url: String,
    #[serde(default = "default_chart_token")]
    pub auth_token: String,
    #[serde(default = "default_chart_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_intraday_bars")]
    pub intraday_bars: u32,
}

/// Per-key staleness detection
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_secs: u64,
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    /// Re-issue the upstream subscribe when a key goes stale
    #[serde(default)]
    pub resubscribe_on_stale: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
}

/// Provider reconnection backoff
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub dir: String,
    /// Used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_stream_url(),
            client_id: String::new(),
            client_secret: String::new(),
            account_id: 0,
            access_token: String::new(),
            heartbeat_secs: default_heartbeat_secs(),
            max_missed_heartbeats: default_max_missed(),
            max_requests: default_max_requests(),
            window_ms: default_window_ms(),
        }
    }
}

impl Default for ChartConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_chart_url(),
            auth_token: default_chart_token(),
            heartbeat_timeout_secs: default_chart_heartbeat_timeout(),
            max_requests: default_max_requests(),
            window_ms: default_window_ms(),
            intraday_bars: default_intraday_bars(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stale_threshold_secs: default_stale_threshold(),
            check_interval_secs: default_check_interval(),
            resubscribe_on_stale: false,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            deadline_secs: default_deadline_secs(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            cap_ms: default_cap_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    8080
}

fn default_stream_url() -> String {
    "wss://127.0.0.1:5036".to_string()
}

fn default_chart_url() -> String {
    "wss://127.0.0.1:8443/socket.io/websocket".to_string()
}

fn default_chart_token() -> String {
    "unauthorized_user_token".to_string()
}

fn default_heartbeat_secs() -> u64 {
    10
}

fn default_max_missed() -> u32 {
    3
}

fn default_chart_heartbeat_timeout() -> u64 {
    30
}

fn default_max_requests() -> usize {
    5
}

fn default_window_ms() -> u64 {
    1000
}

fn default_intraday_bars() -> u32 {
    1440
}

fn default_stale_threshold() -> u64 {
    30
}

fn default_check_interval() -> u64 {
    10
}

fn default_deadline_secs() -> u64 {
    10
}

fn default_base_ms() -> u64 {
    500
}

fn default_cap_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    10
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from `CONFIG_PATH` or config.toml
    ///
    /// If the file doesn't exist, returns default configuration.
    /// # Errors
    /// Returns error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => Self::from_toml(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reject values the relay cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream.enabled {
            check_ws_url("stream.url", &self.stream.url)?;
            check_non_zero("stream.heartbeat_secs", self.stream.heartbeat_secs)?;
            check_non_zero("stream.max_missed_heartbeats", self.stream.max_missed_heartbeats as u64)?;
            check_non_zero("stream.max_requests", self.stream.max_requests as u64)?;
            check_non_zero("stream.window_ms", self.stream.window_ms)?;
        }
        if self.chart.enabled {
            check_ws_url("chart.url", &self.chart.url)?;
            check_non_zero("chart.heartbeat_timeout_secs", self.chart.heartbeat_timeout_secs)?;
            check_non_zero("chart.max_requests", self.chart.max_requests as u64)?;
            check_non_zero("chart.window_ms", self.chart.window_ms)?;
        }
        check_non_zero("health.stale_threshold_secs", self.health.stale_threshold_secs)?;
        check_non_zero("health.check_interval_secs", self.health.check_interval_secs)?;
        check_non_zero("coordinator.deadline_secs", self.coordinator.deadline_secs)?;
        check_non_zero("reconnect.base_ms", self.reconnect.base_ms)?;
        if self.reconnect.cap_ms < self.reconnect.base_ms {
            return Err(ConfigError::Invalid(format!(
                "reconnect.cap_ms ({}) is below reconnect.base_ms ({})",
                self.reconnect.cap_ms, self.reconnect.base_ms
            )));
        }
        Ok(())
    }

    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_millis(self.reconnect.base_ms),
            cap: Duration::from_millis(self.reconnect.cap_ms),
            max_attempts: self.reconnect.max_attempts,
        }
    }

    pub fn coordinator_deadline(&self) -> Duration {
        Duration::from_secs(self.coordinator.deadline_secs)
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            backoff: self.backoff(),
            package_ttl: self.coordinator_deadline(),
        }
    }

    pub fn stream_session(&self) -> StreamSessionConfig {
        StreamSessionConfig {
            url: self.stream.url.clone(),
            client_id: self.stream.client_id.clone(),
            client_secret: self.stream.client_secret.clone(),
            account_id: self.stream.account_id,
            access_token: self.stream.access_token.clone(),
            heartbeat_interval: Duration::from_secs(self.stream.heartbeat_secs),
            max_missed_heartbeats: self.stream.max_missed_heartbeats,
            max_requests: self.stream.max_requests,
            window: Duration::from_millis(self.stream.window_ms),
            ..StreamSessionConfig::default()
        }
    }

    pub fn chart_session(&self) -> ChartSessionConfig {
        ChartSessionConfig {
            url: self.chart.url.clone(),
            auth_token: self.chart.auth_token.clone(),
            heartbeat_timeout: Duration::from_secs(self.chart.heartbeat_timeout_secs),
            max_requests: self.chart.max_requests,
            window: Duration::from_millis(self.chart.window_ms),
            intraday_bars: self.chart.intraday_bars,
            ..ChartSessionConfig::default()
        }
    }
}

fn check_ws_url(field: &str, value: &str) -> Result<(), ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::Invalid(format!("{}: {}", field, e)))?;
    match url.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(ConfigError::Invalid(format!(
            "{}: unsupported scheme {}",
            field, other
        ))),
    }
}

fn check_non_zero(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!("{} must be non-zero", field)));
    }
    Ok(())
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}
