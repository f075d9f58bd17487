//! Streaming client configuration.
//!
//! Configuration is loaded from environment variables. Endpoint URLs may
//! carry access tokens and are redacted in Debug output.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use common::config::ObservabilityConfig;
use thiserror::Error;

use crate::catalog::EndpointCatalog;
use crate::playback::DEFAULT_STALL_REWIND_SECONDS;

/// Default WebSocket handshake timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Default time an append may stay in flight before the session is torn down.
pub const DEFAULT_APPEND_TIMEOUT_MS: u64 = 10_000;

/// Default delay between reconnect attempts in milliseconds.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5_000;

/// Default upper bound for backoff delays in milliseconds.
pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;

/// Default number of consecutive reconnect attempts before giving up.
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 10;

/// Default queue depth at which a backlog warning is logged.
pub const DEFAULT_QUEUE_HIGH_WATER: usize = 64;

/// Default directory the probe records streams into.
pub const DEFAULT_RECORD_DIR: &str = "recordings";

/// Default bind address for the probe's metrics and health endpoints.
pub const DEFAULT_METRICS_BIND_ADDRESS: &str = "0.0.0.0:9095";

/// What to do when a stream connection drops or cannot be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Surface the failure and stop.
    Disabled,
    /// Retry after a constant delay.
    Fixed {
        delay: Duration,
        /// `None` retries forever.
        max_attempts: Option<u32>,
    },
    /// Retry with a doubling delay, capped at `max`.
    Backoff {
        base: Duration,
        max: Duration,
        /// `None` retries forever.
        max_attempts: Option<u32>,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed {
            delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            max_attempts: Some(DEFAULT_RECONNECT_MAX_ATTEMPTS),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), or `None` to give up.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match *self {
            ReconnectPolicy::Disabled => None,
            ReconnectPolicy::Fixed {
                delay,
                max_attempts,
            } => within(attempt, max_attempts).then_some(delay),
            ReconnectPolicy::Backoff {
                base,
                max,
                max_attempts,
            } => {
                if !within(attempt, max_attempts) {
                    return None;
                }
                let exponent = attempt.saturating_sub(1).min(16);
                Some(base.saturating_mul(1 << exponent).min(max))
            }
        }
    }

    /// Whether reconnects are enabled at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !matches!(self, ReconnectPolicy::Disabled)
    }
}

fn within(attempt: u32, max_attempts: Option<u32>) -> bool {
    attempt >= 1 && max_attempts.map_or(true, |max| attempt <= max)
}

/// Streaming client configuration.
///
/// Loaded from environment variables with sensible defaults.
#[derive(Clone)]
pub struct Config {
    /// Per-camera stream endpoints (`STREAM_ENDPOINTS`).
    pub catalog: EndpointCatalog,

    /// WebSocket handshake timeout (default: 5s).
    pub connect_timeout: Duration,

    /// Maximum time an append may be in flight (default: 10s).
    pub append_timeout: Duration,

    /// Reconnect behaviour on connection loss (default: fixed 5s, 10 attempts).
    pub reconnect: ReconnectPolicy,

    /// Apply stall correction on pause (default: true).
    pub live_mode: bool,

    /// Rewind applied by stall correction, in seconds (default: 0.1).
    pub stall_rewind_seconds: f64,

    /// Queue depth that triggers a backlog warning (default: 64, 0 disables).
    pub queue_high_water: usize,

    /// Directory the probe records into (default: "recordings").
    pub record_dir: PathBuf,

    /// Metrics/health bind address for the probe (default: "0.0.0.0:9095").
    pub metrics_bind_address: String,

    /// Logging settings.
    pub observability: ObservabilityConfig,
}

/// Custom Debug implementation that redacts endpoint URLs.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("catalog", &self.catalog)
            .field("connect_timeout", &self.connect_timeout)
            .field("append_timeout", &self.append_timeout)
            .field("reconnect", &self.reconnect)
            .field("live_mode", &self.live_mode)
            .field("stall_rewind_seconds", &self.stall_rewind_seconds)
            .field("queue_high_water", &self.queue_high_water)
            .field("record_dir", &self.record_dir)
            .field("metrics_bind_address", &self.metrics_bind_address)
            .field("observability", &self.observability)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            catalog: EndpointCatalog::default(),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            append_timeout: Duration::from_millis(DEFAULT_APPEND_TIMEOUT_MS),
            reconnect: ReconnectPolicy::default(),
            live_mode: true,
            stall_rewind_seconds: DEFAULT_STALL_REWIND_SECONDS,
            queue_high_water: DEFAULT_QUEUE_HIGH_WATER,
            record_dir: PathBuf::from(DEFAULT_RECORD_DIR),
            metrics_bind_address: DEFAULT_METRICS_BIND_ADDRESS.to_string(),
            observability: ObservabilityConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// See [`Config::from_vars`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `STREAM_ENDPOINTS` is unset
    /// and `ConfigError::InvalidValue` for an unparseable catalog,
    /// reconnect mode, or zero timeout.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let raw_endpoints = vars
            .get("STREAM_ENDPOINTS")
            .ok_or_else(|| ConfigError::MissingEnvVar("STREAM_ENDPOINTS".to_string()))?;
        let catalog = EndpointCatalog::parse(raw_endpoints)
            .map_err(|e| ConfigError::InvalidValue(format!("STREAM_ENDPOINTS: {e}")))?;

        let connect_timeout = Duration::from_millis(
            vars.get("STREAM_CONNECT_TIMEOUT_MS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
        );

        let append_timeout = Duration::from_millis(
            vars.get("STREAM_APPEND_TIMEOUT_MS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_APPEND_TIMEOUT_MS),
        );

        if connect_timeout.is_zero() || append_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "timeouts must be greater than zero".to_string(),
            ));
        }

        let reconnect = parse_reconnect(vars)?;

        let live_mode = vars
            .get("STREAM_LIVE_MODE")
            .map_or(true, |s| !matches!(s.trim(), "false" | "0"));

        let stall_rewind_seconds = vars
            .get("STREAM_STALL_REWIND_SECONDS")
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
            .unwrap_or(DEFAULT_STALL_REWIND_SECONDS);

        let queue_high_water = vars
            .get("STREAM_QUEUE_HIGH_WATER")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_QUEUE_HIGH_WATER);

        let record_dir = vars
            .get("STREAM_RECORD_DIR")
            .map_or_else(|| PathBuf::from(DEFAULT_RECORD_DIR), PathBuf::from);

        let metrics_bind_address = vars
            .get("STREAM_METRICS_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_METRICS_BIND_ADDRESS.to_string());

        Ok(Config {
            catalog,
            connect_timeout,
            append_timeout,
            reconnect,
            live_mode,
            stall_rewind_seconds,
            queue_high_water,
            record_dir,
            metrics_bind_address,
            observability: ObservabilityConfig::from_vars(vars),
        })
    }
}

fn parse_reconnect(vars: &HashMap<String, String>) -> Result<ReconnectPolicy, ConfigError> {
    let delay = Duration::from_millis(
        vars.get("STREAM_RECONNECT_DELAY_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RECONNECT_DELAY_MS),
    );
    let max_delay = Duration::from_millis(
        vars.get("STREAM_RECONNECT_MAX_DELAY_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RECONNECT_MAX_DELAY_MS),
    );
    // 0 means unlimited
    let max_attempts = match vars
        .get("STREAM_RECONNECT_MAX_ATTEMPTS")
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(DEFAULT_RECONNECT_MAX_ATTEMPTS)
    {
        0 => None,
        n => Some(n),
    };

    match vars.get("STREAM_RECONNECT").map_or("fixed", |s| s.trim()) {
        "off" | "disabled" | "none" => Ok(ReconnectPolicy::Disabled),
        "fixed" => Ok(ReconnectPolicy::Fixed {
            delay,
            max_attempts,
        }),
        "backoff" => Ok(ReconnectPolicy::Backoff {
            base: delay,
            max: max_delay.max(delay),
            max_attempts,
        }),
        other => Err(ConfigError::InvalidValue(format!(
            "STREAM_RECONNECT must be off, fixed or backoff, got '{other}'"
        ))),
    }
}
