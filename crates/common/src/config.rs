//! Common configuration types for Watchtower components.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default `tracing` filter directive when none is configured.
pub const DEFAULT_LOG_FILTER: &str = "stream_client=debug";

/// Observability configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// `EnvFilter` directive (e.g. `stream_client=debug,tokio_tungstenite=info`)
    pub log_filter: String,
    /// Enable JSON-formatted logs
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            json_logs: false,
        }
    }
}

impl ObservabilityConfig {
    /// Load observability settings from a variable map.
    ///
    /// Reads `RUST_LOG` for the filter and `STREAM_LOG_JSON` (`true`/`1`)
    /// for the output format.
    #[must_use]
    pub fn from_vars(vars: &HashMap<String, String>) -> Self {
        let log_filter = vars
            .get("RUST_LOG")
            .filter(|s| !s.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        let json_logs = vars
            .get("STREAM_LOG_JSON")
            .is_some_and(|s| matches!(s.trim(), "true" | "1"));

        Self {
            log_filter,
            json_logs,
        }
    }
}
