//! Errors shared by Watchtower crates.

use thiserror::Error;

/// Validation errors for shared identifiers and settings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatchError {
    /// A camera identifier failed validation.
    #[error("Invalid camera id '{id}': {reason}")]
    InvalidCameraId { id: String, reason: String },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl WatchError {
    pub(crate) fn invalid_camera_id(id: &str, reason: impl Into<String>) -> Self {
        WatchError::InvalidCameraId {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}
