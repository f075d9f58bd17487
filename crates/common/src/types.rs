//! Common data types for Watchtower components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::WatchError;

/// Maximum length of a camera identifier.
pub const MAX_CAMERA_ID_LEN: usize = 64;

/// Identifier of a camera, as used in the endpoint catalog and tile layout.
///
/// Camera IDs are short slugs (`front-door`, `lobby_2`): ASCII alphanumerics,
/// `-` and `_`, at most [`MAX_CAMERA_ID_LEN`] characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CameraId(String);

impl CameraId {
    /// Parse and validate a camera identifier.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::InvalidCameraId` if the identifier is empty, too
    /// long, or contains characters outside `[A-Za-z0-9_-]`.
    pub fn parse(raw: &str) -> Result<Self, WatchError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(WatchError::invalid_camera_id(raw, "must not be empty"));
        }
        if raw.len() > MAX_CAMERA_ID_LEN {
            return Err(WatchError::invalid_camera_id(
                raw,
                format!("exceeds {MAX_CAMERA_ID_LEN} characters"),
            ));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(WatchError::invalid_camera_id(
                raw,
                "allowed characters are A-Z, a-z, 0-9, '-' and '_'",
            ));
        }
        Ok(Self(raw.to_string()))
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CameraId {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CameraId {
    type Error = WatchError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CameraId> for String {
    fn from(id: CameraId) -> Self {
        id.0
    }
}

/// Unique identifier for one streaming session (one connection lifetime of a tile)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Create a new random session ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
