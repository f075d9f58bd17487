//! Endpoint catalog: which stream endpoint serves which camera.
//!
//! Parsed from a comma separated list of `camera=url` pairs:
//!
//! ```text
//! front-door=ws://nvr.local:8080/stream/1,lobby=wss://nvr.local/stream/2?token=abc
//! ```
//!
//! Endpoint URLs may carry access tokens, so `Debug` only lists camera IDs.

use std::collections::BTreeMap;
use std::fmt;

use common::error::WatchError;
use common::types::CameraId;
use tokio_tungstenite::tungstenite::http::Uri;

/// Camera to endpoint mapping.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct EndpointCatalog {
    endpoints: BTreeMap<CameraId, String>,
}

impl fmt::Debug for EndpointCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointCatalog")
            .field("cameras", &self.endpoints.keys().collect::<Vec<_>>())
            .field("endpoints", &"[REDACTED]")
            .finish()
    }
}

impl EndpointCatalog {
    /// Parse `camera=url[,camera=url...]`. Blank input gives an empty catalog.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::InvalidCameraId` for a bad camera ID and
    /// `WatchError::Configuration` for malformed entries, non-WebSocket URLs
    /// or duplicate cameras.
    pub fn parse(raw: &str) -> Result<Self, WatchError> {
        let mut catalog = Self::default();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (camera, url) = entry.split_once('=').ok_or_else(|| {
                WatchError::Configuration(format!("expected camera=url, got '{entry}'"))
            })?;
            catalog.insert(CameraId::parse(camera)?, url.trim())?;
        }
        Ok(catalog)
    }

    /// Add an endpoint.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::Configuration` if the URL is not a `ws`/`wss`
    /// URL with a host, or the camera is already present.
    pub fn insert(&mut self, camera: CameraId, url: &str) -> Result<(), WatchError> {
        validate_endpoint(url)?;
        if self.endpoints.contains_key(&camera) {
            return Err(WatchError::Configuration(format!(
                "duplicate endpoint for camera {camera}"
            )));
        }
        self.endpoints.insert(camera, url.to_string());
        Ok(())
    }

    /// Endpoint for a camera.
    #[must_use]
    pub fn endpoint(&self, camera: &CameraId) -> Option<&str> {
        self.endpoints.get(camera).map(String::as_str)
    }

    /// Cameras in the catalog, sorted.
    pub fn cameras(&self) -> impl Iterator<Item = &CameraId> {
        self.endpoints.keys()
    }

    /// Number of cameras.
    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Check that `url` is a WebSocket URL with a host.
///
/// # Errors
///
/// Returns `WatchError::Configuration` describing the problem.
pub fn validate_endpoint(url: &str) -> Result<(), WatchError> {
    let uri: Uri = url
        .parse()
        .map_err(|e| WatchError::Configuration(format!("invalid endpoint URL: {e}")))?;

    match uri.scheme_str() {
        Some("ws" | "wss") => {}
        Some(other) => {
            return Err(WatchError::Configuration(format!(
                "endpoint scheme must be ws or wss, got {other}"
            )))
        }
        None => {
            return Err(WatchError::Configuration(
                "endpoint URL has no scheme".to_string(),
            ))
        }
    }

    if uri.host().map_or(true, str::is_empty) {
        return Err(WatchError::Configuration(
            "endpoint URL has no host".to_string(),
        ));
    }
    Ok(())
}
