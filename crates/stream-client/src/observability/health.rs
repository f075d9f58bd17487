//! Health endpoints for the streaming probe.
//!
//! - `GET /health` - Liveness probe (is the process running?)
//! - `GET /ready` - Readiness probe (are tiles streaming?)
//! - `GET /metrics` - Prometheus text format (only when a handle is supplied)
//!
//! Readiness follows the number of tiles that have received an init
//! message on their current connection: ready while at least one tile is
//! streaming.

use axum::{extract::State, http::StatusCode, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Health state for the probe.
#[derive(Debug)]
pub struct HealthState {
    /// Always true after startup; cleared during shutdown.
    live: AtomicBool,
    /// Tiles with an initialized sink.
    streaming_tiles: AtomicUsize,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (live, no streaming tiles).
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            streaming_tiles: AtomicUsize::new(0),
        }
    }

    /// A tile received its init message.
    pub fn tile_streaming(&self) {
        self.streaming_tiles.fetch_add(1, Ordering::SeqCst);
    }

    /// A streaming tile lost its connection or closed.
    pub fn tile_stopped(&self) {
        // Saturate at zero; a tile may stop without having streamed.
        let _ = self
            .streaming_tiles
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Mark the process as shutting down.
    pub fn set_not_live(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    /// Check if the process is live.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Check if at least one tile is streaming.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.is_live() && self.streaming_tiles.load(Ordering::SeqCst) > 0
    }

    /// Tiles currently streaming.
    #[must_use]
    pub fn streaming_tiles(&self) -> usize {
        self.streaming_tiles.load(Ordering::SeqCst)
    }
}

/// Create the health router with liveness and readiness endpoints.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

/// Health router plus `/metrics` rendered from the Prometheus handle.
pub fn observability_router(health_state: Arc<HealthState>, metrics: PrometheusHandle) -> Router {
    let metrics_router = Router::new().route(
        "/metrics",
        get(move || {
            let metrics = metrics.clone();
            async move { metrics.render() }
        }),
    );
    health_router(health_state).merge(metrics_router)
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
