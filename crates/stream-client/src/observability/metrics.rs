//! Metrics definitions for the streaming client.
//!
//! All metrics follow Prometheus naming conventions:
//! - `stream_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `status`: success, error
//! - `kind`: bounded by [`error_kind`] (9 values)
//!
//! Camera IDs are never used as labels; per-tile detail lives in the logs
//! and in `SessionSnapshot`.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

use crate::errors::StreamError;

/// Initialize the Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Append latency: file or decoder writes, usually well under 100ms
        .set_buckets_for_metric(
            Matcher::Prefix("stream_append".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 5.000,
            ],
        )
        .map_err(|e| format!("Failed to set append latency buckets: {e}"))?
        // Connect latency: WebSocket handshake, bounded by the connect timeout
        .set_buckets_for_metric(
            Matcher::Prefix("stream_connect".to_string()),
            &[0.010, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000],
        )
        .map_err(|e| format!("Failed to set connect latency buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Full("stream_queue_depth".to_string()),
            &[0.0, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0],
        )
        .map_err(|e| format!("Failed to set queue depth buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

/// Bounded label for a stream error.
#[must_use]
pub fn error_kind(error: &StreamError) -> &'static str {
    match error {
        StreamError::Connection(_) => "connection",
        StreamError::ConnectTimeout(_) => "connect_timeout",
        StreamError::Protocol(_) => "protocol",
        StreamError::Decode(_) => "decode",
        StreamError::Sink(_) => "sink",
        StreamError::AppendTimeout(_) => "append_timeout",
        StreamError::UnknownCamera(_)
        | StreamError::TileAlreadyOpen(_)
        | StreamError::TileNotFound(_)
        | StreamError::Config(_) => "request",
        StreamError::Closed | StreamError::Internal(_) => "internal",
    }
}

// ============================================================================
// Session Metrics (Gauges)
// ============================================================================

/// Set the number of open tiles.
///
/// Metric: `stream_sessions_active`
/// Labels: none
pub fn set_sessions_active(count: usize) {
    // usize to f64 conversion is safe for realistic tile counts
    #[allow(clippy::cast_precision_loss)]
    gauge!("stream_sessions_active").set(count as f64);
}

// ============================================================================
// Connection Metrics
// ============================================================================

/// Record a connection attempt.
///
/// Metric: `stream_connects_total`, `stream_connect_duration_seconds`
/// Labels: `status` (success, error)
pub fn record_connect(status: &str, duration: Duration) {
    counter!("stream_connects_total", "status" => status.to_string()).increment(1);
    histogram!("stream_connect_duration_seconds", "status" => status.to_string())
        .record(duration.as_secs_f64());
}

/// Record a scheduled reconnect.
///
/// Metric: `stream_reconnects_total`
/// Labels: none
pub fn record_reconnect() {
    counter!("stream_reconnects_total").increment(1);
}

// ============================================================================
// Pipeline Metrics
// ============================================================================

/// Record a media segment arriving from the network.
///
/// Metric: `stream_segments_received_total`
/// Labels: none
pub fn record_segment_received(bytes: usize) {
    counter!("stream_segments_received_total").increment(1);
    counter!("stream_received_bytes_total").increment(bytes as u64);
}

/// Record a completed append and how long the sink took.
///
/// Metric: `stream_segments_appended_total`, `stream_append_duration_seconds`
/// Labels: none
pub fn record_segment_appended(duration: Duration) {
    counter!("stream_segments_appended_total").increment(1);
    histogram!("stream_append_duration_seconds").record(duration.as_secs_f64());
}

/// Record the pending queue depth after a submit.
///
/// Metric: `stream_queue_depth`
/// Labels: none
pub fn record_queue_depth(depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    histogram!("stream_queue_depth").record(depth as f64);
}

/// Record segments discarded by a teardown.
///
/// Metric: `stream_segments_discarded_total`
/// Labels: none
pub fn record_segments_discarded(count: usize) {
    if count > 0 {
        counter!("stream_segments_discarded_total").increment(count as u64);
    }
}

// ============================================================================
// Playback Metrics
// ============================================================================

/// Record a corrected playback stall.
///
/// Metric: `stream_stalls_corrected_total`
/// Labels: none
pub fn record_stall_corrected() {
    counter!("stream_stalls_corrected_total").increment(1);
}

// ============================================================================
// Error Metrics
// ============================================================================

/// Record an error surfaced to the host.
///
/// Metric: `stream_session_errors_total`
/// Labels: `kind`
pub fn record_session_error(error: &StreamError) {
    counter!("stream_session_errors_total", "kind" => error_kind(error)).increment(1);
}
