//! Observability for the streaming client.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `stream_sessions_active` | Gauge | none | Open tiles |
//! | `stream_connects_total` | Counter | `status` | Connection attempts |
//! | `stream_connect_duration_seconds` | Histogram | `status` | Handshake latency |
//! | `stream_reconnects_total` | Counter | none | Scheduled reconnects |
//! | `stream_segments_received_total` | Counter | none | Segments from the network |
//! | `stream_received_bytes_total` | Counter | none | Segment bytes from the network |
//! | `stream_segments_appended_total` | Counter | none | Completed sink appends |
//! | `stream_append_duration_seconds` | Histogram | none | Sink append latency |
//! | `stream_queue_depth` | Histogram | none | Pending queue depth on submit |
//! | `stream_segments_discarded_total` | Counter | none | Segments dropped by teardown |
//! | `stream_stalls_corrected_total` | Counter | none | Playback stall corrections |
//! | `stream_session_errors_total` | Counter | `kind` | Errors surfaced to the host |

pub mod health;
pub mod metrics;

pub use self::health::{health_router, observability_router, HealthState};
pub use self::metrics::init_metrics_recorder;
