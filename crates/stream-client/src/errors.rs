//! Streaming client error types.
//!
//! Every pipeline, receiver and session operation returns a typed error.
//! Error codes are stable integers the host UI can switch on; internal
//! details (endpoint addresses, sink diagnostics) stay in the logs.

use std::time::Duration;

use segment_protocol::CodecError;
use thiserror::Error;

/// Streaming client error type.
///
/// Maps to host-facing error codes:
/// - Connection errors: `CONNECTION` (1)
/// - Protocol and decode errors: `PROTOCOL` (2)
/// - Sink errors: `SINK` (3)
/// - Append timeout: `TIMEOUT` (4)
/// - Unknown camera / tile: `NOT_FOUND` (5)
/// - Tile already open: `CONFLICT` (6)
/// - Config, Closed, Internal: `INTERNAL` (7)
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// Endpoint unreachable, handshake failure, or transport failure.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Handshake did not complete in time.
    #[error("Connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Peer violated the stream protocol.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Inbound message could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] CodecError),

    /// Media sink rejected an operation.
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// An append was issued but never signalled completion.
    #[error("Append did not complete within {0:?}")]
    AppendTimeout(Duration),

    /// No endpoint is configured for the camera.
    #[error("Unknown camera: {0}")]
    UnknownCamera(String),

    /// A session for the tile is already running.
    #[error("Tile already open: {0}")]
    TileAlreadyOpen(String),

    /// No session for the tile.
    #[error("Tile not found: {0}")]
    TileNotFound(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation on a session or pipeline that has been torn down.
    #[error("Session closed")]
    Closed,

    /// Internal error (actor channels and the like).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Violations of the init-then-segments message order.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A second codec announcement arrived on the same connection.
    #[error("Duplicate init message (active codec {active}, received {received})")]
    DuplicateInit { active: String, received: String },

    /// Media data arrived before the codec was known.
    #[error("Segment received before init message")]
    SegmentBeforeInit,
}

/// Media sink failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    /// Sink could not be created for the codec.
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// Append was rejected up front (bad segment, sink errored).
    #[error("Append rejected: {0}")]
    AppendRejected(String),

    /// Append failed after it was accepted.
    #[error("Append failed: {0}")]
    AppendFailed(String),

    /// Completion signal arrived while no append was in flight.
    #[error("Completion signal without an append in flight")]
    UnexpectedCompletion,

    /// Sink has already reached end of stream.
    #[error("Sink already ended")]
    Ended,
}

/// Media element failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlaybackError {
    /// `play()` was refused (autoplay policy, element detached).
    #[error("Play request rejected: {0}")]
    PlayRejected(String),
}

impl StreamError {
    /// Returns the host-facing error code for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            StreamError::Connection(_) | StreamError::ConnectTimeout(_) => 1, // CONNECTION
            StreamError::Protocol(_) | StreamError::Decode(_) => 2,            // PROTOCOL
            StreamError::Sink(_) => 3,                                         // SINK
            StreamError::AppendTimeout(_) => 4,                                // TIMEOUT
            StreamError::UnknownCamera(_) | StreamError::TileNotFound(_) => 5, // NOT_FOUND
            StreamError::TileAlreadyOpen(_) => 6,                              // CONFLICT
            StreamError::Config(_) | StreamError::Closed | StreamError::Internal(_) => 7, // INTERNAL
        }
    }

    /// Whether a reconnect may recover from this error.
    ///
    /// Only connection-level failures qualify. Protocol, decode, sink and
    /// timeout errors tear the session down for good.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StreamError::Connection(_) | StreamError::ConnectTimeout(_)
        )
    }

    /// Returns a host-safe error message (no internal details).
    #[must_use]
    pub fn host_message(&self) -> String {
        match self {
            StreamError::Connection(_) | StreamError::ConnectTimeout(_) => {
                "Camera stream is unreachable".to_string()
            }
            StreamError::Protocol(_) | StreamError::Decode(_) => {
                "Camera stream sent invalid data".to_string()
            }
            StreamError::Sink(_) | StreamError::AppendTimeout(_) => {
                "Video playback failed".to_string()
            }
            StreamError::UnknownCamera(id) => format!("No stream configured for camera {id}"),
            StreamError::TileNotFound(id) => format!("No stream open for camera {id}"),
            StreamError::TileAlreadyOpen(id) => format!("Stream already open for camera {id}"),
            StreamError::Config(_) | StreamError::Closed | StreamError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }
}
