//! Message types for actor communication.
//!
//! Host requests reach actors through `tokio::sync::mpsc` mailboxes;
//! request-reply uses `tokio::sync::oneshot`. Session events flow back to
//! the host on a separate bounded channel.

use std::time::Duration;

use common::types::CameraId;
use tokio::sync::oneshot;

use crate::errors::StreamError;
use crate::pipeline::PipelineStateKind;
use crate::playback::MediaElement;

/// Messages sent to `StreamSession`.
#[derive(Debug)]
pub enum SessionMessage {
    /// The media element reported a pause.
    Paused,

    /// Get a snapshot of the session state.
    GetState {
        /// Response channel for the snapshot.
        respond_to: oneshot::Sender<SessionSnapshot>,
    },

    /// Tear the session down.
    Close { reason: String },
}

/// Notifications from a session to its host.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The stream connection is open.
    Connected,

    /// The init message arrived and the sink is ready.
    Initialized { codec: String },

    /// The connection was lost; a new one will be opened after `delay`.
    Reconnecting { attempt: u32, delay: Duration },

    /// The stream connection ended. Playback freezes on the last frame.
    StreamEnded,

    /// An error the host should surface (reconnect affordance).
    StreamError { error: StreamError },

    /// The session has exited. Always the last event.
    Closed { reason: String },
}

impl SessionEvent {
    /// Returns the event type as a string for logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SessionEvent::Connected => "connected",
            SessionEvent::Initialized { .. } => "initialized",
            SessionEvent::Reconnecting { .. } => "reconnecting",
            SessionEvent::StreamEnded => "stream_ended",
            SessionEvent::StreamError { .. } => "stream_error",
            SessionEvent::Closed { .. } => "closed",
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    /// Tile (camera) the session serves.
    pub tile: CameraId,
    /// Buffer pipeline state.
    pub state: PipelineStateKind,
    /// Whether an append is in flight.
    pub streaming_started: bool,
    /// Segments waiting behind the in-flight append.
    pub queue_len: usize,
    /// Codec of the current connection, `None` until the init message.
    pub codec: Option<String>,
    /// Whether a stream connection is open.
    pub connected: bool,
    /// Segments received over the session's lifetime.
    pub segments_received: u64,
    /// Appends completed over the session's lifetime.
    pub segments_appended: u64,
    /// Playback stalls corrected.
    pub stalls_corrected: u64,
    /// Reconnects scheduled.
    pub reconnects: u64,
}

/// Messages sent to `TileController`.
pub enum ControllerMessage {
    /// Open a tile for a camera.
    OpenTile {
        camera: CameraId,
        /// Endpoint to use instead of the catalog entry.
        endpoint: Option<String>,
        /// Element to drive, `None` for headless tiles.
        element: Option<Box<dyn MediaElement>>,
        /// Response channel for confirmation.
        respond_to: oneshot::Sender<Result<(), StreamError>>,
    },

    /// Close a tile.
    CloseTile {
        camera: CameraId,
        reason: String,
        /// Response channel for confirmation.
        respond_to: oneshot::Sender<Result<(), StreamError>>,
    },

    /// Forward a pause observation to a tile's session.
    TilePaused {
        camera: CameraId,
        /// Response channel for confirmation.
        respond_to: oneshot::Sender<Result<(), StreamError>>,
    },

    /// Snapshot a tile's session.
    GetTileState {
        camera: CameraId,
        /// Response channel for the snapshot.
        respond_to: oneshot::Sender<Result<SessionSnapshot, StreamError>>,
    },

    /// List open tiles.
    ListTiles {
        /// Response channel for the camera list (sorted).
        respond_to: oneshot::Sender<Vec<CameraId>>,
    },

    /// Close every tile and stop.
    Shutdown {
        /// How long to wait for sessions to exit.
        deadline: Duration,
        /// Response channel for confirmation.
        respond_to: oneshot::Sender<Result<(), StreamError>>,
    },
}

impl std::fmt::Debug for ControllerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerMessage::OpenTile {
                camera, element, ..
            } => f
                .debug_struct("OpenTile")
                .field("camera", camera)
                .field("has_element", &element.is_some())
                .finish_non_exhaustive(),
            ControllerMessage::CloseTile { camera, reason, .. } => f
                .debug_struct("CloseTile")
                .field("camera", camera)
                .field("reason", reason)
                .finish_non_exhaustive(),
            ControllerMessage::TilePaused { camera, .. } => f
                .debug_struct("TilePaused")
                .field("camera", camera)
                .finish_non_exhaustive(),
            ControllerMessage::GetTileState { camera, .. } => f
                .debug_struct("GetTileState")
                .field("camera", camera)
                .finish_non_exhaustive(),
            ControllerMessage::ListTiles { .. } => f.debug_struct("ListTiles").finish_non_exhaustive(),
            ControllerMessage::Shutdown { deadline, .. } => f
                .debug_struct("Shutdown")
                .field("deadline", deadline)
                .finish_non_exhaustive(),
        }
    }
}

/// A session event tagged with its tile, as delivered by `TileController`.
#[derive(Debug, Clone)]
pub struct TileEvent {
    pub camera: CameraId,
    pub event: SessionEvent,
}
