//! Media sink abstraction.
//!
//! A sink is the single-writer, append-only playback buffer a session
//! feeds. Appends are asynchronous: [`MediaSink::begin_append`] only starts
//! the operation, and the sink reports the outcome later through the
//! [`AppendSignals`] it was created with. The buffer pipeline guarantees at
//! most one append is in flight per sink.

pub mod file;

use common::types::CameraId;
use segment_protocol::Segment;
use tokio::sync::mpsc;

use crate::errors::SinkError;

pub use file::{FileSink, FileSinkFactory};

/// Outcome of one append, reported by the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The segment is buffered; the sink accepts the next append.
    Completed,
    /// The append failed after it was accepted.
    Failed(String),
}

/// A tagged append outcome.
///
/// `generation` identifies the sink that produced the signal so that
/// signals from a sink torn down on reconnect can be discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendSignal {
    pub generation: u64,
    pub outcome: AppendOutcome,
}

/// Sending half handed to a sink at creation.
#[derive(Debug, Clone)]
pub struct AppendSignals {
    generation: u64,
    sender: mpsc::UnboundedSender<AppendSignal>,
}

impl AppendSignals {
    /// Create a signal channel for sinks of the given generation.
    #[must_use]
    pub fn channel(generation: u64) -> (Self, mpsc::UnboundedReceiver<AppendSignal>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { generation, sender }, receiver)
    }

    /// Same channel, next sink generation.
    #[must_use]
    pub fn next_generation(&self) -> Self {
        Self {
            generation: self.generation + 1,
            sender: self.sender.clone(),
        }
    }

    /// Generation this sender tags signals with.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report a completed append.
    pub fn completed(&self) {
        self.send(AppendOutcome::Completed);
    }

    /// Report a failed append.
    pub fn failed(&self, reason: impl Into<String>) {
        self.send(AppendOutcome::Failed(reason.into()));
    }

    fn send(&self, outcome: AppendOutcome) {
        // Receiver gone means the session has exited; nothing to report to.
        let _ = self.sender.send(AppendSignal {
            generation: self.generation,
            outcome,
        });
    }
}

/// Append-only playback buffer bound to one codec.
pub trait MediaSink: Send {
    /// Codec the sink was opened with.
    fn codec(&self) -> &str;

    /// Start appending a segment. Completion is reported via [`AppendSignals`].
    ///
    /// # Errors
    ///
    /// Returns a `SinkError` if the sink rejects the segment synchronously.
    fn begin_append(&mut self, segment: Segment) -> Result<(), SinkError>;

    /// Mark the end of the stream. Further appends are rejected.
    fn end_of_stream(&mut self);

    /// Whether the sink still accepts appends.
    fn is_open(&self) -> bool;
}

/// Creates sinks once the codec of a session is known.
pub trait SinkFactory: Send + Sync {
    /// Create a sink for `camera` that plays `codec`.
    ///
    /// # Errors
    ///
    /// Returns `SinkError::UnsupportedCodec` if the codec cannot be played.
    fn create(
        &self,
        camera: &CameraId,
        codec: &str,
        signals: AppendSignals,
    ) -> Result<Box<dyn MediaSink>, SinkError>;
}
