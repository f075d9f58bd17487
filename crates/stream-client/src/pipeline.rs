//! Buffer pipeline: the single-writer queue between the network and the sink.
//!
//! ```text
//!                  initialize(codec)            submit(seg)
//!  Uninitialized ───────────────────▶ Idle ────────────────▶ Appending ──┐
//!                                       ▲     append seg       │  ▲      │ submit(seg):
//!                                       │                      │  │      │ push to queue
//!                                       └──────────────────────┘  └──────┘
//!                                  completion,           completion, queue non-empty:
//!                                  queue empty           append head of queue
//!
//!  close() from any state ──▶ Closed
//! ```
//!
//! Invariants:
//! - at most one append is outstanding on the sink;
//! - segments reach the sink in arrival order;
//! - a segment is only ever dropped by `close()` / `reset()`.
//!
//! The pipeline is synchronous and runtime-free. Append completion is fed
//! back in by the owner (the session actor) through
//! [`BufferPipeline::on_append_complete`] and [`BufferPipeline::on_append_error`].
//!
//! Protocol errors leave the state untouched so the owner can decide how
//! to tear down. Sink errors close the pipeline immediately: the sink is
//! unusable once an append has failed.

use std::collections::VecDeque;
use std::sync::Arc;

use common::types::CameraId;
use segment_protocol::Segment;
use tracing::{debug, trace, warn};

use crate::errors::{ProtocolError, SinkError, StreamError};
use crate::sink::{AppendSignals, MediaSink, SinkFactory};

/// Observable pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStateKind {
    /// No codec yet, no sink.
    Uninitialized,
    /// Sink open, nothing in flight.
    Idle,
    /// One append in flight, zero or more segments queued.
    Appending,
    /// Torn down.
    Closed,
}

impl PipelineStateKind {
    /// Returns the state as a string for logs and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            PipelineStateKind::Uninitialized => "uninitialized",
            PipelineStateKind::Idle => "idle",
            PipelineStateKind::Appending => "appending",
            PipelineStateKind::Closed => "closed",
        }
    }
}

/// Result of a successful `submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Pipeline was idle; the segment went straight to the sink.
    AppendedImmediately,
    /// An append is in flight; the segment waits at queue position `depth`.
    Queued { depth: usize },
}

/// Result of a successful append completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The next queued segment was appended.
    AppendedNext { remaining: usize },
    /// Queue was empty; pipeline is idle again.
    Drained,
}

enum PipelineState {
    Uninitialized,
    Idle {
        sink: Box<dyn MediaSink>,
    },
    Appending {
        sink: Box<dyn MediaSink>,
        queue: VecDeque<Segment>,
    },
    Closed,
}

impl PipelineState {
    fn kind(&self) -> PipelineStateKind {
        match self {
            PipelineState::Uninitialized => PipelineStateKind::Uninitialized,
            PipelineState::Idle { .. } => PipelineStateKind::Idle,
            PipelineState::Appending { .. } => PipelineStateKind::Appending,
            PipelineState::Closed => PipelineStateKind::Closed,
        }
    }
}

/// Per-session segment queue and sink owner.
pub struct BufferPipeline {
    camera: CameraId,
    state: PipelineState,
    factory: Arc<dyn SinkFactory>,
    signals: AppendSignals,
    codec: Option<String>,
    queue_high_water: usize,
    above_high_water: bool,
    segments_appended: u64,
}

impl std::fmt::Debug for BufferPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPipeline")
            .field("camera", &self.camera)
            .field("state", &self.state.kind())
            .field("codec", &self.codec)
            .field("queue_len", &self.queue_len())
            .field("generation", &self.signals.generation())
            .finish_non_exhaustive()
    }
}

impl BufferPipeline {
    /// Create an uninitialized pipeline.
    ///
    /// `queue_high_water` only controls when a backlog warning is logged;
    /// segments are never dropped. `0` disables the warning.
    #[must_use]
    pub fn new(
        camera: CameraId,
        factory: Arc<dyn SinkFactory>,
        signals: AppendSignals,
        queue_high_water: usize,
    ) -> Self {
        Self {
            camera,
            state: PipelineState::Uninitialized,
            factory,
            signals,
            codec: None,
            queue_high_water,
            above_high_water: false,
            segments_appended: 0,
        }
    }

    /// Open the sink for `codec`. Uninitialized -> Idle.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::DuplicateInit` if a codec is already active
    /// - `StreamError::Sink` if the sink cannot be created (pipeline closes)
    /// - `StreamError::Closed` after teardown
    pub fn initialize(&mut self, codec: &str) -> Result<(), StreamError> {
        match &self.state {
            PipelineState::Uninitialized => {}
            PipelineState::Idle { .. } | PipelineState::Appending { .. } => {
                return Err(ProtocolError::DuplicateInit {
                    active: self.codec.clone().unwrap_or_default(),
                    received: codec.to_string(),
                }
                .into());
            }
            PipelineState::Closed => return Err(StreamError::Closed),
        }

        match self
            .factory
            .create(&self.camera, codec, self.signals.clone())
        {
            Ok(sink) => {
                debug!(
                    target: "stream.pipeline",
                    camera = %self.camera,
                    codec = %codec,
                    generation = self.signals.generation(),
                    "Sink created"
                );
                self.codec = Some(codec.to_string());
                self.state = PipelineState::Idle { sink };
                Ok(())
            }
            Err(e) => {
                self.state = PipelineState::Closed;
                Err(e.into())
            }
        }
    }

    /// Hand a segment to the pipeline.
    ///
    /// Idle: appended immediately (fast path). Appending: queued behind the
    /// in-flight append.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::SegmentBeforeInit` while uninitialized (nothing is appended)
    /// - `StreamError::Sink` if the sink rejects the append (pipeline closes)
    /// - `StreamError::Closed` after teardown
    pub fn submit(&mut self, segment: Segment) -> Result<SubmitOutcome, StreamError> {
        let state = std::mem::replace(&mut self.state, PipelineState::Closed);
        let (next, result) = match state {
            PipelineState::Uninitialized => (
                PipelineState::Uninitialized,
                Err(ProtocolError::SegmentBeforeInit.into()),
            ),
            PipelineState::Closed => (PipelineState::Closed, Err(StreamError::Closed)),
            PipelineState::Idle { mut sink } => {
                trace!(
                    target: "stream.pipeline",
                    camera = %self.camera,
                    sequence = segment.sequence,
                    bytes = segment.len(),
                    "Appending segment (idle fast path)"
                );
                match sink.begin_append(segment) {
                    Ok(()) => (
                        PipelineState::Appending {
                            sink,
                            queue: VecDeque::new(),
                        },
                        Ok(SubmitOutcome::AppendedImmediately),
                    ),
                    Err(e) => Self::fail(sink, e),
                }
            }
            PipelineState::Appending { sink, mut queue } => {
                queue.push_back(segment);
                let depth = queue.len();
                self.track_backlog(depth);
                (
                    PipelineState::Appending { sink, queue },
                    Ok(SubmitOutcome::Queued { depth }),
                )
            }
        };
        self.state = next;
        result
    }

    /// The sink finished the in-flight append.
    ///
    /// # Errors
    ///
    /// - `SinkError::UnexpectedCompletion` if nothing was in flight
    /// - `StreamError::Sink` if appending the next segment fails (pipeline closes)
    /// - `StreamError::Closed` after teardown
    pub fn on_append_complete(&mut self) -> Result<CompletionOutcome, StreamError> {
        let state = std::mem::replace(&mut self.state, PipelineState::Closed);
        let (next, result) = match state {
            PipelineState::Appending {
                mut sink,
                mut queue,
            } => {
                self.segments_appended += 1;
                match queue.pop_front() {
                    Some(segment) => {
                        let remaining = queue.len();
                        self.track_backlog(remaining);
                        trace!(
                            target: "stream.pipeline",
                            camera = %self.camera,
                            sequence = segment.sequence,
                            remaining,
                            "Appending queued segment"
                        );
                        match sink.begin_append(segment) {
                            Ok(()) => (
                                PipelineState::Appending { sink, queue },
                                Ok(CompletionOutcome::AppendedNext { remaining }),
                            ),
                            Err(e) => Self::fail(sink, e),
                        }
                    }
                    None => (PipelineState::Idle { sink }, Ok(CompletionOutcome::Drained)),
                }
            }
            PipelineState::Closed => (PipelineState::Closed, Err(StreamError::Closed)),
            other => (other, Err(SinkError::UnexpectedCompletion.into())),
        };
        self.state = next;
        result
    }

    /// The sink reported that the in-flight append failed.
    ///
    /// The pipeline closes; the failed segment is not retried. Returns the
    /// error to surface to the host.
    pub fn on_append_error(&mut self, reason: &str) -> StreamError {
        warn!(
            target: "stream.pipeline",
            camera = %self.camera,
            state = self.state.kind().as_str(),
            reason = %reason,
            "Sink append failed"
        );
        self.close();
        SinkError::AppendFailed(reason.to_string()).into()
    }

    /// Tear down: end the sink if still open and discard queued segments.
    ///
    /// Idempotent. Returns the number of discarded segments.
    pub fn close(&mut self) -> usize {
        let state = std::mem::replace(&mut self.state, PipelineState::Closed);
        let discarded = match state {
            PipelineState::Idle { mut sink } => {
                Self::end_sink(sink.as_mut());
                0
            }
            PipelineState::Appending { mut sink, queue } => {
                Self::end_sink(sink.as_mut());
                queue.len()
            }
            PipelineState::Uninitialized | PipelineState::Closed => 0,
        };
        self.above_high_water = false;

        if discarded > 0 {
            debug!(
                target: "stream.pipeline",
                camera = %self.camera,
                discarded,
                "Discarded queued segments on close"
            );
        }
        discarded
    }

    /// Close and start over for a new connection.
    ///
    /// The next sink is created with a new signal generation, so late
    /// signals from the old sink can be recognised and ignored.
    pub fn reset(&mut self) -> usize {
        let discarded = self.close();
        self.signals = self.signals.next_generation();
        self.codec = None;
        self.state = PipelineState::Uninitialized;
        discarded
    }

    /// Current state.
    #[must_use]
    pub fn state_kind(&self) -> PipelineStateKind {
        self.state.kind()
    }

    /// Whether an append is in flight (the fast path has been taken and the
    /// queue not yet drained).
    #[must_use]
    pub fn streaming_started(&self) -> bool {
        matches!(self.state, PipelineState::Appending { .. })
    }

    /// Segments waiting behind the in-flight append.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        match &self.state {
            PipelineState::Appending { queue, .. } => queue.len(),
            _ => 0,
        }
    }

    /// Active codec, `None` until the init message arrives.
    #[must_use]
    pub fn codec(&self) -> Option<&str> {
        self.codec.as_deref()
    }

    /// Appends that completed successfully over the pipeline's lifetime.
    #[must_use]
    pub fn segments_appended(&self) -> u64 {
        self.segments_appended
    }

    /// Signal generation the current (or next) sink reports with.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.signals.generation()
    }

    fn fail<T>(
        mut sink: Box<dyn MediaSink>,
        error: SinkError,
    ) -> (PipelineState, Result<T, StreamError>) {
        Self::end_sink(sink.as_mut());
        (PipelineState::Closed, Err(error.into()))
    }

    fn end_sink(sink: &mut dyn MediaSink) {
        if sink.is_open() {
            sink.end_of_stream();
        }
    }

    fn track_backlog(&mut self, depth: usize) {
        if self.queue_high_water == 0 {
            return;
        }
        if depth >= self.queue_high_water && !self.above_high_water {
            self.above_high_water = true;
            warn!(
                target: "stream.pipeline",
                camera = %self.camera,
                depth,
                threshold = self.queue_high_water,
                "Segment backlog above high-water mark"
            );
        } else if depth < self.queue_high_water / 2 && self.above_high_water {
            self.above_high_water = false;
            debug!(
                target: "stream.pipeline",
                camera = %self.camera,
                depth,
                "Segment backlog recovered"
            );
        }
    }
}
