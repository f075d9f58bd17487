//! Recording media sink for session tests.
//!
//! Every sink the factory creates is recorded: its codec, the segments
//! appended to it in order, and whether end-of-stream was signalled.
//!
//! # Append modes
//!
//! - [`AppendMode::Immediate`] - each append reports completion at once
//! - [`AppendMode::Manual`] - appends stay in flight until the test calls
//!   [`RecordingSinkFactory::complete_next`] or
//!   [`RecordingSinkFactory::fail_next`]
//!
//! ```rust,ignore
//! let sinks = RecordingSinkFactory::manual();
//! // ... stream two segments ...
//! assert_eq!(sinks.in_flight(), 1); // second segment is queued
//! sinks.complete_next();
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::types::CameraId;
use segment_protocol::Segment;
use stream_client::errors::SinkError;
use stream_client::sink::{AppendSignals, MediaSink, SinkFactory};

use crate::mock_server::poll_until;

/// When appends report their outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendMode {
    /// Complete during `begin_append`.
    Immediate,
    /// Complete when the test says so.
    Manual,
}

/// What one sink saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkRecord {
    pub camera: CameraId,
    pub codec: String,
    pub generation: u64,
    pub appended: Vec<Segment>,
    pub ended: bool,
}

#[derive(Debug)]
struct RecorderState {
    mode: AppendMode,
    rejected_codecs: Vec<String>,
    /// 1-based append index (across all sinks) that reports failure.
    fail_append_at: Option<usize>,
    appends: usize,
    sinks: Vec<SinkRecord>,
    in_flight: VecDeque<AppendSignals>,
}

/// Creates [`RecordingSink`]s and keeps their records.
///
/// Clones share the same records.
#[derive(Debug, Clone)]
pub struct RecordingSinkFactory {
    state: Arc<Mutex<RecorderState>>,
}

impl Default for RecordingSinkFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingSinkFactory {
    /// Factory whose sinks complete appends immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::with_mode(AppendMode::Immediate)
    }

    /// Factory whose sinks hold appends until completed by the test.
    #[must_use]
    pub fn manual() -> Self {
        Self::with_mode(AppendMode::Manual)
    }

    fn with_mode(mode: AppendMode) -> Self {
        Self {
            state: Arc::new(Mutex::new(RecorderState {
                mode,
                rejected_codecs: Vec::new(),
                fail_append_at: None,
                appends: 0,
                sinks: Vec::new(),
                in_flight: VecDeque::new(),
            })),
        }
    }

    /// Refuse to create sinks for `codec`.
    #[must_use]
    pub fn reject_codec(self, codec: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .rejected_codecs
            .push(codec.to_string());
        self
    }

    /// Report failure for the `n`th append (1-based, across all sinks).
    #[must_use]
    pub fn fail_append_at(self, n: usize) -> Self {
        self.state.lock().unwrap().fail_append_at = Some(n);
        self
    }

    /// Sinks created so far.
    #[must_use]
    pub fn sinks(&self) -> Vec<SinkRecord> {
        self.state.lock().unwrap().sinks.clone()
    }

    /// Number of sinks created so far.
    #[must_use]
    pub fn sinks_created(&self) -> usize {
        self.state.lock().unwrap().sinks.len()
    }

    /// Sequence numbers appended to the sink at `index`, in append order.
    #[must_use]
    pub fn appended_sequences(&self, index: usize) -> Vec<u64> {
        self.state
            .lock()
            .unwrap()
            .sinks
            .get(index)
            .map(|sink| sink.appended.iter().map(|s| s.sequence).collect())
            .unwrap_or_default()
    }

    /// Appends started across all sinks.
    #[must_use]
    pub fn total_appends(&self) -> usize {
        self.state.lock().unwrap().appends
    }

    /// Appends waiting for a manual outcome.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().in_flight.len()
    }

    /// Complete the oldest in-flight append. Returns false if none.
    pub fn complete_next(&self) -> bool {
        let signals = self.state.lock().unwrap().in_flight.pop_front();
        match signals {
            Some(signals) => {
                signals.completed();
                true
            }
            None => false,
        }
    }

    /// Fail the oldest in-flight append. Returns false if none.
    pub fn fail_next(&self, reason: &str) -> bool {
        let signals = self.state.lock().unwrap().in_flight.pop_front();
        match signals {
            Some(signals) => {
                signals.failed(reason);
                true
            }
            None => false,
        }
    }

    /// Poll until `count` appends have started or `timeout` elapses.
    pub async fn wait_for_appends(&self, count: usize, timeout: Duration) -> bool {
        poll_until(timeout, || self.total_appends() >= count).await
    }

    /// Poll until `count` appends are in flight or `timeout` elapses.
    pub async fn wait_for_in_flight(&self, count: usize, timeout: Duration) -> bool {
        poll_until(timeout, || self.in_flight() >= count).await
    }

    /// Poll until `count` sinks exist or `timeout` elapses.
    pub async fn wait_for_sinks(&self, count: usize, timeout: Duration) -> bool {
        poll_until(timeout, || self.sinks_created() >= count).await
    }
}

impl SinkFactory for RecordingSinkFactory {
    fn create(
        &self,
        camera: &CameraId,
        codec: &str,
        signals: AppendSignals,
    ) -> Result<Box<dyn MediaSink>, SinkError> {
        let mut state = self.state.lock().unwrap();
        if state.rejected_codecs.iter().any(|c| c == codec) {
            return Err(SinkError::UnsupportedCodec(codec.to_string()));
        }
        let index = state.sinks.len();
        state.sinks.push(SinkRecord {
            camera: camera.clone(),
            codec: codec.to_string(),
            generation: signals.generation(),
            appended: Vec::new(),
            ended: false,
        });
        Ok(Box::new(RecordingSink {
            index,
            codec: codec.to_string(),
            signals,
            open: true,
            state: Arc::clone(&self.state),
        }))
    }
}

/// Sink that records appends into its factory.
#[derive(Debug)]
pub struct RecordingSink {
    index: usize,
    codec: String,
    signals: AppendSignals,
    open: bool,
    state: Arc<Mutex<RecorderState>>,
}

impl MediaSink for RecordingSink {
    fn codec(&self) -> &str {
        &self.codec
    }

    fn begin_append(&mut self, segment: Segment) -> Result<(), SinkError> {
        if !self.open {
            return Err(SinkError::Ended);
        }
        let mut state = self.state.lock().unwrap();
        state.appends += 1;
        let fail = state.fail_append_at == Some(state.appends);
        if let Some(sink) = state.sinks.get_mut(self.index) {
            sink.appended.push(segment);
        }
        if fail {
            self.signals.failed("simulated decode error");
            return Ok(());
        }
        match state.mode {
            AppendMode::Immediate => self.signals.completed(),
            AppendMode::Manual => state.in_flight.push_back(self.signals.clone()),
        }
        Ok(())
    }

    fn end_of_stream(&mut self) {
        self.open = false;
        if let Some(sink) = self.state.lock().unwrap().sinks.get_mut(self.index) {
            sink.ended = true;
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
