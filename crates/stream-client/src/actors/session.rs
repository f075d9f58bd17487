//! `StreamSession` - per-tile streaming actor.
//!
//! Each `StreamSession`:
//! - Owns one stream connection at a time (via a [`Connector`])
//! - Owns the tile's [`BufferPipeline`] and, when the host supplies an
//!   element, its [`PlaybackDriver`]
//! - Reports connection and error transitions to the host as [`SessionEvent`]s
//!
//! # Lifecycle
//!
//! 1. Spawned by `TileController` (or directly by a host) and connects
//! 2. Feeds init and segment messages into the pipeline
//! 3. On connection loss, consults the reconnect policy: the pipeline is
//!    reset and the next connection must send a fresh init message
//! 4. Exits on close, cancellation, a fatal error, or when reconnects give up
//!
//! The last event a session emits is always `SessionEvent::Closed`.

use std::sync::Arc;
use std::time::Duration;

use common::types::{CameraId, SessionId};
use futures::future::{BoxFuture, FutureExt};
use segment_protocol::StreamMessage;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{Config, ReconnectPolicy, DEFAULT_APPEND_TIMEOUT_MS, DEFAULT_QUEUE_HIGH_WATER};
use crate::errors::StreamError;
use crate::observability::metrics as stream_metrics;
use crate::pipeline::{BufferPipeline, CompletionOutcome, SubmitOutcome};
use crate::playback::{MediaElement, PlaybackDriver, StallCheck, DEFAULT_STALL_REWIND_SECONDS};
use crate::receiver::{Connector, SegmentSource};
use crate::sink::{AppendOutcome, AppendSignal, AppendSignals, SinkFactory};

use super::messages::{SessionEvent, SessionMessage, SessionSnapshot};

/// Default channel buffer size for the session mailbox.
const SESSION_CHANNEL_BUFFER: usize = 32;

/// Default channel buffer size for host-bound session events.
const EVENT_CHANNEL_BUFFER: usize = 64;

/// Per-session tunables, usually derived from [`Config`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// Maximum time an append may stay in flight.
    pub append_timeout: Duration,
    /// What to do when the connection drops.
    pub reconnect: ReconnectPolicy,
    /// Apply stall correction on pause.
    pub live_mode: bool,
    /// Rewind applied by stall correction, in seconds.
    pub stall_rewind_seconds: f64,
    /// Queue depth that triggers a backlog warning.
    pub queue_high_water: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            append_timeout: Duration::from_millis(DEFAULT_APPEND_TIMEOUT_MS),
            reconnect: ReconnectPolicy::default(),
            live_mode: true,
            stall_rewind_seconds: DEFAULT_STALL_REWIND_SECONDS,
            queue_high_water: DEFAULT_QUEUE_HIGH_WATER,
        }
    }
}

impl SessionSettings {
    /// Settings from the loaded configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            append_timeout: config.append_timeout,
            reconnect: config.reconnect,
            live_mode: config.live_mode,
            stall_rewind_seconds: config.stall_rewind_seconds,
            queue_high_water: config.queue_high_water,
        }
    }
}

/// Handle to a `StreamSession`.
#[derive(Clone, Debug)]
pub struct StreamSessionHandle {
    sender: mpsc::Sender<SessionMessage>,
    cancel_token: CancellationToken,
    tile: CameraId,
    session_id: SessionId,
}

impl StreamSessionHandle {
    /// Get the tile (camera) this session serves.
    #[must_use]
    pub fn tile(&self) -> &CameraId {
        &self.tile
    }

    /// Get the session ID.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Report that the media element paused.
    pub async fn notify_paused(&self) -> Result<(), StreamError> {
        self.sender
            .send(SessionMessage::Paused)
            .await
            .map_err(|e| StreamError::Internal(format!("channel send failed: {e}")))
    }

    /// Get a snapshot of the session state.
    pub async fn get_state(&self) -> Result<SessionSnapshot, StreamError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionMessage::GetState { respond_to: tx })
            .await
            .map_err(|e| StreamError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| StreamError::Internal(format!("response receive failed: {e}")))
    }

    /// Close the session.
    pub async fn close(&self, reason: String) -> Result<(), StreamError> {
        self.sender
            .send(SessionMessage::Close { reason })
            .await
            .map_err(|e| StreamError::Internal(format!("channel send failed: {e}")))
    }

    /// Cancel the session actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

type ConnectFuture = BoxFuture<'static, (Result<Box<dyn SegmentSource>, StreamError>, Duration)>;

/// Connection state.
enum Link {
    /// Handshake in progress.
    Connecting(ConnectFuture),
    /// Receiving messages.
    Connected(Box<dyn SegmentSource>),
    /// Waiting out a reconnect delay.
    Waiting { retry_at: Instant },
    /// No connection and none pending.
    Down,
}

enum LinkEvent {
    ConnectFinished {
        result: Result<Box<dyn SegmentSource>, StreamError>,
        elapsed: Duration,
    },
    Inbound(Option<Result<StreamMessage, StreamError>>),
    RetryDue,
}

/// Next event from the current link state. Pending forever when down.
async fn link_event(link: &mut Link) -> LinkEvent {
    match link {
        Link::Connecting(connect) => {
            let (result, elapsed) = connect.await;
            LinkEvent::ConnectFinished { result, elapsed }
        }
        Link::Connected(source) => LinkEvent::Inbound(source.next_message().await),
        Link::Waiting { retry_at } => {
            tokio::time::sleep_until(*retry_at).await;
            LinkEvent::RetryDue
        }
        Link::Down => std::future::pending().await,
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// The `StreamSession` implementation.
pub struct StreamSession {
    /// Tile (camera) served.
    tile: CameraId,
    /// Session ID, for log correlation.
    session_id: SessionId,
    /// Stream endpoint. May carry credentials; never logged.
    endpoint: String,
    settings: SessionSettings,
    connector: Arc<dyn Connector>,
    /// Message receiver.
    receiver: mpsc::Receiver<SessionMessage>,
    /// Host-bound events.
    events: mpsc::Sender<SessionEvent>,
    /// Cancellation token (child of the controller's token).
    cancel_token: CancellationToken,
    pipeline: BufferPipeline,
    append_signals: mpsc::UnboundedReceiver<AppendSignal>,
    playback: Option<PlaybackDriver>,
    link: Link,
    /// Armed while an append is in flight.
    append_deadline: Option<Instant>,
    append_started: Option<Instant>,
    /// Consecutive reconnect attempts; reset by a successful init.
    reconnect_attempt: u32,
    segments_received: u64,
    reconnects: u64,
    is_closing: bool,
}

impl StreamSession {
    /// Spawn a new session actor.
    ///
    /// Returns a handle, the host event receiver and the task join handle.
    /// `element` is `None` for headless tiles (recording, probing).
    pub fn spawn(
        tile: CameraId,
        endpoint: String,
        settings: SessionSettings,
        connector: Arc<dyn Connector>,
        sink_factory: Arc<dyn SinkFactory>,
        element: Option<Box<dyn MediaElement>>,
        cancel_token: CancellationToken,
    ) -> (
        StreamSessionHandle,
        mpsc::Receiver<SessionEvent>,
        JoinHandle<()>,
    ) {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        let (signals, append_signals) = AppendSignals::channel(0);
        let session_id = SessionId::new();

        let pipeline = BufferPipeline::new(
            tile.clone(),
            sink_factory,
            signals,
            settings.queue_high_water,
        );
        let playback = element.map(|element| {
            PlaybackDriver::new(
                tile.clone(),
                element,
                settings.live_mode,
                settings.stall_rewind_seconds,
            )
        });

        let actor = Self {
            tile: tile.clone(),
            session_id,
            endpoint,
            settings,
            connector,
            receiver,
            events: event_tx,
            cancel_token: cancel_token.clone(),
            pipeline,
            append_signals,
            playback,
            link: Link::Down,
            append_deadline: None,
            append_started: None,
            reconnect_attempt: 0,
            segments_received: 0,
            reconnects: 0,
            is_closing: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = StreamSessionHandle {
            sender,
            cancel_token,
            tile,
            session_id,
        };

        (handle, event_rx, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "stream.session",
        fields(camera = %self.tile, session_id = %self.session_id)
    )]
    async fn run(mut self) {
        info!(
            target: "stream.session",
            camera = %self.tile,
            session_id = %self.session_id,
            live_mode = self.settings.live_mode,
            headless = self.playback.is_none(),
            "StreamSession started"
        );

        self.begin_connect();

        let reason = loop {
            tokio::select! {
                // Handle cancellation
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "stream.session",
                        camera = %self.tile,
                        "StreamSession received cancellation signal"
                    );
                    break "cancelled".to_string();
                }

                // Handle host messages
                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            if let Some(reason) = self.handle_message(message) {
                                break reason;
                            }
                        }
                        None => {
                            debug!(
                                target: "stream.session",
                                camera = %self.tile,
                                "StreamSession channel closed, exiting"
                            );
                            break "handle dropped".to_string();
                        }
                    }
                }

                // Sink append outcomes
                Some(signal) = self.append_signals.recv() => {
                    if let Some(reason) = self.handle_append_signal(signal) {
                        break reason;
                    }
                }

                // Connection progress and inbound messages
                event = link_event(&mut self.link) => {
                    if let Some(reason) = self.handle_link_event(event).await {
                        break reason;
                    }
                }

                // In-flight append never completed
                () = deadline_elapsed(self.append_deadline) => {
                    break self.fail(StreamError::AppendTimeout(self.settings.append_timeout));
                }
            }
        };

        self.teardown().await;

        info!(
            target: "stream.session",
            camera = %self.tile,
            session_id = %self.session_id,
            reason = %reason,
            segments_received = self.segments_received,
            segments_appended = self.pipeline.segments_appended(),
            reconnects = self.reconnects,
            "StreamSession stopped"
        );

        self.emit(SessionEvent::Closed { reason });
    }

    /// Handle a host message. Returns the exit reason if the actor should stop.
    fn handle_message(&mut self, message: SessionMessage) -> Option<String> {
        match message {
            SessionMessage::Paused => {
                self.handle_paused();
                None
            }

            SessionMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.snapshot());
                None
            }

            SessionMessage::Close { reason } => {
                debug!(
                    target: "stream.session",
                    camera = %self.tile,
                    reason = %reason,
                    "Close requested"
                );
                Some(reason)
            }
        }
    }

    fn handle_paused(&mut self) {
        let Some(driver) = self.playback.as_mut() else {
            debug!(
                target: "stream.session",
                camera = %self.tile,
                "Pause reported for headless session, ignoring"
            );
            return;
        };

        match driver.on_paused() {
            Ok(StallCheck::Corrected { .. }) => stream_metrics::record_stall_corrected(),
            Ok(check) => {
                debug!(
                    target: "stream.session",
                    camera = %self.tile,
                    check = ?check,
                    "Pause is not a stall"
                );
            }
            Err(e) => {
                // Local condition; the next pause retries.
                warn!(
                    target: "stream.session",
                    camera = %self.tile,
                    error = %e,
                    "Stall correction could not resume playback"
                );
            }
        }
    }

    async fn handle_link_event(&mut self, event: LinkEvent) -> Option<String> {
        match event {
            LinkEvent::ConnectFinished {
                result: Ok(source),
                elapsed,
            } => {
                stream_metrics::record_connect("success", elapsed);
                info!(
                    target: "stream.session",
                    camera = %self.tile,
                    elapsed_ms = elapsed.as_millis(),
                    attempt = self.reconnect_attempt,
                    "Stream connected"
                );
                self.link = Link::Connected(source);
                self.emit(SessionEvent::Connected);
                None
            }

            LinkEvent::ConnectFinished {
                result: Err(error),
                elapsed,
            } => {
                stream_metrics::record_connect("error", elapsed);
                warn!(
                    target: "stream.session",
                    camera = %self.tile,
                    error = %error,
                    "Stream connection failed"
                );
                self.link = Link::Down;
                self.connection_lost(Some(error)).await
            }

            LinkEvent::Inbound(Some(Ok(message))) => self.handle_stream_message(message),

            LinkEvent::Inbound(Some(Err(error))) if error.is_retryable() => {
                warn!(
                    target: "stream.session",
                    camera = %self.tile,
                    error = %error,
                    "Stream connection lost"
                );
                self.connection_lost(Some(error)).await
            }

            LinkEvent::Inbound(Some(Err(error))) => Some(self.fail(error)),

            LinkEvent::Inbound(None) => {
                info!(
                    target: "stream.session",
                    camera = %self.tile,
                    "Stream closed by peer"
                );
                self.connection_lost(None).await
            }

            LinkEvent::RetryDue => {
                self.begin_connect();
                None
            }
        }
    }

    fn handle_stream_message(&mut self, message: StreamMessage) -> Option<String> {
        match message {
            StreamMessage::Init(init) => match self.pipeline.initialize(&init.codec) {
                Ok(()) => {
                    self.reconnect_attempt = 0;
                    if let Some(driver) = self.playback.as_mut() {
                        driver.on_sink_ready(&init.codec);
                    }
                    info!(
                        target: "stream.session",
                        camera = %self.tile,
                        codec = %init.codec,
                        "Stream initialized"
                    );
                    self.emit(SessionEvent::Initialized { codec: init.codec });
                    None
                }
                Err(error) => Some(self.fail(error)),
            },

            StreamMessage::Segment(segment) => {
                self.segments_received += 1;
                stream_metrics::record_segment_received(segment.len());

                match self.pipeline.submit(segment) {
                    Ok(SubmitOutcome::AppendedImmediately) => {
                        self.arm_append_deadline();
                        None
                    }
                    Ok(SubmitOutcome::Queued { depth }) => {
                        stream_metrics::record_queue_depth(depth);
                        None
                    }
                    Err(error) => Some(self.fail(error)),
                }
            }
        }
    }

    fn handle_append_signal(&mut self, signal: AppendSignal) -> Option<String> {
        if signal.generation != self.pipeline.generation() {
            debug!(
                target: "stream.session",
                camera = %self.tile,
                signal_generation = signal.generation,
                current_generation = self.pipeline.generation(),
                "Ignoring append signal from a previous sink"
            );
            return None;
        }

        match signal.outcome {
            AppendOutcome::Completed => {
                match self.pipeline.on_append_complete() {
                    Ok(outcome) => {
                        if let Some(started) = self.append_started.take() {
                            stream_metrics::record_segment_appended(started.elapsed());
                        }
                        match outcome {
                            CompletionOutcome::AppendedNext { .. } => self.arm_append_deadline(),
                            CompletionOutcome::Drained => self.append_deadline = None,
                        }
                    }
                    Err(error) => return Some(self.fail(error)),
                }

                if let Some(driver) = self.playback.as_mut() {
                    if let Err(e) = driver.on_data_appended() {
                        // Retried on the next completed append.
                        warn!(
                            target: "stream.session",
                            camera = %self.tile,
                            error = %e,
                            "Element refused to start playback"
                        );
                    }
                }
                None
            }

            AppendOutcome::Failed(reason) => {
                let error = self.pipeline.on_append_error(&reason);
                Some(self.fail(error))
            }
        }
    }

    /// The connection is gone (or never came up). Reset the pipeline and
    /// either schedule a reconnect or return the exit reason.
    async fn connection_lost(&mut self, error: Option<StreamError>) -> Option<String> {
        let was_connected = matches!(self.link, Link::Connected(_));
        self.close_link().await;

        let discarded = self.pipeline.reset();
        stream_metrics::record_segments_discarded(discarded);
        self.detach_playback();

        if was_connected {
            self.emit(SessionEvent::StreamEnded);
        }

        let attempt = self.reconnect_attempt.saturating_add(1);
        if let Some(delay) = self.settings.reconnect.delay_for(attempt) {
            self.reconnect_attempt = attempt;
            self.reconnects += 1;
            stream_metrics::record_reconnect();

            info!(
                target: "stream.session",
                camera = %self.tile,
                attempt,
                delay_ms = delay.as_millis(),
                discarded,
                "Scheduling reconnect"
            );

            self.link = Link::Waiting {
                retry_at: Instant::now() + delay,
            };
            self.emit(SessionEvent::Reconnecting { attempt, delay });
            return None;
        }

        let error = match error {
            Some(error) => Some(error),
            None if self.settings.reconnect.is_enabled() => Some(StreamError::Connection(
                format!("gave up after {} reconnect attempts", self.reconnect_attempt),
            )),
            None => None,
        };

        match error {
            Some(error) => Some(self.fail(error)),
            None => Some("stream ended".to_string()),
        }
    }

    fn begin_connect(&mut self) {
        debug!(
            target: "stream.session",
            camera = %self.tile,
            attempt = self.reconnect_attempt,
            "Connecting to stream endpoint"
        );

        let connector = Arc::clone(&self.connector);
        let endpoint = self.endpoint.clone();
        self.link = Link::Connecting(
            async move {
                let started = Instant::now();
                let result = connector.connect(&endpoint).await;
                (result, started.elapsed())
            }
            .boxed(),
        );
    }

    fn arm_append_deadline(&mut self) {
        let now = Instant::now();
        self.append_started = Some(now);
        self.append_deadline = Some(now + self.settings.append_timeout);
    }

    fn detach_playback(&mut self) {
        self.append_deadline = None;
        self.append_started = None;
        if let Some(driver) = self.playback.as_mut() {
            driver.on_sink_detached();
        }
    }

    async fn close_link(&mut self) {
        if let Link::Connected(mut source) = std::mem::replace(&mut self.link, Link::Down) {
            source.close().await;
        }
    }

    /// Log, count and report a fatal error. Returns the exit reason.
    fn fail(&mut self, error: StreamError) -> String {
        error!(
            target: "stream.session",
            camera = %self.tile,
            session_id = %self.session_id,
            error = %error,
            error_code = error.error_code(),
            "Stream session failed"
        );
        stream_metrics::record_session_error(&error);
        let reason = format!("stream error: {error}");
        self.emit(SessionEvent::StreamError { error });
        reason
    }

    /// Close the connection, end the sink and discard queued segments.
    async fn teardown(&mut self) {
        if self.is_closing {
            return;
        }
        self.is_closing = true;

        self.close_link().await;
        let discarded = self.pipeline.close();
        stream_metrics::record_segments_discarded(discarded);
        self.detach_playback();

        debug!(
            target: "stream.session",
            camera = %self.tile,
            discarded,
            "Session torn down"
        );
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            tile: self.tile.clone(),
            state: self.pipeline.state_kind(),
            streaming_started: self.pipeline.streaming_started(),
            queue_len: self.pipeline.queue_len(),
            codec: self.pipeline.codec().map(str::to_string),
            connected: matches!(self.link, Link::Connected(_)),
            segments_received: self.segments_received,
            segments_appended: self.pipeline.segments_appended(),
            stalls_corrected: self
                .playback
                .as_ref()
                .map_or(0, PlaybackDriver::stalls_corrected),
            reconnects: self.reconnects,
        }
    }

    fn emit(&self, event: SessionEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    target: "stream.session",
                    camera = %self.tile,
                    event = event.as_str(),
                    "Event channel full, dropping event"
                );
            }
            // Host stopped listening.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}
