//! `TileController` - supervisor for per-tile stream sessions.
//!
//! - One `StreamSession` per open tile; tiles never share connections,
//!   pipelines or sinks
//! - Resolves camera endpoints through the [`EndpointCatalog`]
//! - Owns the root `CancellationToken`; each session runs on a child token
//! - Forwards every session's events to a single host channel as
//!   [`TileEvent`]s
//! - Forgets sessions whose task has exited, so a failed tile can be reopened
//!
//! # Shutdown
//!
//! `shutdown(deadline)` stops accepting tiles, asks every session to close,
//! and waits up to `deadline` for sessions (and their final events) to
//! drain. Sessions still running at the deadline are cancelled.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use common::types::CameraId;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::catalog::{validate_endpoint, EndpointCatalog};
use crate::errors::StreamError;
use crate::observability::metrics as stream_metrics;
use crate::playback::MediaElement;
use crate::receiver::Connector;
use crate::sink::SinkFactory;

use super::messages::{ControllerMessage, SessionEvent, SessionSnapshot, TileEvent};
use super::session::{SessionSettings, StreamSession, StreamSessionHandle};

/// Default channel buffer size for the controller mailbox.
const CONTROLLER_CHANNEL_BUFFER: usize = 100;

/// Default channel buffer size for host-bound tile events.
const TILE_EVENT_BUFFER: usize = 256;

/// How long a closed tile may take to exit before it is cancelled.
const TILE_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the `TileController`.
///
/// All methods are async and return results via oneshot channels.
#[derive(Clone, Debug)]
pub struct TileControllerHandle {
    sender: mpsc::Sender<ControllerMessage>,
    cancel_token: CancellationToken,
}

impl TileControllerHandle {
    /// Spawn the controller and return a handle plus the host event stream.
    #[must_use]
    pub fn new(
        catalog: EndpointCatalog,
        settings: SessionSettings,
        connector: Arc<dyn Connector>,
        sink_factory: Arc<dyn SinkFactory>,
    ) -> (Self, mpsc::Receiver<TileEvent>) {
        let (sender, receiver) = mpsc::channel(CONTROLLER_CHANNEL_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(TILE_EVENT_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = TileController {
            receiver,
            cancel_token: cancel_token.clone(),
            catalog,
            settings,
            connector,
            sink_factory,
            tiles: BTreeMap::new(),
            host_events: event_tx,
            accepting_new: true,
        };

        tokio::spawn(actor.run());

        (
            Self {
                sender,
                cancel_token,
            },
            event_rx,
        )
    }

    /// Open a tile for `camera`.
    ///
    /// `endpoint` overrides the catalog entry; `element` is `None` for
    /// headless tiles.
    pub async fn open_tile(
        &self,
        camera: CameraId,
        endpoint: Option<String>,
        element: Option<Box<dyn MediaElement>>,
    ) -> Result<(), StreamError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::OpenTile {
                camera,
                endpoint,
                element,
                respond_to: tx,
            })
            .await
            .map_err(|e| StreamError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| StreamError::Internal(format!("response receive failed: {e}")))?
    }

    /// Close a tile.
    pub async fn close_tile(&self, camera: CameraId, reason: String) -> Result<(), StreamError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::CloseTile {
                camera,
                reason,
                respond_to: tx,
            })
            .await
            .map_err(|e| StreamError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| StreamError::Internal(format!("response receive failed: {e}")))?
    }

    /// Report that a tile's media element paused.
    pub async fn tile_paused(&self, camera: CameraId) -> Result<(), StreamError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::TilePaused {
                camera,
                respond_to: tx,
            })
            .await
            .map_err(|e| StreamError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| StreamError::Internal(format!("response receive failed: {e}")))?
    }

    /// Snapshot a tile's session.
    pub async fn tile_state(&self, camera: CameraId) -> Result<SessionSnapshot, StreamError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::GetTileState {
                camera,
                respond_to: tx,
            })
            .await
            .map_err(|e| StreamError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| StreamError::Internal(format!("response receive failed: {e}")))?
    }

    /// Cameras with an open tile, sorted.
    pub async fn open_tiles(&self) -> Result<Vec<CameraId>, StreamError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::ListTiles { respond_to: tx })
            .await
            .map_err(|e| StreamError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| StreamError::Internal(format!("response receive failed: {e}")))
    }

    /// Close every tile, waiting up to `deadline`, then stop the controller.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), StreamError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::Shutdown {
                deadline,
                respond_to: tx,
            })
            .await
            .map_err(|e| StreamError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| StreamError::Internal(format!("response receive failed: {e}")))?
    }

    /// Cancel the controller and every session (immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the controller is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token, cancelled together with the controller.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// Internal state for an open tile.
struct ManagedTile {
    handle: StreamSessionHandle,
    task_handle: JoinHandle<()>,
    /// Copies session events onto the host channel.
    forwarder: JoinHandle<()>,
}

/// The `TileController` implementation.
pub struct TileController {
    receiver: mpsc::Receiver<ControllerMessage>,
    /// Root cancellation token.
    cancel_token: CancellationToken,
    catalog: EndpointCatalog,
    settings: SessionSettings,
    connector: Arc<dyn Connector>,
    sink_factory: Arc<dyn SinkFactory>,
    tiles: BTreeMap<CameraId, ManagedTile>,
    host_events: mpsc::Sender<TileEvent>,
    accepting_new: bool,
}

impl TileController {
    /// Run the actor message loop.
    #[instrument(skip_all, name = "stream.controller", fields(cameras = self.catalog.len()))]
    async fn run(mut self) {
        info!(
            target: "stream.controller",
            cameras = self.catalog.len(),
            "TileController started"
        );

        loop {
            // Forget sessions that exited on their own
            self.reap_finished_tiles().await;

            tokio::select! {
                // Handle cancellation
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "stream.controller",
                        "TileController received cancellation signal"
                    );
                    self.drain_tiles(Instant::now() + TILE_CLOSE_TIMEOUT).await;
                    break;
                }

                // Handle messages
                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            if self.handle_message(message).await {
                                break;
                            }
                        }
                        None => {
                            info!(
                                target: "stream.controller",
                                "TileController channel closed, exiting"
                            );
                            self.cancel_token.cancel();
                            self.drain_tiles(Instant::now() + TILE_CLOSE_TIMEOUT).await;
                            break;
                        }
                    }
                }
            }
        }

        stream_metrics::set_sessions_active(0);
        info!(
            target: "stream.controller",
            tiles_remaining = self.tiles.len(),
            "TileController stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: ControllerMessage) -> bool {
        match message {
            ControllerMessage::OpenTile {
                camera,
                endpoint,
                element,
                respond_to,
            } => {
                let result = self.open_tile(camera, endpoint, element);
                let _ = respond_to.send(result);
                false
            }

            ControllerMessage::CloseTile {
                camera,
                reason,
                respond_to,
            } => {
                let result = self.close_tile(&camera, reason).await;
                let _ = respond_to.send(result);
                false
            }

            ControllerMessage::TilePaused { camera, respond_to } => {
                let result = match self.tiles.get(&camera) {
                    Some(managed) => managed.handle.notify_paused().await,
                    None => Err(StreamError::TileNotFound(camera.to_string())),
                };
                let _ = respond_to.send(result);
                false
            }

            ControllerMessage::GetTileState { camera, respond_to } => {
                let result = match self.tiles.get(&camera) {
                    Some(managed) => managed.handle.get_state().await,
                    None => Err(StreamError::TileNotFound(camera.to_string())),
                };
                let _ = respond_to.send(result);
                false
            }

            ControllerMessage::ListTiles { respond_to } => {
                let _ = respond_to.send(self.tiles.keys().cloned().collect());
                false
            }

            ControllerMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                info!(
                    target: "stream.controller",
                    tiles = self.tiles.len(),
                    deadline_ms = deadline.as_millis(),
                    "Initiating graceful shutdown"
                );
                self.accepting_new = false;
                self.drain_tiles(Instant::now() + deadline).await;
                self.cancel_token.cancel();
                let _ = respond_to.send(Ok(()));
                true
            }
        }
    }

    fn open_tile(
        &mut self,
        camera: CameraId,
        endpoint: Option<String>,
        element: Option<Box<dyn MediaElement>>,
    ) -> Result<(), StreamError> {
        if !self.accepting_new {
            return Err(StreamError::Closed);
        }

        if self.tiles.contains_key(&camera) {
            return Err(StreamError::TileAlreadyOpen(camera.to_string()));
        }

        let endpoint = match endpoint {
            Some(url) => {
                validate_endpoint(&url).map_err(|e| StreamError::Config(e.to_string()))?;
                url
            }
            None => self
                .catalog
                .endpoint(&camera)
                .ok_or_else(|| StreamError::UnknownCamera(camera.to_string()))?
                .to_string(),
        };

        let (handle, events, task_handle) = StreamSession::spawn(
            camera.clone(),
            endpoint,
            self.settings.clone(),
            Arc::clone(&self.connector),
            Arc::clone(&self.sink_factory),
            element,
            self.cancel_token.child_token(),
        );

        let forwarder = tokio::spawn(forward_events(
            camera.clone(),
            events,
            self.host_events.clone(),
        ));

        debug!(
            target: "stream.controller",
            camera = %camera,
            session_id = %handle.session_id(),
            "Tile opened"
        );

        self.tiles.insert(
            camera,
            ManagedTile {
                handle,
                task_handle,
                forwarder,
            },
        );
        stream_metrics::set_sessions_active(self.tiles.len());

        Ok(())
    }

    /// Remove a tile and ask its session to close. Does not wait for the
    /// session to exit.
    async fn close_tile(&mut self, camera: &CameraId, reason: String) -> Result<(), StreamError> {
        let managed = self
            .tiles
            .remove(camera)
            .ok_or_else(|| StreamError::TileNotFound(camera.to_string()))?;
        stream_metrics::set_sessions_active(self.tiles.len());

        if managed.handle.close(reason).await.is_err() {
            // Session already gone or its mailbox is closed.
            managed.handle.cancel();
        }

        // Don't block the message loop on session teardown
        let camera_owned = camera.clone();
        tokio::spawn(async move {
            let ManagedTile {
                handle,
                task_handle,
                forwarder,
            } = managed;
            match tokio::time::timeout(TILE_CLOSE_TIMEOUT, task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "stream.controller",
                        camera = %camera_owned,
                        "Session task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "stream.controller",
                        camera = %camera_owned,
                        error = ?e,
                        "Session task panicked during close"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "stream.controller",
                        camera = %camera_owned,
                        "Session close timed out, cancelling"
                    );
                    handle.cancel();
                }
            }
            let _ = forwarder.await;
        });

        info!(
            target: "stream.controller",
            camera = %camera,
            open_tiles = self.tiles.len(),
            "Tile closed"
        );

        Ok(())
    }

    /// Close every tile and wait until `deadline` for sessions and their
    /// event forwarders to finish.
    async fn drain_tiles(&mut self, deadline: Instant) {
        for (camera, managed) in &self.tiles {
            if managed
                .handle
                .close("controller shutdown".to_string())
                .await
                .is_err()
            {
                debug!(
                    target: "stream.controller",
                    camera = %camera,
                    "Session mailbox closed, cancelling"
                );
                managed.handle.cancel();
            }
        }

        let tiles = std::mem::take(&mut self.tiles);
        for (camera, managed) in tiles {
            match tokio::time::timeout_at(deadline, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "stream.controller",
                        camera = %camera,
                        "Session completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "stream.controller",
                        camera = %camera,
                        error = ?e,
                        "Session task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "stream.controller",
                        camera = %camera,
                        "Session shutdown timed out, cancelling"
                    );
                    managed.handle.cancel();
                }
            }
            // The forwarder ends once the session's event sender is gone.
            if tokio::time::timeout_at(deadline, managed.forwarder)
                .await
                .is_err()
            {
                debug!(
                    target: "stream.controller",
                    camera = %camera,
                    "Event forwarder did not finish before the deadline"
                );
            }
        }
        stream_metrics::set_sessions_active(0);

        info!(
            target: "stream.controller",
            "All tiles drained"
        );
    }

    /// Drop sessions whose task has exited (fatal error, reconnects exhausted).
    async fn reap_finished_tiles(&mut self) {
        let finished: Vec<CameraId> = self
            .tiles
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(camera, _)| camera.clone())
            .collect();

        for camera in finished {
            let Some(managed) = self.tiles.remove(&camera) else {
                continue;
            };
            match managed.task_handle.await {
                Ok(()) => {
                    info!(
                        target: "stream.controller",
                        camera = %camera,
                        "Session exited, tile released"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "stream.controller",
                            camera = %camera,
                            error = ?join_error,
                            "Session task panicked"
                        );
                    }
                }
            }
        }

        stream_metrics::set_sessions_active(self.tiles.len());
    }
}

/// Copy session events onto the host channel until the session exits.
async fn forward_events(
    camera: CameraId,
    mut events: mpsc::Receiver<SessionEvent>,
    host_events: mpsc::Sender<TileEvent>,
) {
    while let Some(event) = events.recv().await {
        let tile_event = TileEvent {
            camera: camera.clone(),
            event,
        };
        if host_events.send(tile_event).await.is_err() {
            // Host dropped its receiver; keep draining so the session never
            // sees a full channel.
            while events.recv().await.is_some() {}
            return;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::ReconnectPolicy;
    use crate::errors::SinkError;
    use crate::receiver::SegmentSource;
    use crate::sink::{AppendSignals, MediaSink};
    use async_trait::async_trait;

    /// Connector whose handshake never completes.
    struct HangingConnector;

    #[async_trait]
    impl Connector for HangingConnector {
        async fn connect(&self, _endpoint: &str) -> Result<Box<dyn SegmentSource>, StreamError> {
            std::future::pending().await
        }
    }

    /// Connector that always fails.
    struct RefusingConnector;

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn connect(&self, _endpoint: &str) -> Result<Box<dyn SegmentSource>, StreamError> {
            Err(StreamError::Connection("connection refused".to_string()))
        }
    }

    struct NoSinks;

    impl SinkFactory for NoSinks {
        fn create(
            &self,
            _camera: &CameraId,
            codec: &str,
            _signals: AppendSignals,
        ) -> Result<Box<dyn MediaSink>, SinkError> {
            Err(SinkError::UnsupportedCodec(codec.to_string()))
        }
    }

    fn cam(id: &str) -> CameraId {
        CameraId::parse(id).unwrap()
    }

    fn catalog() -> EndpointCatalog {
        EndpointCatalog::parse("front-door=ws://nvr.local/stream/1,lobby=ws://nvr.local/stream/2")
            .unwrap()
    }

    fn controller(
        connector: Arc<dyn Connector>,
        reconnect: ReconnectPolicy,
    ) -> (TileControllerHandle, mpsc::Receiver<TileEvent>) {
        TileControllerHandle::new(
            catalog(),
            SessionSettings {
                reconnect,
                ..SessionSettings::default()
            },
            connector,
            Arc::new(NoSinks),
        )
    }

    #[tokio::test]
    async fn test_open_and_list_tiles() {
        let (handle, _events) = controller(Arc::new(HangingConnector), ReconnectPolicy::Disabled);

        handle.open_tile(cam("lobby"), None, None).await.unwrap();
        handle.open_tile(cam("front-door"), None, None).await.unwrap();

        let tiles = handle.open_tiles().await.unwrap();
        assert_eq!(tiles, vec![cam("front-door"), cam("lobby")]);

        let state = handle.tile_state(cam("lobby")).await.unwrap();
        assert_eq!(state.tile, cam("lobby"));
        assert!(!state.connected);
        assert_eq!(state.codec, None);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_duplicate_tile_is_rejected() {
        let (handle, _events) = controller(Arc::new(HangingConnector), ReconnectPolicy::Disabled);

        handle.open_tile(cam("lobby"), None, None).await.unwrap();
        let result = handle.open_tile(cam("lobby"), None, None).await;
        assert!(matches!(result, Err(StreamError::TileAlreadyOpen(id)) if id == "lobby"));

        handle.cancel();
    }

    #[tokio::test]
    async fn test_unknown_camera_is_rejected() {
        let (handle, _events) = controller(Arc::new(HangingConnector), ReconnectPolicy::Disabled);

        let result = handle.open_tile(cam("parking"), None, None).await;
        assert!(matches!(result, Err(StreamError::UnknownCamera(id)) if id == "parking"));

        // An explicit endpoint needs no catalog entry
        handle
            .open_tile(cam("parking"), Some("ws://nvr.local/stream/9".to_string()), None)
            .await
            .unwrap();

        let result = handle
            .open_tile(cam("garage"), Some("http://nvr.local/stream".to_string()), None)
            .await;
        assert!(matches!(result, Err(StreamError::Config(_))));

        handle.cancel();
    }

    #[tokio::test]
    async fn test_close_tile() {
        let (handle, mut events) =
            controller(Arc::new(HangingConnector), ReconnectPolicy::Disabled);

        handle.open_tile(cam("lobby"), None, None).await.unwrap();
        handle
            .close_tile(cam("lobby"), "tile unmounted".to_string())
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.camera, cam("lobby"));
        match event.event {
            SessionEvent::Closed { reason } => assert_eq!(reason, "tile unmounted"),
            other => panic!("unexpected event {other:?}"),
        }

        assert!(handle.open_tiles().await.unwrap().is_empty());
        let result = handle.close_tile(cam("lobby"), "again".to_string()).await;
        assert!(matches!(result, Err(StreamError::TileNotFound(_))));
        let result = handle.tile_state(cam("lobby")).await;
        assert!(matches!(result, Err(StreamError::TileNotFound(_))));

        // The tile can be opened again
        handle.open_tile(cam("lobby"), None, None).await.unwrap();
        handle.cancel();
    }

    #[tokio::test]
    async fn test_failed_session_releases_tile() {
        let (handle, mut events) =
            controller(Arc::new(RefusingConnector), ReconnectPolicy::Disabled);

        handle.open_tile(cam("lobby"), None, None).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event.event,
            SessionEvent::StreamError {
                error: StreamError::Connection(_)
            }
        ));
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event.event, SessionEvent::Closed { .. }));

        // Reaped on the controller's next message once the task has exited
        let mut reopened = false;
        for _ in 0..50 {
            match handle.open_tile(cam("lobby"), None, None).await {
                Ok(()) => {
                    reopened = true;
                    break;
                }
                Err(StreamError::TileAlreadyOpen(_)) => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        assert!(reopened, "failed tile should be released");

        handle.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_closes_all_tiles() {
        let (handle, mut events) =
            controller(Arc::new(HangingConnector), ReconnectPolicy::Disabled);

        handle.open_tile(cam("lobby"), None, None).await.unwrap();
        handle.open_tile(cam("front-door"), None, None).await.unwrap();

        handle.shutdown(Duration::from_secs(5)).await.unwrap();
        assert!(handle.is_cancelled());

        let mut closed = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(100), events.recv()).await
        {
            if let SessionEvent::Closed { reason } = event.event {
                assert_eq!(reason, "controller shutdown");
                closed.push(event.camera);
            }
        }
        closed.sort();
        assert_eq!(closed, vec![cam("front-door"), cam("lobby")]);

        // Controller has stopped
        assert!(handle.open_tiles().await.is_err());
    }

    #[tokio::test]
    async fn test_controller_cancellation_token() {
        let (handle, _events) = controller(Arc::new(HangingConnector), ReconnectPolicy::Disabled);

        assert!(!handle.is_cancelled());
        let child = handle.child_token();
        assert!(!child.is_cancelled());

        handle.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(handle.is_cancelled());
        assert!(child.is_cancelled());
    }
}
