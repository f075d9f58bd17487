//! Mock camera stream server.
//!
//! Serves `GET /stream` as a WebSocket endpoint. Each accepted connection
//! plays the next script from the builder, frame by frame. Once a script
//! runs out without a [`ServerFrame::Close`], the connection stays open
//! until the client closes it or the server shuts down.
//!
//! Connections beyond the configured scripts are refused with `503`, unless
//! the last script is set to repeat.
//!
//! # Example
//!
//! ```rust,ignore
//! use stream_test_utils::{MockStreamServer, ending_script, live_script, TEST_CODEC};
//!
//! let server = MockStreamServer::builder()
//!     .connection(ending_script(TEST_CODEC, 2)) // first connection drops
//!     .connection(live_script(TEST_CODEC, 5))   // reconnect succeeds
//!     .build()
//!     .await;
//!
//! let url = server.url();
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use segment_protocol::{encode_init, encode_segment};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One step of a connection script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// Codec-initialization message.
    Init(String),
    /// Media segment (payload must not start with the init tag).
    Segment(Bytes),
    /// Arbitrary binary message, sent unchecked.
    Raw(Bytes),
    /// Text message.
    Text(String),
    /// Pause before the next frame.
    Delay(Duration),
    /// Close the connection.
    Close,
}

struct ServerState {
    scripts: Vec<Vec<ServerFrame>>,
    repeat_last: bool,
    connections: AtomicUsize,
    client_closes: AtomicUsize,
    shutdown: CancellationToken,
}

impl ServerState {
    fn script_for(&self, index: usize) -> Option<Vec<ServerFrame>> {
        match self.scripts.get(index) {
            Some(script) => Some(script.clone()),
            None if self.repeat_last => self.scripts.last().cloned(),
            None => None,
        }
    }
}

/// A running mock stream server.
pub struct MockStreamServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for MockStreamServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockStreamServer")
            .field("addr", &self.addr)
            .field("connections", &self.connections())
            .finish_non_exhaustive()
    }
}

impl MockStreamServer {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> MockStreamServerBuilder {
        MockStreamServerBuilder::default()
    }

    /// WebSocket URL of the stream endpoint.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}/stream", self.addr)
    }

    /// Bound address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Upgrade requests received so far (refused ones included).
    #[must_use]
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Connections the client closed while the server held them open.
    #[must_use]
    pub fn client_closes(&self) -> usize {
        self.state.client_closes.load(Ordering::SeqCst)
    }

    /// Poll until `count` connections were received or `timeout` elapses.
    pub async fn wait_for_connections(&self, count: usize, timeout: Duration) -> bool {
        poll_until(timeout, || self.connections() >= count).await
    }

    /// Poll until `count` client closes were seen or `timeout` elapses.
    pub async fn wait_for_client_closes(&self, count: usize, timeout: Duration) -> bool {
        poll_until(timeout, || self.client_closes() >= count).await
    }

    /// Stop the server and drop every open connection.
    pub async fn shutdown(mut self) {
        self.state.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for MockStreamServer {
    fn drop(&mut self) {
        self.state.shutdown.cancel();
    }
}

/// Builder for [`MockStreamServer`].
#[derive(Debug, Default)]
pub struct MockStreamServerBuilder {
    scripts: Vec<Vec<ServerFrame>>,
    repeat_last: bool,
}

impl MockStreamServerBuilder {
    /// Script for the next accepted connection.
    #[must_use]
    pub fn connection(mut self, script: Vec<ServerFrame>) -> Self {
        self.scripts.push(script);
        self
    }

    /// Serve the last script to every further connection.
    #[must_use]
    pub fn repeat_last(mut self) -> Self {
        self.repeat_last = true;
        self
    }

    /// Bind to an ephemeral localhost port and start serving.
    pub async fn build(self) -> MockStreamServer {
        let state = Arc::new(ServerState {
            scripts: self.scripts,
            repeat_last: self.repeat_last,
            connections: AtomicUsize::new(0),
            client_closes: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
        });

        let app = Router::new()
            .route("/stream", get(stream_handler))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock stream server");
        let addr = listener.local_addr().expect("mock server address");

        let shutdown = state.shutdown.clone();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = server.await {
                debug!(error = %e, "Mock stream server failed");
            }
        });

        MockStreamServer {
            addr,
            state,
            task: Some(task),
        }
    }
}

async fn stream_handler(ws: WebSocketUpgrade, State(state): State<Arc<ServerState>>) -> Response {
    let index = state.connections.fetch_add(1, Ordering::SeqCst);
    let Some(script) = state.script_for(index) else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    ws.on_upgrade(move |socket| play_script(socket, script, state))
}

async fn play_script(mut socket: WebSocket, script: Vec<ServerFrame>, state: Arc<ServerState>) {
    for frame in script {
        let message = match frame {
            ServerFrame::Init(codec) => Message::Binary(encode_init(&codec).to_vec()),
            ServerFrame::Segment(payload) => Message::Binary(
                encode_segment(payload)
                    .expect("scripted segment payload")
                    .to_vec(),
            ),
            ServerFrame::Raw(bytes) => Message::Binary(bytes.to_vec()),
            ServerFrame::Text(text) => Message::Text(text),
            ServerFrame::Delay(delay) => {
                tokio::time::sleep(delay).await;
                continue;
            }
            ServerFrame::Close => {
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
        };
        if socket.send(message).await.is_err() {
            return;
        }
    }

    // Hold the connection open
    loop {
        tokio::select! {
            () = state.shutdown.cancelled() => return,
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                    state.client_closes.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

pub(crate) async fn poll_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if done() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
