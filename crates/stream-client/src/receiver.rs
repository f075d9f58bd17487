//! Segment receiver: owns the stream connection and classifies messages.
//!
//! The receiver is receive-only. It holds no buffering state: every binary
//! message is classified through `segment_protocol` and handed to the
//! caller as soon as it arrives. Empty binary messages carry no media and
//! are skipped.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use segment_protocol::{decode_message, StreamMessage};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::errors::StreamError;

/// Source of classified stream messages for one connection.
#[async_trait]
pub trait SegmentSource: Send {
    /// Next message in arrival order.
    ///
    /// `None` means the peer closed the connection.
    async fn next_message(&mut self) -> Option<Result<StreamMessage, StreamError>>;

    /// Close the connection (best effort).
    async fn close(&mut self);
}

/// Opens connections to stream endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Connection` or `StreamError::ConnectTimeout`
    /// if the endpoint cannot be reached.
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn SegmentSource>, StreamError>;
}

/// WebSocket connector.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    /// Create a connector with a handshake timeout.
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn SegmentSource>, StreamError> {
        let receiver = open(endpoint, self.connect_timeout).await?;
        Ok(Box::new(receiver))
    }
}

/// Open a binary WebSocket connection to `endpoint`.
///
/// # Errors
///
/// - `StreamError::ConnectTimeout` if the handshake does not finish in time
/// - `StreamError::Connection` if the endpoint is unreachable or rejects the upgrade
pub async fn open(endpoint: &str, connect_timeout: Duration) -> Result<SegmentReceiver, StreamError> {
    let connect = tokio_tungstenite::connect_async(endpoint);
    let (stream, response) = tokio::time::timeout(connect_timeout, connect)
        .await
        .map_err(|_| StreamError::ConnectTimeout(connect_timeout))?
        .map_err(|e| StreamError::Connection(format!("handshake failed: {e}")))?;

    debug!(
        target: "stream.receiver",
        status = %response.status(),
        "Stream connection established"
    );

    Ok(SegmentReceiver {
        stream,
        next_sequence: 0,
        closed: false,
    })
}

/// One open stream connection.
pub struct SegmentReceiver {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_sequence: u64,
    closed: bool,
}

impl std::fmt::Debug for SegmentReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentReceiver")
            .field("next_sequence", &self.next_sequence)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl SegmentReceiver {
    fn classify(&mut self, data: Bytes) -> Result<StreamMessage, StreamError> {
        let message = decode_message(data, self.next_sequence)?;
        if let StreamMessage::Segment(segment) = &message {
            self.next_sequence += 1;
            trace!(
                target: "stream.receiver",
                sequence = segment.sequence,
                bytes = segment.len(),
                "Segment received"
            );
        }
        Ok(message)
    }
}

#[async_trait]
impl SegmentSource for SegmentReceiver {
    async fn next_message(&mut self) -> Option<Result<StreamMessage, StreamError>> {
        if self.closed {
            return None;
        }
        loop {
            match self.stream.next().await? {
                Ok(Message::Binary(data)) if data.is_empty() => {
                    debug!(
                        target: "stream.receiver",
                        "Skipping empty binary message"
                    );
                }
                Ok(Message::Binary(data)) => return Some(self.classify(Bytes::from(data))),
                Ok(Message::Text(text)) => {
                    debug!(
                        target: "stream.receiver",
                        len = text.len(),
                        "Ignoring text message on binary stream"
                    );
                }
                Ok(Message::Close(frame)) => {
                    debug!(
                        target: "stream.receiver",
                        frame = ?frame,
                        "Peer closed stream connection"
                    );
                    self.closed = true;
                    return None;
                }
                // Ping replies are queued by tungstenite itself.
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    self.closed = true;
                    return None;
                }
                Err(e) => {
                    self.closed = true;
                    return Some(Err(StreamError::Connection(format!("transport error: {e}"))));
                }
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.stream.close(None).await {
            debug!(
                target: "stream.receiver",
                error = %e,
                "Close handshake failed"
            );
        }
    }
}
