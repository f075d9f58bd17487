//! Stream message types.

use bytes::Bytes;

/// First octet of a codec-initialization message.
pub const INIT_TAG: u8 = 0x09;

/// Codec announcement that opens the media sink for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitMessage {
    /// Codec descriptor, e.g. `avc1.64001f`
    pub codec: String,
}

/// One fragmented-media chunk, immutable once received.
///
/// Cloning is cheap: the payload is reference counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Arrival index within the connection, starting at 0
    pub sequence: u64,
    /// Append-ready container bytes
    pub payload: Bytes,
}

impl Segment {
    /// Create a segment.
    #[must_use]
    pub const fn new(sequence: u64, payload: Bytes) -> Self {
        Self { sequence, payload }
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    /// Codec initialization
    Init(InitMessage),
    /// Media data
    Segment(Segment),
}

impl StreamMessage {
    /// Short label for logs and metric labels.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            StreamMessage::Init(_) => "init",
            StreamMessage::Segment(_) => "segment",
        }
    }
}
