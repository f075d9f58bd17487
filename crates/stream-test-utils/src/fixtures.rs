//! Pre-configured test data.

use bytes::{BufMut, Bytes, BytesMut};
use common::types::CameraId;

use crate::mock_server::ServerFrame;

/// H.264 High profile, level 3.1.
pub const TEST_CODEC: &str = "avc1.64001f";

/// A codec the recording sink factory can be told to reject.
pub const UNSUPPORTED_CODEC: &str = "theora";

/// Parse a camera ID, panicking on invalid input.
#[must_use]
pub fn camera(id: &str) -> CameraId {
    CameraId::parse(id).expect("valid camera id")
}

/// A fake `moof` fragment whose body encodes `index`.
///
/// The first octet is never the init tag, so the payload is a valid
/// segment message as-is.
#[must_use]
pub fn segment_payload(index: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u32(16);
    buf.put_slice(b"moof");
    buf.put_u64(index);
    buf.freeze()
}

/// Init message followed by `count` segments, then the connection stays open.
#[must_use]
pub fn live_script(codec: &str, count: u64) -> Vec<ServerFrame> {
    let mut frames = vec![ServerFrame::Init(codec.to_string())];
    frames.extend((0..count).map(|i| ServerFrame::Segment(segment_payload(i))));
    frames
}

/// Like [`live_script`] but the server closes the connection at the end.
#[must_use]
pub fn ending_script(codec: &str, count: u64) -> Vec<ServerFrame> {
    let mut frames = live_script(codec, count);
    frames.push(ServerFrame::Close);
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use segment_protocol::{decode_message, StreamMessage};

    #[test]
    fn test_segment_payload_is_a_segment_message() {
        let payload = segment_payload(7);
        assert_eq!(payload.len(), 16);
        let message = decode_message(payload.clone(), 0).unwrap();
        assert_eq!(
            message,
            StreamMessage::Segment(segment_protocol::Segment::new(0, payload))
        );
    }

    #[test]
    fn test_scripts() {
        let script = ending_script(TEST_CODEC, 2);
        assert_eq!(script.len(), 4);
        assert!(matches!(script.first(), Some(ServerFrame::Init(c)) if c == TEST_CODEC));
        assert!(matches!(script.last(), Some(ServerFrame::Close)));
    }
}
