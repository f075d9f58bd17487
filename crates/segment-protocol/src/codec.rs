//! Codec for classifying and producing stream messages.

use crate::message::{InitMessage, Segment, StreamMessage, INIT_TAG};
use bytes::{BufMut, Bytes, BytesMut};

/// Error type for codec operations
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    /// Message carried no bytes at all
    #[error("Empty message")]
    Empty,

    /// Codec string in an init message is unusable
    #[error("Invalid codec string: {0}")]
    InvalidCodec(String),

    /// Segment payload would be classified as something else on the wire
    #[error("Invalid segment: {0}")]
    InvalidSegment(String),
}

/// Classify one inbound binary message.
///
/// `sequence` is the arrival index assigned by the caller; it is attached
/// to segments and ignored for init messages.
///
/// # Errors
///
/// Returns `CodecError::Empty` for a zero-length message and
/// `CodecError::InvalidCodec` when an init message carries malformed UTF-8
/// or an empty codec string.
pub fn decode_message(data: Bytes, sequence: u64) -> Result<StreamMessage, CodecError> {
    let Some(&tag) = data.first() else {
        return Err(CodecError::Empty);
    };

    if tag != INIT_TAG {
        // The tag octet is part of the media payload.
        return Ok(StreamMessage::Segment(Segment::new(sequence, data)));
    }

    let codec_bytes = data.slice(1..);
    let codec = std::str::from_utf8(&codec_bytes)
        .map_err(|e| CodecError::InvalidCodec(format!("not UTF-8: {e}")))?;

    if codec.is_empty() {
        return Err(CodecError::InvalidCodec("empty codec string".to_string()));
    }

    Ok(StreamMessage::Init(InitMessage {
        codec: codec.to_string(),
    }))
}

/// Encode a codec-initialization message.
#[must_use]
pub fn encode_init(codec: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + codec.len());
    buf.put_u8(INIT_TAG);
    buf.extend_from_slice(codec.as_bytes());
    buf.freeze()
}

/// Validate a media payload for sending as a segment message.
///
/// Segments travel unframed, so a payload that starts with the init tag
/// cannot be represented.
///
/// # Errors
///
/// Returns `CodecError::InvalidSegment` if the payload is empty or starts
/// with [`INIT_TAG`].
pub fn encode_segment(payload: Bytes) -> Result<Bytes, CodecError> {
    match payload.first() {
        None => Err(CodecError::InvalidSegment("empty payload".to_string())),
        Some(&INIT_TAG) => Err(CodecError::InvalidSegment(format!(
            "payload starts with reserved tag {INIT_TAG:#04x}"
        ))),
        Some(_) => Ok(payload),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_init_message() {
        let msg = decode_message(Bytes::from_static(b"\x09avc1.64001f"), 0).unwrap();
        assert_eq!(
            msg,
            StreamMessage::Init(InitMessage {
                codec: "avc1.64001f".to_string()
            })
        );
    }

    #[test]
    fn test_decode_segment_keeps_first_octet() {
        // Typical fMP4 fragment starts with a box size, e.g. 0x00 0x00 0x00 0x18
        let raw = Bytes::from_static(&[0x00, 0x00, 0x00, 0x18, b'm', b'o', b'o', b'f']);
        let msg = decode_message(raw.clone(), 7).unwrap();
        assert_eq!(msg, StreamMessage::Segment(Segment::new(7, raw)));
    }

    #[test]
    fn test_decode_empty_message() {
        assert_eq!(decode_message(Bytes::new(), 0), Err(CodecError::Empty));
    }

    #[test]
    fn test_decode_invalid_utf8_codec() {
        let result = decode_message(Bytes::from_static(&[0x09, 0xff, 0xfe]), 0);
        assert!(matches!(result, Err(CodecError::InvalidCodec(_))));
    }

    #[test]
    fn test_decode_empty_codec() {
        assert!(matches!(
            decode_message(Bytes::from_static(&[0x09]), 0),
            Err(CodecError::InvalidCodec(_))
        ));
    }

    #[test]
    fn test_decode_codec_is_passed_through_verbatim() {
        let msg = decode_message(Bytes::from_static(b"\x09 avc1.64001f\n"), 0).unwrap();
        assert_eq!(
            msg,
            StreamMessage::Init(InitMessage {
                codec: " avc1.64001f\n".to_string()
            })
        );
    }

    #[test]
    fn test_encode_init_is_decodable() {
        let encoded = encode_init("avc1.42e01e");
        assert_eq!(encoded.first(), Some(&INIT_TAG));
        let decoded = decode_message(encoded, 0).unwrap();
        assert!(matches!(decoded, StreamMessage::Init(ref m) if m.codec == "avc1.42e01e"));
    }

    #[test]
    fn test_encode_segment_rejects_reserved_tag() {
        assert!(encode_segment(Bytes::from_static(&[0x09, 0x01])).is_err());
        assert!(encode_segment(Bytes::new()).is_err());
        let ok = encode_segment(Bytes::from_static(&[0x00, 0x01])).unwrap();
        assert_eq!(ok.len(), 2);
    }
}
