//! Wire framing for the live segment stream.
//!
//! Each binary message on a stream connection carries a one-octet type tag:
//! `0x09` introduces the codec string for the session, anything else is a
//! fragmented-MP4 media segment that is handed to the media sink as-is
//! (tag octet included).

#![warn(clippy::pedantic)]

pub mod codec;
pub mod message;

pub use codec::{decode_message, encode_init, encode_segment, CodecError};
pub use message::{InitMessage, Segment, StreamMessage, INIT_TAG};
