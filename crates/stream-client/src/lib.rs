//! Watchtower Stream Client Library
//!
//! Live playback client for fragmented-MP4 camera streams. Each tile of a
//! camera wall opens a WebSocket to its camera's stream endpoint, receives
//! an init message naming the codec, then a sequence of media segments
//! that are appended, strictly in order and one at a time, to a media sink.
//!
//! # Architecture
//!
//! ```text
//! TileController
//! └── StreamSession (one per tile)
//!     ├── SegmentReceiver  - WebSocket frames -> StreamMessage
//!     ├── BufferPipeline   - serialized appends into a MediaSink
//!     └── PlaybackDriver   - autoplay and live stall correction
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Tile controller and per-tile session actors
//! - [`catalog`] - Camera to endpoint mapping
//! - [`config`] - Client configuration from environment
//! - [`errors`] - Error types with host-facing messages
//! - [`observability`] - Metrics and health endpoints
//! - [`pipeline`] - Buffer pipeline state machine
//! - [`playback`] - Media element driver
//! - [`receiver`] - Segment receiver (WebSocket transport)
//! - [`sink`] - Media sink traits and the recording sink

#![warn(clippy::pedantic)]

pub mod actors;
pub mod catalog;
pub mod config;
pub mod errors;
pub mod observability;
pub mod pipeline;
pub mod playback;
pub mod receiver;
pub mod sink;
