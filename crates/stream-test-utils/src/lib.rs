//! # Stream Test Utilities
//!
//! Shared test utilities for the Watchtower stream client.
//!
//! - `mock_server` - WebSocket stream server that plays scripted frames
//! - `sink` - Recording media sink with immediate, manual or failing appends
//! - `element` - Simulated media element with controllable position
//! - `fixtures` - Codec strings, segment payloads and ready-made scripts
//!
//! ## Usage
//!
//! ```rust,ignore
//! use stream_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let server = MockStreamServer::builder()
//!         .connection(live_script(TEST_CODEC, 3))
//!         .build()
//!         .await;
//!
//!     let sinks = RecordingSinkFactory::new();
//!     // Open a session against server.url() with `sinks`...
//!     assert!(sinks.wait_for_appends(3, Duration::from_secs(1)).await);
//! }
//! ```

pub mod element;
pub mod fixtures;
pub mod mock_server;
pub mod sink;

// Re-export commonly used items
pub use element::*;
pub use fixtures::*;
pub use mock_server::*;
pub use sink::*;
