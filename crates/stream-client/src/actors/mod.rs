//! Actor model for the streaming client.
//!
//! ```text
//! TileControllerHandle (one per host)
//! └── TileController
//!     └── supervises N StreamSessions
//!         └── StreamSession (one per tile)
//!             ├── owns the stream connection (SegmentSource)
//!             ├── owns the BufferPipeline and its MediaSink
//!             └── owns the PlaybackDriver for the tile's element
//! ```
//!
//! Requests reach actors over `mpsc` mailboxes with `oneshot` replies.
//! Events flow back on bounded channels; the controller tags them with the
//! tile's camera.

pub mod controller;
pub mod messages;
pub mod session;

pub use controller::{TileController, TileControllerHandle};
pub use messages::{SessionEvent, SessionSnapshot, TileEvent};
pub use session::{SessionSettings, StreamSession, StreamSessionHandle};
