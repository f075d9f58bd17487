//! Sink that records the fragmented-MP4 stream to disk.
//!
//! Each sink writes one file, `<dir>/<camera>-<unix_ms>-<n>.mp4`, where `n`
//! counts sinks created by the factory. A reconnect (which restarts the
//! stream with a fresh init segment) never interleaves two streams in one
//! file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use common::types::CameraId;
use segment_protocol::Segment;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{AppendSignals, MediaSink, SinkFactory};
use crate::errors::SinkError;

/// Sample-entry codes a recorded fMP4 file can carry.
const SUPPORTED_FOURCCS: &[&str] = &["avc1", "avc3", "hvc1", "hev1", "av01", "vp09", "mp4a"];

/// Whether every codec in a (comma separated) codec string is recordable.
#[must_use]
pub fn is_supported_codec(codec: &str) -> bool {
    let mut entries = codec.split(',').map(str::trim).peekable();
    entries.peek().is_some()
        && entries.all(|entry| {
            let fourcc = entry.split('.').next().unwrap_or_default();
            SUPPORTED_FOURCCS.contains(&fourcc)
        })
}

/// Creates [`FileSink`]s under a recording directory.
///
/// Clones share the file counter.
#[derive(Debug, Clone)]
pub struct FileSinkFactory {
    dir: PathBuf,
    next_file: Arc<AtomicU64>,
}

impl FileSinkFactory {
    /// Record into `dir`, creating it if missing.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the directory cannot be created.
    pub async fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            next_file: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Recording directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl SinkFactory for FileSinkFactory {
    fn create(
        &self,
        camera: &CameraId,
        codec: &str,
        signals: AppendSignals,
    ) -> Result<Box<dyn MediaSink>, SinkError> {
        if !is_supported_codec(codec) {
            return Err(SinkError::UnsupportedCodec(codec.to_string()));
        }

        let file_name = format!(
            "{camera}-{}-{}.mp4",
            chrono::Utc::now().timestamp_millis(),
            self.next_file.fetch_add(1, Ordering::Relaxed)
        );
        let path = self.dir.join(file_name);

        debug!(
            target: "stream.sink.file",
            camera = %camera,
            codec = %codec,
            path = %path.display(),
            "Opening file sink"
        );

        Ok(Box::new(FileSink {
            path,
            codec: codec.to_string(),
            signals,
            updating: Arc::new(AtomicBool::new(false)),
            ended: false,
        }))
    }
}

/// Appends each segment to a file on a background task.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    codec: String,
    signals: AppendSignals,
    /// Set while a write task is running.
    updating: Arc<AtomicBool>,
    ended: bool,
}

impl FileSink {
    /// Destination file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MediaSink for FileSink {
    fn codec(&self) -> &str {
        &self.codec
    }

    fn begin_append(&mut self, segment: Segment) -> Result<(), SinkError> {
        if self.ended {
            return Err(SinkError::Ended);
        }
        if self.updating.swap(true, Ordering::AcqRel) {
            return Err(SinkError::AppendRejected(
                "append already in progress".to_string(),
            ));
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            self.updating.store(false, Ordering::Release);
            SinkError::AppendRejected(format!("no async runtime: {e}"))
        })?;

        let path = self.path.clone();
        let signals = self.signals.clone();
        let updating = Arc::clone(&self.updating);

        runtime.spawn(async move {
            let result = async {
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await?;
                file.write_all(&segment.payload).await?;
                file.flush().await
            }
            .await;

            updating.store(false, Ordering::Release);
            match result {
                Ok(()) => signals.completed(),
                Err(e) => {
                    warn!(
                        target: "stream.sink.file",
                        path = %path.display(),
                        sequence = segment.sequence,
                        error = %e,
                        "Segment write failed"
                    );
                    signals.failed(e.to_string());
                }
            }
        });

        Ok(())
    }

    fn end_of_stream(&mut self) {
        self.ended = true;
    }

    fn is_open(&self) -> bool {
        !self.ended
    }
}
