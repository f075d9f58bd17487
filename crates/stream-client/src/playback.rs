//! Playback driver: starts playback once data is buffered and corrects the
//! "position past buffered end" stall.
//!
//! Some decoders let the playback position drift past the end of the
//! buffered range on a live stream; the element then pauses without
//! raising an error. When a pause is observed in live mode and the position
//! is beyond the buffered end, the driver seeks back to
//! `buffered_end - stall_rewind` and resumes.
//!
//! A user-initiated pause is indistinguishable from the stall at this level,
//! so the correction is only applied when live mode is on. Hosts that let
//! users pause a tile turn live mode off for that tile.

use common::types::CameraId;
use tracing::{debug, info, warn};

use crate::errors::PlaybackError;

/// Default rewind applied when correcting a stall, in seconds.
pub const DEFAULT_STALL_REWIND_SECONDS: f64 = 0.1;

/// The playable element a tile renders (video element, decoder surface).
pub trait MediaElement: Send {
    /// Bind the element's source to a freshly created sink.
    fn attach(&mut self, codec: &str);

    /// Current playback position in seconds.
    fn current_time(&self) -> f64;

    /// End of the last buffered range in seconds, `None` when nothing is buffered.
    fn buffered_end(&self) -> Option<f64>;

    /// Whether playback is paused.
    fn is_paused(&self) -> bool;

    /// Move the playback position.
    fn seek(&mut self, position: f64);

    /// Request playback.
    ///
    /// # Errors
    ///
    /// Returns `PlaybackError::PlayRejected` if the element refuses to play.
    fn play(&mut self) -> Result<(), PlaybackError>;
}

/// Result of a stall check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StallCheck {
    /// Position was past the buffered end; seeked back and resumed.
    Corrected { from: f64, to: f64 },
    /// Position is inside the buffered range.
    NotStalled,
    /// Nothing buffered yet.
    NoBufferedData,
    /// Live mode is off; pauses are left to the user.
    Ignored,
}

/// Drives one media element.
pub struct PlaybackDriver {
    camera: CameraId,
    element: Box<dyn MediaElement>,
    live_mode: bool,
    stall_rewind: f64,
    attached: bool,
    started: bool,
    stalls_corrected: u64,
}

impl std::fmt::Debug for PlaybackDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackDriver")
            .field("camera", &self.camera)
            .field("live_mode", &self.live_mode)
            .field("stall_rewind", &self.stall_rewind)
            .field("attached", &self.attached)
            .field("started", &self.started)
            .field("stalls_corrected", &self.stalls_corrected)
            .finish_non_exhaustive()
    }
}

impl PlaybackDriver {
    /// Create a driver. Negative or non-finite rewinds fall back to the default.
    #[must_use]
    pub fn new(
        camera: CameraId,
        element: Box<dyn MediaElement>,
        live_mode: bool,
        stall_rewind: f64,
    ) -> Self {
        let stall_rewind = if stall_rewind.is_finite() && stall_rewind >= 0.0 {
            stall_rewind
        } else {
            DEFAULT_STALL_REWIND_SECONDS
        };
        Self {
            camera,
            element,
            live_mode,
            stall_rewind,
            attached: false,
            started: false,
            stalls_corrected: 0,
        }
    }

    /// The pipeline created its sink: bind the element to it.
    pub fn on_sink_ready(&mut self, codec: &str) {
        self.element.attach(codec);
        self.attached = true;
        self.started = false;
        debug!(
            target: "stream.playback",
            camera = %self.camera,
            codec = %codec,
            "Element attached to sink"
        );
    }

    /// The sink was torn down (reconnect or close).
    pub fn on_sink_detached(&mut self) {
        self.attached = false;
        self.started = false;
    }

    /// A segment finished appending. Starts playback the first time.
    ///
    /// Returns `true` if `play()` was requested.
    ///
    /// # Errors
    ///
    /// Returns the element's `PlaybackError` if it refuses to play; the
    /// driver tries again on the next append.
    pub fn on_data_appended(&mut self) -> Result<bool, PlaybackError> {
        if !self.attached || self.started {
            return Ok(false);
        }
        if !self.element.is_paused() {
            self.started = true;
            return Ok(false);
        }
        self.element.play()?;
        self.started = true;
        debug!(
            target: "stream.playback",
            camera = %self.camera,
            "Playback started"
        );
        Ok(true)
    }

    /// The element reported a pause: check for and correct the stall.
    ///
    /// # Errors
    ///
    /// Returns `PlaybackError` if resuming after the corrective seek fails.
    pub fn on_paused(&mut self) -> Result<StallCheck, PlaybackError> {
        if !self.live_mode {
            return Ok(StallCheck::Ignored);
        }
        let Some(buffered_end) = self.element.buffered_end() else {
            return Ok(StallCheck::NoBufferedData);
        };

        let position = self.element.current_time();
        if position <= buffered_end {
            return Ok(StallCheck::NotStalled);
        }

        let target = (buffered_end - self.stall_rewind).max(0.0);
        self.element.seek(target);
        self.stalls_corrected += 1;

        info!(
            target: "stream.playback",
            camera = %self.camera,
            position,
            buffered_end,
            target,
            stalls_corrected = self.stalls_corrected,
            "Playback stalled past buffered end, seeking back"
        );

        if let Err(e) = self.element.play() {
            warn!(
                target: "stream.playback",
                camera = %self.camera,
                error = %e,
                "Resume after stall correction failed"
            );
            return Err(e);
        }

        Ok(StallCheck::Corrected {
            from: position,
            to: target,
        })
    }

    /// Whether the element is bound to a sink.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Whether playback has been started on the current sink.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Stall corrections applied so far.
    #[must_use]
    pub fn stalls_corrected(&self) -> u64 {
        self.stalls_corrected
    }

    /// Whether stall correction is enabled.
    #[must_use]
    pub fn live_mode(&self) -> bool {
        self.live_mode
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct ElementState {
        attached_codec: Option<String>,
        current_time: f64,
        buffered_end: Option<f64>,
        paused: bool,
        seeks: Vec<f64>,
        play_calls: u32,
        refuse_play: bool,
    }

    struct FakeElement(Arc<Mutex<ElementState>>);

    impl MediaElement for FakeElement {
        fn attach(&mut self, codec: &str) {
            self.0.lock().unwrap().attached_codec = Some(codec.to_string());
        }
        fn current_time(&self) -> f64 {
            self.0.lock().unwrap().current_time
        }
        fn buffered_end(&self) -> Option<f64> {
            self.0.lock().unwrap().buffered_end
        }
        fn is_paused(&self) -> bool {
            self.0.lock().unwrap().paused
        }
        fn seek(&mut self, position: f64) {
            let mut state = self.0.lock().unwrap();
            state.current_time = position;
            state.seeks.push(position);
        }
        fn play(&mut self) -> Result<(), PlaybackError> {
            let mut state = self.0.lock().unwrap();
            state.play_calls += 1;
            if state.refuse_play {
                return Err(PlaybackError::PlayRejected("autoplay blocked".to_string()));
            }
            state.paused = false;
            Ok(())
        }
    }

    fn driver(live_mode: bool) -> (PlaybackDriver, Arc<Mutex<ElementState>>) {
        let state = Arc::new(Mutex::new(ElementState {
            paused: true,
            ..ElementState::default()
        }));
        let driver = PlaybackDriver::new(
            CameraId::parse("lobby").unwrap(),
            Box::new(FakeElement(Arc::clone(&state))),
            live_mode,
            DEFAULT_STALL_REWIND_SECONDS,
        );
        (driver, state)
    }

    #[test]
    fn test_stall_correction_seeks_back_and_resumes() {
        let (mut driver, state) = driver(true);
        {
            let mut s = state.lock().unwrap();
            s.current_time = 12.5;
            s.buffered_end = Some(12.0);
            s.paused = true;
        }

        let check = driver.on_paused().unwrap();
        let StallCheck::Corrected { from, to } = check else {
            unreachable!("expected correction, got {check:?}");
        };
        assert!((from - 12.5).abs() < f64::EPSILON);
        assert!((to - 11.9).abs() < 1e-9);

        let s = state.lock().unwrap();
        assert_eq!(s.seeks.len(), 1);
        assert!((s.current_time - 11.9).abs() < 1e-9);
        assert!(!s.paused);
        assert_eq!(s.play_calls, 1);
        drop(s);
        assert_eq!(driver.stalls_corrected(), 1);
    }

    #[test]
    fn test_pause_inside_buffered_range_is_left_alone() {
        let (mut driver, state) = driver(true);
        {
            let mut s = state.lock().unwrap();
            s.current_time = 11.0;
            s.buffered_end = Some(12.0);
        }
        assert_eq!(driver.on_paused().unwrap(), StallCheck::NotStalled);

        // Exactly at the end is not past it
        state.lock().unwrap().current_time = 12.0;
        assert_eq!(driver.on_paused().unwrap(), StallCheck::NotStalled);
        assert!(state.lock().unwrap().seeks.is_empty());
        assert_eq!(driver.stalls_corrected(), 0);
    }

    #[test]
    fn test_pause_without_buffered_data() {
        let (mut driver, _state) = driver(true);
        assert_eq!(driver.on_paused().unwrap(), StallCheck::NoBufferedData);
    }

    #[test]
    fn test_pause_ignored_outside_live_mode() {
        let (mut driver, state) = driver(false);
        {
            let mut s = state.lock().unwrap();
            s.current_time = 12.5;
            s.buffered_end = Some(12.0);
        }
        assert_eq!(driver.on_paused().unwrap(), StallCheck::Ignored);
        assert!(state.lock().unwrap().seeks.is_empty());
    }

    #[test]
    fn test_rewind_clamps_at_zero() {
        let (mut driver, state) = driver(true);
        {
            let mut s = state.lock().unwrap();
            s.current_time = 0.08;
            s.buffered_end = Some(0.05);
        }
        assert!(matches!(
            driver.on_paused().unwrap(),
            StallCheck::Corrected { to, .. } if to == 0.0
        ));
    }

    #[test]
    fn test_invalid_rewind_uses_default() {
        let state = Arc::new(Mutex::new(ElementState::default()));
        let driver = PlaybackDriver::new(
            CameraId::parse("lobby").unwrap(),
            Box::new(FakeElement(state)),
            true,
            f64::NAN,
        );
        assert!((driver.stall_rewind - DEFAULT_STALL_REWIND_SECONDS).abs() < f64::EPSILON);
    }

    #[test]
    fn test_playback_starts_once_after_first_append() {
        let (mut driver, state) = driver(true);

        // Not attached yet: nothing to play
        assert!(!driver.on_data_appended().unwrap());

        driver.on_sink_ready("avc1.64001f");
        assert_eq!(
            state.lock().unwrap().attached_codec.as_deref(),
            Some("avc1.64001f")
        );

        assert!(driver.on_data_appended().unwrap());
        assert!(driver.is_started());
        assert!(!driver.on_data_appended().unwrap());
        assert_eq!(state.lock().unwrap().play_calls, 1);
    }

    #[test]
    fn test_refused_play_is_retried_on_next_append() {
        let (mut driver, state) = driver(true);
        driver.on_sink_ready("avc1.64001f");
        state.lock().unwrap().refuse_play = true;

        assert!(driver.on_data_appended().is_err());
        assert!(!driver.is_started());

        state.lock().unwrap().refuse_play = false;
        assert!(driver.on_data_appended().unwrap());
        assert_eq!(state.lock().unwrap().play_calls, 2);
    }

    #[test]
    fn test_detach_resets_start() {
        let (mut driver, _state) = driver(true);
        driver.on_sink_ready("avc1.64001f");
        driver.on_data_appended().unwrap();

        driver.on_sink_detached();
        assert!(!driver.is_attached());
        assert!(!driver.is_started());
    }
}
