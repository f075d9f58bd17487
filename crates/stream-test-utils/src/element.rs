//! Simulated media element.
//!
//! The test keeps one clone to steer playback position and inspect calls;
//! the other clone is boxed into the session.
//!
//! ```rust,ignore
//! let element = SimulatedElement::new();
//! controller.open_tile(cam, None, Some(Box::new(element.clone()))).await?;
//!
//! // Drift past the buffered end, then report the pause
//! element.set_position(12.4, Some(12.0));
//! element.pause();
//! controller.tile_paused(cam).await?;
//! assert_eq!(element.seeks(), vec![11.9]);
//! ```

use std::sync::{Arc, Mutex};

use stream_client::errors::PlaybackError;
use stream_client::playback::MediaElement;

#[derive(Debug)]
struct ElementState {
    attached: Vec<String>,
    current_time: f64,
    buffered_end: Option<f64>,
    paused: bool,
    reject_play: bool,
    play_calls: usize,
    seeks: Vec<f64>,
}

/// A media element whose state the test controls.
#[derive(Debug, Clone)]
pub struct SimulatedElement {
    state: Arc<Mutex<ElementState>>,
}

impl Default for SimulatedElement {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedElement {
    /// A paused element with nothing buffered.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ElementState {
                attached: Vec::new(),
                current_time: 0.0,
                buffered_end: None,
                paused: true,
                reject_play: false,
                play_calls: 0,
                seeks: Vec::new(),
            })),
        }
    }

    /// An element that refuses `play()` (autoplay blocked).
    #[must_use]
    pub fn rejecting_play() -> Self {
        let element = Self::new();
        element.state.lock().unwrap().reject_play = true;
        element
    }

    /// Set the playback position and buffered end.
    pub fn set_position(&self, current_time: f64, buffered_end: Option<f64>) {
        let mut state = self.state.lock().unwrap();
        state.current_time = current_time;
        state.buffered_end = buffered_end;
    }

    /// Pause playback, as the decoder does on a stall.
    pub fn pause(&self) {
        self.state.lock().unwrap().paused = true;
    }

    /// Whether playback is paused.
    #[must_use]
    pub fn paused(&self) -> bool {
        self.state.lock().unwrap().paused
    }

    /// Codecs the element was attached with, in order.
    #[must_use]
    pub fn attached(&self) -> Vec<String> {
        self.state.lock().unwrap().attached.clone()
    }

    /// Number of accepted `play()` calls.
    #[must_use]
    pub fn play_calls(&self) -> usize {
        self.state.lock().unwrap().play_calls
    }

    /// Seek targets, in order.
    #[must_use]
    pub fn seeks(&self) -> Vec<f64> {
        self.state.lock().unwrap().seeks.clone()
    }

    /// Current playback position.
    #[must_use]
    pub fn position(&self) -> f64 {
        self.state.lock().unwrap().current_time
    }
}

impl MediaElement for SimulatedElement {
    fn attach(&mut self, codec: &str) {
        let mut state = self.state.lock().unwrap();
        state.attached.push(codec.to_string());
        state.paused = true;
    }

    fn current_time(&self) -> f64 {
        self.state.lock().unwrap().current_time
    }

    fn buffered_end(&self) -> Option<f64> {
        self.state.lock().unwrap().buffered_end
    }

    fn is_paused(&self) -> bool {
        self.state.lock().unwrap().paused
    }

    fn seek(&mut self, position: f64) {
        let mut state = self.state.lock().unwrap();
        state.current_time = position;
        state.seeks.push(position);
    }

    fn play(&mut self) -> Result<(), PlaybackError> {
        let mut state = self.state.lock().unwrap();
        if state.reject_play {
            return Err(PlaybackError::PlayRejected("autoplay blocked".to_string()));
        }
        state.paused = false;
        state.play_calls += 1;
        Ok(())
    }
}
