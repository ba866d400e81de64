//! Active liveness detection via eye-aspect-ratio blink counting.
//!
//! A live subject asked to blink produces a characteristic EAR trace: a
//! plateau around the open value, a short dip well below it, and a return.
//! A printed photograph or a still image on a screen holds a constant EAR and
//! never completes that cycle.
//!
//! The detector is a three-state machine with hysteresis. Closing requires the
//! EAR to fall below `close_threshold`; reopening requires it to rise above the
//! strictly larger `open_threshold`, so a value hovering around one threshold
//! cannot toggle the state back and forth. A closure only becomes a blink once
//! it has held for `min_closed_frames` consecutive frames.
//!
//! # Threat Coverage
//!
//! - **Blocks:** Printed photographs, static images held in front of camera.
//! - **Does not block:** Video replay of a blinking subject, masks with
//!   cut-out eyes, or adversarial displays.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::landmarks::FaceLandmarks;

/// Thresholds driving the blink state machine.
///
/// The defaults suit a 68-point landmark model at webcam resolution. They
/// should be calibrated against recorded traces from the deployed model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlinkConfig {
    /// EAR below which an eye counts as closing.
    pub close_threshold: f32,
    /// EAR above which a closed eye counts as reopened.
    pub open_threshold: f32,
    /// Consecutive frames below `close_threshold` before a closure counts.
    pub min_closed_frames: u32,
}

impl Default for BlinkConfig {
    fn default() -> Self {
        Self {
            close_threshold: 0.20,
            open_threshold: 0.25,
            min_closed_frames: 2,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BlinkConfigError {
    #[error("thresholds must be finite and positive (close {close}, open {open})")]
    NonPositiveThreshold { close: f32, open: f32 },
    #[error("close threshold {close} must be below open threshold {open}")]
    NoHysteresis { close: f32, open: f32 },
    #[error("min_closed_frames must be at least 1")]
    ZeroDebounce,
}

impl BlinkConfig {
    pub fn validate(&self) -> Result<(), BlinkConfigError> {
        let (close, open) = (self.close_threshold, self.open_threshold);
        if !close.is_finite() || !open.is_finite() || close <= 0.0 || open <= 0.0 {
            return Err(BlinkConfigError::NonPositiveThreshold { close, open });
        }
        if close >= open {
            return Err(BlinkConfigError::NoHysteresis { close, open });
        }
        if self.min_closed_frames == 0 {
            return Err(BlinkConfigError::ZeroDebounce);
        }
        Ok(())
    }
}

/// Eye state tracked across frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EyeState {
    Open,
    /// Below the close threshold, debounce not yet satisfied.
    Closing,
    Closed,
}

/// Converts a stream of per-frame eye observations into a blink count.
///
/// Owned by a single driver; every mutation goes through
/// [`process_frame`](Self::process_frame), [`process_ear`](Self::process_ear)
/// or [`reset`](Self::reset).
#[derive(Debug, Clone)]
pub struct BlinkDetector {
    config: BlinkConfig,
    eye_state: EyeState,
    consecutive_closed_frames: u32,
    blink_count: u32,
    frames_without_face: u64,
    last_ear: Option<f32>,
}

impl BlinkDetector {
    /// Create a detector. Fails if the thresholds are unusable.
    pub fn new(config: BlinkConfig) -> Result<Self, BlinkConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            eye_state: EyeState::Open,
            consecutive_closed_frames: 0,
            blink_count: 0,
            frames_without_face: 0,
            last_ear: None,
        })
    }

    pub fn config(&self) -> &BlinkConfig {
        &self.config
    }

    /// Feed one frame. `None` means no usable face in this frame.
    pub fn process_frame(&mut self, landmarks: Option<&FaceLandmarks>) {
        let ear = landmarks.and_then(FaceLandmarks::mean_aspect_ratio);
        self.process_ear(ear);
    }

    /// Feed one frame's mean EAR. `None` means no usable face in this frame.
    ///
    /// A missing face leaves the eye state and blink count untouched, so brief
    /// tracking dropouts cost the subject no progress.
    pub fn process_ear(&mut self, ear: Option<f32>) {
        let Some(ear) = ear.filter(|v| v.is_finite()) else {
            self.frames_without_face += 1;
            return;
        };
        self.last_ear = Some(ear);

        let closed = ear < self.config.close_threshold;
        let reopened = ear > self.config.open_threshold;

        match self.eye_state {
            EyeState::Open => {
                if closed {
                    self.consecutive_closed_frames = 1;
                    self.eye_state = EyeState::Closing;
                    self.settle_closing();
                }
            }
            EyeState::Closing => {
                if closed {
                    self.consecutive_closed_frames += 1;
                    self.settle_closing();
                } else if reopened {
                    tracing::trace!(
                        frames = self.consecutive_closed_frames,
                        ear,
                        "closure too short, ignoring"
                    );
                    self.consecutive_closed_frames = 0;
                    self.eye_state = EyeState::Open;
                } else {
                    // Inside the hysteresis band: the closed run is broken.
                    self.consecutive_closed_frames = 0;
                }
            }
            EyeState::Closed => {
                if reopened {
                    self.blink_count += 1;
                    self.consecutive_closed_frames = 0;
                    self.eye_state = EyeState::Open;
                    tracing::debug!(blinks = self.blink_count, ear, "blink detected");
                } else if closed {
                    self.consecutive_closed_frames =
                        self.consecutive_closed_frames.saturating_add(1);
                }
            }
        }
    }

    fn settle_closing(&mut self) {
        if self.consecutive_closed_frames >= self.config.min_closed_frames {
            self.eye_state = EyeState::Closed;
        }
    }

    pub fn blink_count(&self) -> u32 {
        self.blink_count
    }

    pub fn eye_state(&self) -> EyeState {
        self.eye_state
    }

    /// True once a closure has passed the debounce.
    pub fn eyes_closed(&self) -> bool {
        self.eye_state == EyeState::Closed
    }

    pub fn consecutive_closed_frames(&self) -> u32 {
        self.consecutive_closed_frames
    }

    /// Frames fed since the last reset that carried no usable face.
    pub fn frames_without_face(&self) -> u64 {
        self.frames_without_face
    }

    pub fn last_ear(&self) -> Option<f32> {
        self.last_ear
    }

    /// Return to the initial state. Safe to call at any time.
    pub fn reset(&mut self) {
        self.eye_state = EyeState::Open;
        self.consecutive_closed_frames = 0;
        self.blink_count = 0;
        self.frames_without_face = 0;
        self.last_ear = None;
    }
}
