//! `blinkgate calibrate`: replay a recorded EAR trace through the blink detector.
//!
//! Used to tune `close_threshold`, `open_threshold` and `min_closed_frames`
//! against the landmark model actually deployed. A trace is a JSON array with
//! one entry per frame: the mean EAR, or `null` for a frame without a face.

use std::path::Path;

use anyhow::{Context, Result};
use blinkgate_core::{BlinkConfig, BlinkConfigError, BlinkDetector};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationReport {
    pub thresholds: BlinkConfig,
    pub frames: usize,
    pub blink_count: u32,
    /// Frame index at which each blink was counted (the reopening frame).
    pub blink_frames: Vec<usize>,
    pub frames_without_face: u64,
    /// Longest run of frames the detector held the eyes closed.
    pub longest_closure: u32,
    pub min_ear: Option<f32>,
    pub max_ear: Option<f32>,
}

pub fn load_trace(path: &Path) -> Result<Vec<Option<f32>>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read EAR trace {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid EAR trace {}", path.display()))
}

pub fn calibrate(
    trace: &[Option<f32>],
    config: BlinkConfig,
) -> Result<CalibrationReport, BlinkConfigError> {
    let mut detector = BlinkDetector::new(config)?;
    let mut blink_frames = Vec::new();
    let mut longest_closure = 0;
    let mut closure = 0;

    for (index, &ear) in trace.iter().enumerate() {
        let before = detector.blink_count();
        detector.process_ear(ear);
        if detector.blink_count() > before {
            blink_frames.push(index);
        }

        if detector.eyes_closed() {
            closure += 1;
            longest_closure = longest_closure.max(closure);
        } else if ear.is_some() {
            closure = 0;
        }
    }

    let observed = || trace.iter().flatten().copied().filter(|v| v.is_finite());
    Ok(CalibrationReport {
        thresholds: config,
        frames: trace.len(),
        blink_count: detector.blink_count(),
        blink_frames,
        frames_without_face: detector.frames_without_face(),
        longest_closure,
        min_ear: observed().reduce(f32::min),
        max_ear: observed().reduce(f32::max),
    })
}
