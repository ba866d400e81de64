//! Recorded-session replay: camera and model ports backed by a JSON trace.
//!
//! A trace lists what the landmark model saw on each frame:
//!
//! ```json
//! {
//!   "descriptor": [0.12, -0.03, ...],
//!   "frames": [
//!     null,
//!     [],
//!     [{ "ear": 0.31 }],
//!     [{ "left": [{"x": 0, "y": 0}, ...], "right": [...] }],
//!     { "error": "inference stalled" }
//!   ]
//! }
//! ```
//!
//! `null` is a frame the camera did not deliver, `[]` a frame without a face
//! and `{"error": ..}` a failed detection. Once the trace is exhausted the
//! camera delivers nothing.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use blinkgate_core::{
    CameraError, CameraProvider, DescriptorModel, EnrollmentPorts, EyeLandmarks, FaceLandmarks,
    Frame, FrameSource, LandmarkModel, ModelError, Point,
};
use serde::Deserialize;

/// Spacing of trace frames on the replayed clock.
const FRAME_PERIOD: Duration = Duration::from_millis(33);

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionTrace {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    /// What the descriptor model returns for the captured still.
    pub descriptor: Vec<f32>,
    /// Make camera acquisition fail.
    #[serde(default)]
    pub camera_fault: Option<CameraFault>,
    pub frames: Vec<Option<TraceFrame>>,
}

fn default_width() -> u32 {
    64
}

fn default_height() -> u32 {
    48
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraFault {
    PermissionDenied,
    Busy,
    NotFound,
}

impl From<CameraFault> for CameraError {
    fn from(fault: CameraFault) -> Self {
        match fault {
            CameraFault::PermissionDenied => CameraError::PermissionDenied,
            CameraFault::Busy => CameraError::Busy,
            CameraFault::NotFound => CameraError::NotFound,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TraceFrame {
    Faces(Vec<FaceSpec>),
    Failure { error: String },
}

/// One face, given by its EAR or by explicit landmarks.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FaceSpec {
    Ear { ear: f32 },
    Eyes { left: [Point; 6], right: [Point; 6] },
    Ibug68 { points: Vec<Point> },
}

impl FaceSpec {
    fn landmarks(&self, width: u32, timestamp: Duration) -> Option<FaceLandmarks> {
        let face = match self {
            FaceSpec::Ear { ear } => {
                let w = width as f32;
                let eye = |x: f32| {
                    EyeLandmarks::with_aspect_ratio(Point::new(x, w * 0.3), w * 0.12, *ear)
                };
                FaceLandmarks::new(eye(w * 0.3), eye(w * 0.58))
            }
            FaceSpec::Eyes { left, right } => {
                FaceLandmarks::new(EyeLandmarks::new(*left), EyeLandmarks::new(*right))
            }
            FaceSpec::Ibug68 { points } => {
                return FaceLandmarks::from_ibug68(points, 1.0, timestamp)
            }
        };
        Some(FaceLandmarks { timestamp, ..face })
    }
}

impl SessionTrace {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read trace {}", path.display()))?;
        let trace: Self = serde_json::from_str(&text)
            .with_context(|| format!("invalid trace {}", path.display()))?;
        tracing::debug!(
            frames = trace.frames.len(),
            path = %path.display(),
            "loaded session trace"
        );
        Ok(trace)
    }
}

/// Replayed ports sharing one trace, wired to `sink`.
pub fn replay_ports<S>(
    trace: SessionTrace,
    sink: S,
) -> EnrollmentPorts<ReplayCamera, ReplayLandmarks, ReplayDescriptors, S> {
    let trace = Arc::new(trace);
    EnrollmentPorts {
        camera: ReplayCamera {
            trace: Arc::clone(&trace),
        },
        landmarks: ReplayLandmarks {
            trace: Arc::clone(&trace),
        },
        descriptors: ReplayDescriptors { trace },
        sink,
    }
}

// ── Camera ────────────────────────────────────────────────────────────────────

pub struct ReplayCamera {
    trace: Arc<SessionTrace>,
}

impl CameraProvider for ReplayCamera {
    type Source = ReplaySource;

    async fn acquire(&mut self) -> Result<ReplaySource, CameraError> {
        if let Some(fault) = self.trace.camera_fault {
            return Err(fault.into());
        }
        Ok(ReplaySource {
            trace: Arc::clone(&self.trace),
            cursor: 0,
        })
    }
}

/// Plays the trace from its first frame. Each acquisition starts over.
pub struct ReplaySource {
    trace: Arc<SessionTrace>,
    cursor: usize,
}

impl FrameSource for ReplaySource {
    fn current_frame(&mut self) -> Option<Frame> {
        let index = self.cursor;
        let entry = self.trace.frames.get(index)?;
        self.cursor += 1;
        if entry.is_none() {
            return None;
        }

        let (width, height) = (self.trace.width, self.trace.height);
        Some(Frame {
            width,
            height,
            data: vec![128; width as usize * height as usize * 3],
            timestamp: FRAME_PERIOD * index as u32,
        })
    }

    fn release(&mut self) {
        tracing::debug!(played = self.cursor, "replay source released");
    }
}

// ── Models ────────────────────────────────────────────────────────────────────

/// Reports the faces the trace recorded for the frame being analysed.
pub struct ReplayLandmarks {
    trace: Arc<SessionTrace>,
}

impl LandmarkModel for ReplayLandmarks {
    async fn detect(&mut self, frame: &Frame) -> Result<Vec<FaceLandmarks>, ModelError> {
        let index = (frame.timestamp.as_millis() / FRAME_PERIOD.as_millis()) as usize;
        match self.trace.frames.get(index) {
            Some(Some(TraceFrame::Faces(faces))) => faces
                .iter()
                .map(|face| {
                    face.landmarks(self.trace.width, frame.timestamp).ok_or_else(|| {
                        ModelError::Inference(format!("frame {index}: malformed 68-point face"))
                    })
                })
                .collect(),
            Some(Some(TraceFrame::Failure { error })) => {
                Err(ModelError::Inference(format!("frame {index}: {error}")))
            }
            Some(None) | None => Err(ModelError::Inference(format!(
                "frame {index} is not in the trace"
            ))),
        }
    }
}

pub struct ReplayDescriptors {
    trace: Arc<SessionTrace>,
}

impl DescriptorModel for ReplayDescriptors {
    async fn extract(&mut self, _frame: &Frame) -> Result<Vec<f32>, ModelError> {
        Ok(self.trace.descriptor.clone())
    }
}
