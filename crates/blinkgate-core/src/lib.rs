//! Blinkgate core: blink-based liveness gating for face enrollment.
//!
//! The [`Orchestrator`] drives an enrollment attempt from camera acquisition
//! through still capture, a blink challenge judged by the [`BlinkDetector`],
//! and submission of the bound record to a [`StorageSink`]. Hardware and
//! models sit behind the traits in [`ports`].

pub mod camera;
pub mod config;
mod control;
pub mod error;
pub mod landmarks;
pub mod liveness;
pub mod orchestrator;
pub mod ports;
pub mod session;
pub mod still;

pub use config::{ConfigError, LivenessConfig};
pub use control::CancelHandle;
pub use error::{EnrollError, FailureReason};
pub use landmarks::{eye_aspect_ratio, EyeLandmarks, FaceLandmarks, Point};
pub use liveness::{BlinkConfig, BlinkConfigError, BlinkDetector, EyeState};
pub use orchestrator::{
    BlinkProgress, EnrollmentPorts, FrameHint, OrchestrationState, Orchestrator, StateChange, Tick,
};
pub use ports::{
    CameraError, CameraProvider, DescriptorModel, Frame, FrameSource, LandmarkModel, ModelError,
    StorageError, StorageSink, SubmissionReceipt,
};
pub use session::{
    CandidateId, EnrollmentCandidate, EnrollmentSession, SessionError, SubmissionPayload,
};
pub use still::{encode_still, StillError};
