use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::orchestrator::OrchestrationState;
use crate::ports::{CameraError, ModelError, StorageError};
use crate::session::SessionError;
use crate::still::StillError;

/// Errors surfaced by orchestrator operations.
///
/// `CameraUnavailable`, `ModelUnavailable`, `LivenessTimeout` and
/// `SubmissionFailed` are terminal: the orchestrator is in `Error` by the time
/// the caller sees them. Everything else leaves the state unchanged.
#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(#[from] CameraError),
    #[error("face model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("{0} faces detected, exactly one required")]
    MultipleFacesDetected(usize),
    #[error("descriptor extraction failed: {0}")]
    DescriptorExtractionFailed(String),
    #[error("liveness challenge timed out")]
    LivenessTimeout,
    #[error("submission failed: {0}")]
    SubmissionFailed(String),
    #[error("no frame available")]
    FrameUnavailable,
    #[error("enrollment cancelled")]
    Cancelled,
    #[error("a frame loop iteration is already in flight")]
    IterationInFlight,
    #[error("landmark detection failed: {0}")]
    Detection(#[source] ModelError),
    #[error("still encoding failed: {0}")]
    StillEncoding(#[from] StillError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("operation not valid in state {state:?}: {operation}")]
    InvalidTransition {
        state: OrchestrationState,
        operation: &'static str,
    },
}

impl From<StorageError> for EnrollError {
    fn from(err: StorageError) -> Self {
        EnrollError::SubmissionFailed(err.to_string())
    }
}

/// Why the orchestrator is in `Error`. Cleared by `retry()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    CameraUnavailable(String),
    ModelUnavailable(String),
    LivenessTimeout,
    SubmissionFailed(String),
}

impl FailureReason {
    /// The matching error to hand back to the caller.
    pub(crate) fn to_error(&self) -> EnrollError {
        match self {
            FailureReason::CameraUnavailable(detail) => {
                EnrollError::CameraUnavailable(CameraError::Other(detail.clone()))
            }
            FailureReason::ModelUnavailable(detail) => {
                EnrollError::ModelUnavailable(detail.clone())
            }
            FailureReason::LivenessTimeout => EnrollError::LivenessTimeout,
            FailureReason::SubmissionFailed(detail) => {
                EnrollError::SubmissionFailed(detail.clone())
            }
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::CameraUnavailable(detail) => write!(f, "camera unavailable: {detail}"),
            FailureReason::ModelUnavailable(detail) => write!(f, "AI unavailable: {detail}"),
            FailureReason::LivenessTimeout => write!(f, "liveness timeout"),
            FailureReason::SubmissionFailed(detail) => write!(f, "submission failed: {detail}"),
        }
    }
}
