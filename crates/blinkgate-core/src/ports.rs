//! Capability interfaces consumed by the orchestrator.
//!
//! Hardware and model access is injected through these traits so the blink
//! detector and state machine can be driven deterministically in tests.
//! The traits use `async fn` and are driven from a single cooperative task;
//! implementations do not need to be `Send`.

#![allow(async_fn_in_trait)]

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::landmarks::FaceLandmarks;
use crate::session::SubmissionPayload;

/// One packed RGB8 video frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Row-major RGB8 pixels, `width * height * 3` bytes.
    pub data: Vec<u8>,
    /// Capture time relative to the start of the stream.
    pub timestamp: Duration,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("camera permission denied")]
    PermissionDenied,
    #[error("camera is in use by another application")]
    Busy,
    #[error("no camera found")]
    NotFound,
    #[error("camera error: {0}")]
    Other(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("model not loaded: {0}")]
    NotLoaded(String),
    #[error("inference failed: {0}")]
    Inference(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage rejected the record: {0}")]
    Rejected(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// A live camera stream. Held by the orchestrator while capturing.
pub trait FrameSource {
    /// Latest frame, or `None` if no frame is available right now.
    fn current_frame(&mut self) -> Option<Frame>;

    /// Stop the stream and free the device.
    fn release(&mut self);
}

/// Opens camera streams.
pub trait CameraProvider {
    type Source: FrameSource;

    async fn acquire(&mut self) -> Result<Self::Source, CameraError>;
}

/// Face landmark detector.
pub trait LandmarkModel {
    /// Load weights. Called on `start()` until it succeeds once.
    async fn initialize(&mut self) -> Result<(), ModelError> {
        Ok(())
    }

    /// All faces found in `frame`. Zero and several faces are both valid.
    async fn detect(&mut self, frame: &Frame) -> Result<Vec<FaceLandmarks>, ModelError>;
}

/// Face identity embedding extractor.
pub trait DescriptorModel {
    async fn initialize(&mut self) -> Result<(), ModelError> {
        Ok(())
    }

    async fn extract(&mut self, frame: &Frame) -> Result<Vec<f32>, ModelError>;
}

/// Where a stored enrollment record ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub url: String,
}

/// Persists finished enrollment records.
pub trait StorageSink {
    async fn submit(&mut self, payload: &SubmissionPayload)
        -> Result<SubmissionReceipt, StorageError>;
}
