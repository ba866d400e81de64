//! Capture orchestration: the enrollment workflow as an explicit state machine.
//!
//! ```text
//!   Idle ──start──▶ Capturing ──capture──▶ Challenge ──blinks──▶ Processing ──stored──▶ Success
//!    ▲                 │  │                  │  │                    │
//!    │                 │  └──────failure─────┼──┴──────────────▶ Error ◀──rejected──┘
//!    └─────cancel──────┴─────────────────────┘                    │
//!    ▲                                                            │
//!    └──────────────────────────retry─────────────────────────────┘
//! ```
//!
//! The camera is held exactly while the state is `Capturing` or `Challenge`.
//! Every transition out of those states releases it inside
//! [`Orchestrator::transition`], so no exit path can leak it.
//!
//! The frame loop is cooperative and single-flight. Each iteration reads one
//! frame, runs landmark detection, feeds the blink detector and checks the
//! transition conditions. Cancellation is checked at the top of every
//! iteration and again after every await point.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};

use crate::camera::CameraLease;
use crate::config::{ConfigError, LivenessConfig};
use crate::control::{CancelHandle, IterationGuard, LoopControl};
use crate::error::{EnrollError, FailureReason};
use crate::landmarks::FaceLandmarks;
use crate::liveness::BlinkDetector;
use crate::ports::{
    CameraProvider, DescriptorModel, Frame, LandmarkModel, StorageSink, SubmissionReceipt,
};
use crate::session::{
    CandidateId, EnrollmentCandidate, EnrollmentSession, SessionError, SubmissionPayload,
};
use crate::still::encode_still;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationState {
    Idle,
    Capturing,
    Challenge,
    Processing,
    Success,
    Error,
}

impl OrchestrationState {
    /// Whether the camera must be held in this state.
    pub fn holds_camera(self) -> bool {
        matches!(self, Self::Capturing | Self::Challenge)
    }

    /// The transition table. Anything not listed is illegal.
    pub fn can_transition_to(self, to: OrchestrationState) -> bool {
        use OrchestrationState::*;
        matches!(
            (self, to),
            (Idle, Capturing)
                | (Capturing, Challenge)
                | (Capturing, Error)
                | (Capturing, Idle)
                | (Challenge, Processing)
                | (Challenge, Error)
                | (Challenge, Idle)
                | (Processing, Success)
                | (Processing, Error)
                | (Error, Idle)
        )
    }
}

/// Delivered to observers after every transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    pub from: OrchestrationState,
    pub to: OrchestrationState,
    /// Set when `to` is `Error`.
    pub failure: Option<FailureReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlinkProgress {
    pub count: u32,
    pub required: u32,
}

/// Per-frame feedback for the UI. Never changes the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameHint {
    FaceDetected,
    NoFace,
    MultipleFaces,
    FrameUnavailable,
    ModelError,
}

/// Outcome of one frame loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Still capturing or challenging; schedule another iteration.
    Continue,
    /// The loop has nothing more to do in this state.
    Finished(OrchestrationState),
}

/// The external capabilities an orchestrator drives.
pub struct EnrollmentPorts<P, L, D, S> {
    pub camera: P,
    pub landmarks: L,
    pub descriptors: D,
    pub sink: S,
}

type Observer = Box<dyn FnMut(&StateChange) + Send>;

pub struct Orchestrator<P, L, D, S>
where
    P: CameraProvider,
{
    identity_id: String,
    config: LivenessConfig,
    ports: EnrollmentPorts<P, L, D, S>,
    state: OrchestrationState,
    failure: Option<FailureReason>,
    camera: Option<CameraLease<P::Source>>,
    detector: BlinkDetector,
    session: EnrollmentSession,
    candidate: Option<CandidateId>,
    deadline: Option<Instant>,
    pending: Option<SubmissionPayload>,
    receipt: Option<SubmissionReceipt>,
    consecutive_model_errors: u32,
    models_ready: bool,
    hint: Option<FrameHint>,
    control: Arc<LoopControl>,
    generation: u64,
    observers: Vec<Observer>,
}

impl<P, L, D, S> Orchestrator<P, L, D, S>
where
    P: CameraProvider,
    L: LandmarkModel,
    D: DescriptorModel,
    S: StorageSink,
{
    /// Create an orchestrator enrolling `identity_id`. Starts in `Idle`.
    pub fn new(
        identity_id: impl Into<String>,
        config: LivenessConfig,
        ports: EnrollmentPorts<P, L, D, S>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let detector = BlinkDetector::new(config.blink)?;
        let session = EnrollmentSession::new(config.descriptor_len);
        Ok(Self {
            identity_id: identity_id.into(),
            config,
            ports,
            state: OrchestrationState::Idle,
            failure: None,
            camera: None,
            detector,
            session,
            candidate: None,
            deadline: None,
            pending: None,
            receipt: None,
            consecutive_model_errors: 0,
            models_ready: false,
            hint: None,
            control: Arc::new(LoopControl::default()),
            generation: 0,
            observers: Vec::new(),
        })
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn state(&self) -> OrchestrationState {
        self.state
    }

    /// Why the last attempt failed. `Some` only in `Error`.
    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    pub fn blink_progress(&self) -> BlinkProgress {
        BlinkProgress {
            count: self.detector.blink_count(),
            required: self.config.required_blinks,
        }
    }

    pub fn hint(&self) -> Option<FrameHint> {
        self.hint
    }

    pub fn detector(&self) -> &BlinkDetector {
        &self.detector
    }

    pub fn candidate(&self) -> Option<&EnrollmentCandidate> {
        self.session.candidate()
    }

    /// Where the record was stored. `Some` only in `Success`.
    pub fn receipt(&self) -> Option<&SubmissionReceipt> {
        self.receipt.as_ref()
    }

    pub fn identity_id(&self) -> &str {
        &self.identity_id
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    pub fn ports(&self) -> &EnrollmentPorts<P, L, D, S> {
        &self.ports
    }

    /// Handle for cancelling the current session from another task.
    ///
    /// Take it after `start()`; a handle taken earlier belongs to the previous
    /// session and does nothing.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::new(Arc::clone(&self.control))
    }

    /// Register a callback run after every state transition.
    pub fn on_state_change(&mut self, callback: impl FnMut(&StateChange) + Send + 'static) {
        self.observers.push(Box::new(callback));
    }

    // ── Caller-triggered transitions ─────────────────────────────────────────

    /// `Idle → Capturing`: initialize models and acquire the camera.
    ///
    /// Model or camera failure moves to `Error` and is returned.
    pub async fn start(&mut self) -> Result<(), EnrollError> {
        self.expect_state(&[OrchestrationState::Idle], "start")?;

        self.generation = self.control.begin_session();
        self.detector.reset();
        self.session.discard();
        self.consecutive_model_errors = 0;
        self.hint = None;
        self.receipt = None;
        self.transition(OrchestrationState::Capturing)?;

        if let Err(detail) = self.initialize_models().await {
            tracing::error!(error = %detail, "face models unavailable");
            return Err(self.fail(FailureReason::ModelUnavailable(detail)));
        }
        if self.cancel_requested() {
            return self.abandon();
        }

        match self.ports.camera.acquire().await {
            Ok(source) => {
                self.camera = Some(CameraLease::new(source));
                tracing::info!(generation = self.generation, "camera acquired");
            }
            Err(err) => {
                tracing::error!(error = %err, "camera acquisition failed");
                self.record_failure(FailureReason::CameraUnavailable(err.to_string()));
                return Err(EnrollError::CameraUnavailable(err));
            }
        }
        if self.cancel_requested() {
            return self.abandon();
        }
        Ok(())
    }

    /// Capture the current frame as the enrollment still.
    ///
    /// On success the descriptor is bound to a fresh candidate and the
    /// liveness challenge begins. Failures are transient: the state stays
    /// `Capturing` so the subject can try again.
    pub async fn capture_still(&mut self) -> Result<CandidateId, EnrollError> {
        self.expect_state(&[OrchestrationState::Capturing], "capture_still")?;
        let _slot = self.enter_iteration()?;

        let frame = self.read_frame().ok_or(EnrollError::FrameUnavailable)?;
        let faces = self.detect_faces(&frame).await?;
        if self.cancel_requested() {
            self.abandon()?;
            return Err(EnrollError::Cancelled);
        }
        self.capture_from(frame, faces).await
    }

    /// `Capturing | Challenge → Idle`: release the camera, drop the candidate.
    pub fn cancel(&mut self) -> Result<(), EnrollError> {
        self.expect_state(
            &[OrchestrationState::Capturing, OrchestrationState::Challenge],
            "cancel",
        )?;
        self.cancel_handle().cancel();
        self.abandon()
    }

    /// `Error → Idle`. Does not reuse the previous candidate.
    pub fn retry(&mut self) -> Result<(), EnrollError> {
        self.expect_state(&[OrchestrationState::Error], "retry")?;
        self.failure = None;
        self.transition(OrchestrationState::Idle)
    }

    /// `Processing → Success | Error`: hand the record to the storage sink.
    pub async fn submit(&mut self) -> Result<SubmissionReceipt, EnrollError> {
        self.expect_state(&[OrchestrationState::Processing], "submit")?;
        let payload = self
            .pending
            .take()
            .ok_or(SessionError::NotReady("no pending submission"))?;

        let limit = self.config.submission_timeout;
        let outcome = tokio::time::timeout(limit, self.ports.sink.submit(&payload)).await;
        match outcome {
            Ok(Ok(receipt)) => {
                tracing::info!(
                    identity = %payload.identity_id,
                    url = %receipt.url,
                    "enrollment stored"
                );
                self.receipt = Some(receipt.clone());
                self.transition(OrchestrationState::Success)?;
                Ok(receipt)
            }
            Ok(Err(err)) => {
                tracing::error!(error = %err, "submission rejected");
                Err(self.fail(FailureReason::SubmissionFailed(err.to_string())))
            }
            Err(_) => {
                tracing::error!(timeout = ?limit, "submission timed out");
                Err(self.fail(FailureReason::SubmissionFailed(format!(
                    "timed out after {limit:?}"
                ))))
            }
        }
    }

    // ── Frame loop ───────────────────────────────────────────────────────────

    /// Drive iterations at `frame_interval` until the state leaves
    /// `Capturing`/`Challenge`.
    ///
    /// Returns the state the loop stopped in. Terminal failures (liveness
    /// timeout, repeated model errors) are returned as errors after the
    /// camera has been released.
    pub async fn run_frame_loop(&mut self) -> Result<OrchestrationState, EnrollError> {
        let mut ticker = tokio::time::interval(self.config.frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            match self.step().await? {
                Tick::Continue => {}
                Tick::Finished(state) => {
                    tracing::debug!(state = ?state, "frame loop finished");
                    return Ok(state);
                }
            }
        }
    }

    /// Run one frame loop iteration.
    pub async fn step(&mut self) -> Result<Tick, EnrollError> {
        if !self.state.holds_camera() {
            return Ok(Tick::Finished(self.state));
        }
        let _slot = self.enter_iteration()?;

        if self.cancel_requested() {
            self.abandon()?;
            return Ok(Tick::Finished(self.state));
        }
        if self.state == OrchestrationState::Challenge && self.deadline_passed() {
            return Err(self.challenge_expired());
        }

        let Some(frame) = self.read_frame() else {
            tracing::trace!("no frame available, skipping");
            self.hint = Some(FrameHint::FrameUnavailable);
            return Ok(Tick::Continue);
        };

        let detected = match self.challenge_deadline() {
            Some(deadline) => {
                let bounded = tokio::time::timeout_at(deadline, self.detect_faces(&frame)).await;
                let Ok(detected) = bounded else {
                    return Err(self.challenge_expired());
                };
                detected
            }
            None => self.detect_faces(&frame).await,
        };
        let faces = match detected {
            Ok(faces) => faces,
            Err(err) if self.state == OrchestrationState::Error => return Err(err),
            Err(_) => return Ok(Tick::Continue),
        };
        if self.cancel_requested() {
            self.abandon()?;
            return Ok(Tick::Finished(self.state));
        }

        match self.state {
            OrchestrationState::Capturing => self.capturing_frame(frame, faces).await,
            OrchestrationState::Challenge => self.challenge_frame(&faces),
            state => Ok(Tick::Finished(state)),
        }
    }

    async fn capturing_frame(
        &mut self,
        frame: Frame,
        faces: Vec<FaceLandmarks>,
    ) -> Result<Tick, EnrollError> {
        self.hint = Some(hint_for(faces.len()));
        if !self.config.auto_capture || faces.len() != 1 {
            return Ok(Tick::Continue);
        }

        match self.capture_from(frame, faces).await {
            Ok(_) => Ok(Tick::Continue),
            Err(EnrollError::Cancelled) => Ok(Tick::Finished(self.state)),
            Err(err) => {
                tracing::debug!(error = %err, "auto-capture attempt failed");
                Ok(Tick::Continue)
            }
        }
    }

    fn challenge_frame(&mut self, faces: &[FaceLandmarks]) -> Result<Tick, EnrollError> {
        self.hint = Some(hint_for(faces.len()));
        match faces {
            [] => self.detector.process_frame(None),
            [face] => self.detector.process_frame(Some(face)),
            many => {
                tracing::debug!(faces = many.len(), "ambiguous frame ignored");
            }
        }

        if self.detector.blink_count() >= self.config.required_blinks {
            self.complete_challenge()?;
            return Ok(Tick::Finished(self.state));
        }
        Ok(Tick::Continue)
    }

    // ── Internals ────────────────────────────────────────────────────────────

    /// Bind a candidate from an already-detected frame and enter `Challenge`.
    async fn capture_from(
        &mut self,
        frame: Frame,
        faces: Vec<FaceLandmarks>,
    ) -> Result<CandidateId, EnrollError> {
        self.hint = Some(hint_for(faces.len()));
        match faces.len() {
            0 => return Err(EnrollError::NoFaceDetected),
            1 => {}
            n => return Err(EnrollError::MultipleFacesDetected(n)),
        }

        let descriptor = match self.ports.descriptors.extract(&frame).await {
            Ok(descriptor) => descriptor,
            Err(err) => {
                tracing::warn!(error = %err, "descriptor extraction failed");
                return Err(EnrollError::DescriptorExtractionFailed(err.to_string()));
            }
        };
        if self.cancel_requested() {
            self.abandon()?;
            return Err(EnrollError::Cancelled);
        }

        let still = encode_still(&frame, self.config.still_quality, self.config.mirror_still)?;
        let id = self.session.bind(&self.identity_id, still, descriptor)?.id();
        self.session.begin_challenge(id)?;
        self.candidate = Some(id);
        self.detector.reset();
        self.deadline = Some(Instant::now() + self.config.challenge_deadline);
        self.transition(OrchestrationState::Challenge)?;
        tracing::info!(
            candidate = %id,
            required = self.config.required_blinks,
            deadline = ?self.config.challenge_deadline,
            "liveness challenge started"
        );
        Ok(id)
    }

    /// `Challenge → Processing`. Only reachable with a bound descriptor and
    /// the required blinks observed.
    fn complete_challenge(&mut self) -> Result<(), EnrollError> {
        let id = self
            .candidate
            .ok_or(SessionError::NotReady("no active candidate"))?;
        self.session.mark_liveness_passed(id)?;
        let payload = self.session.to_submission(id)?;
        self.pending = Some(payload);
        self.transition(OrchestrationState::Processing)
    }

    async fn initialize_models(&mut self) -> Result<(), String> {
        if self.models_ready {
            return Ok(());
        }
        let limit = self.config.model_load_timeout;
        let ports = &mut self.ports;
        let init = async {
            ports.landmarks.initialize().await?;
            ports.descriptors.initialize().await
        };
        match tokio::time::timeout(limit, init).await {
            Ok(Ok(())) => {
                self.models_ready = true;
                tracing::info!("face models ready");
                Ok(())
            }
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!("initialization timed out after {limit:?}")),
        }
    }

    /// Detect faces, counting consecutive model failures. Escalates to
    /// `Error` once the budget is spent; earlier failures skip the frame.
    async fn detect_faces(&mut self, frame: &Frame) -> Result<Vec<FaceLandmarks>, EnrollError> {
        match self.ports.landmarks.detect(frame).await {
            Ok(faces) => {
                self.consecutive_model_errors = 0;
                Ok(faces)
            }
            Err(err) => {
                self.consecutive_model_errors += 1;
                self.hint = Some(FrameHint::ModelError);
                let budget = self.config.max_consecutive_model_errors;
                if self.consecutive_model_errors >= budget {
                    tracing::error!(
                        error = %err,
                        failures = budget,
                        "landmark model keeps failing"
                    );
                    return Err(self.fail(FailureReason::ModelUnavailable(format!(
                        "{budget} consecutive detection failures, last: {err}"
                    ))));
                }
                tracing::warn!(
                    error = %err,
                    consecutive = self.consecutive_model_errors,
                    "landmark detection failed, skipping frame"
                );
                Err(EnrollError::Detection(err))
            }
        }
    }

    fn read_frame(&mut self) -> Option<Frame> {
        self.camera.as_mut().and_then(CameraLease::current_frame)
    }

    /// Deadline bounding detection, set only while the challenge runs.
    fn challenge_deadline(&self) -> Option<Instant> {
        self.deadline.filter(|_| self.state == OrchestrationState::Challenge)
    }

    fn challenge_expired(&mut self) -> EnrollError {
        tracing::warn!(
            blinks = self.detector.blink_count(),
            required = self.config.required_blinks,
            "liveness challenge deadline exceeded"
        );
        self.fail(FailureReason::LivenessTimeout)
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn cancel_requested(&self) -> bool {
        self.control.should_stop(self.generation)
    }

    fn enter_iteration(&self) -> Result<IterationGuard, EnrollError> {
        self.control
            .enter_iteration()
            .ok_or(EnrollError::IterationInFlight)
    }

    fn expect_state(
        &self,
        allowed: &[OrchestrationState],
        operation: &'static str,
    ) -> Result<(), EnrollError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(EnrollError::InvalidTransition {
                state: self.state,
                operation,
            })
        }
    }

    /// Cancellation path: back to `Idle` with nothing retained.
    fn abandon(&mut self) -> Result<(), EnrollError> {
        tracing::info!(state = ?self.state, "enrollment cancelled");
        self.transition(OrchestrationState::Idle)
    }

    fn fail(&mut self, reason: FailureReason) -> EnrollError {
        let err = reason.to_error();
        self.record_failure(reason);
        err
    }

    fn record_failure(&mut self, reason: FailureReason) {
        self.failure = Some(reason);
        if let Err(err) = self.transition(OrchestrationState::Error) {
            tracing::error!(error = %err, "could not enter error state");
        }
    }

    /// Apply a transition and its resource side effects, then notify observers.
    fn transition(&mut self, to: OrchestrationState) -> Result<(), EnrollError> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(EnrollError::InvalidTransition {
                state: from,
                operation: "transition",
            });
        }

        if !to.holds_camera() {
            if let Some(mut camera) = self.camera.take() {
                camera.release();
            }
        }
        if to != OrchestrationState::Challenge {
            self.deadline = None;
            self.session.end_challenge();
        }
        if matches!(
            to,
            OrchestrationState::Idle | OrchestrationState::Error | OrchestrationState::Success
        ) {
            self.session.discard();
            self.candidate = None;
            self.pending = None;
        }

        self.state = to;
        tracing::info!(from = ?from, to = ?to, "state transition");

        let change = StateChange {
            from,
            to,
            failure: self.failure.clone().filter(|_| to == OrchestrationState::Error),
        };
        for observer in &mut self.observers {
            observer(&change);
        }
        Ok(())
    }
}

fn hint_for(faces: usize) -> FrameHint {
    match faces {
        0 => FrameHint::NoFace,
        1 => FrameHint::FaceDetected,
        _ => FrameHint::MultipleFaces,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camera_held_only_while_capturing() {
        use OrchestrationState::*;
        for state in [Idle, Processing, Success, Error] {
            assert!(!state.holds_camera());
        }
        assert!(Capturing.holds_camera());
        assert!(Challenge.holds_camera());
    }

    #[test]
    fn test_processing_only_from_challenge() {
        use OrchestrationState::*;
        for from in [Idle, Capturing, Processing, Success, Error] {
            assert!(!from.can_transition_to(Processing), "{from:?}");
        }
        assert!(Challenge.can_transition_to(Processing));
    }

    #[test]
    fn test_retry_leads_to_idle_not_capturing() {
        use OrchestrationState::*;
        assert!(Error.can_transition_to(Idle));
        assert!(!Error.can_transition_to(Capturing));
    }

    #[test]
    fn test_success_is_terminal() {
        use OrchestrationState::*;
        for to in [Idle, Capturing, Challenge, Processing, Error] {
            assert!(!Success.can_transition_to(to));
        }
    }
}
