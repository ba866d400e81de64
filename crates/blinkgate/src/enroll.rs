//! Drive one enrollment attempt to a final outcome.

use blinkgate_core::{
    CameraProvider, CancelHandle, DescriptorModel, EnrollError, FailureReason, LandmarkModel,
    OrchestrationState, Orchestrator, StorageSink, SubmissionReceipt,
};
use serde::Serialize;
use tokio::time::MissedTickBehavior;

/// How an attempt ended, as printed by `blinkgate enroll`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnrollOutcome {
    Enrolled {
        identity: String,
        receipt: SubmissionReceipt,
        blinks: u32,
    },
    Failed {
        identity: String,
        failure: FailureReason,
    },
    Cancelled {
        identity: String,
    },
    /// No still could be captured before the frames ran out.
    NoCapture {
        identity: String,
        attempts: usize,
    },
}

/// Run `orchestrator` from `Idle` to an outcome.
///
/// `on_started` receives the cancel handle of the new session once the camera
/// is held. Capture is retried once per frame interval, at most
/// `max_capture_attempts` times, unless auto-capture is enabled.
pub async fn run<P, L, D, S>(
    orchestrator: &mut Orchestrator<P, L, D, S>,
    max_capture_attempts: usize,
    on_started: impl FnOnce(CancelHandle),
) -> Result<EnrollOutcome, EnrollError>
where
    P: CameraProvider,
    L: LandmarkModel,
    D: DescriptorModel,
    S: StorageSink,
{
    let identity = orchestrator.identity_id().to_string();

    if let Err(err) = orchestrator.start().await {
        return settle(orchestrator, identity, err);
    }
    let handle = orchestrator.cancel_handle();
    on_started(handle.clone());
    if orchestrator.state() == OrchestrationState::Idle {
        return Ok(EnrollOutcome::Cancelled { identity });
    }

    if !orchestrator.config().auto_capture {
        let attempts = match capture(orchestrator, &handle, max_capture_attempts).await {
            Ok(attempts) => attempts,
            Err(err) => return settle(orchestrator, identity, err),
        };
        match orchestrator.state() {
            OrchestrationState::Challenge => {}
            OrchestrationState::Idle => return Ok(EnrollOutcome::Cancelled { identity }),
            _ => {
                orchestrator.cancel()?;
                return Ok(EnrollOutcome::NoCapture { identity, attempts });
            }
        }
    }

    match orchestrator.run_frame_loop().await {
        Ok(OrchestrationState::Processing) => {}
        Ok(OrchestrationState::Idle) => return Ok(EnrollOutcome::Cancelled { identity }),
        Ok(state) => {
            return Err(EnrollError::InvalidTransition {
                state,
                operation: "run_frame_loop",
            })
        }
        Err(err) => return settle(orchestrator, identity, err),
    }

    let blinks = orchestrator.blink_progress().count;
    match orchestrator.submit().await {
        Ok(receipt) => Ok(EnrollOutcome::Enrolled {
            identity,
            receipt,
            blinks,
        }),
        Err(err) => settle(orchestrator, identity, err),
    }
}

/// Try `capture_still` until it succeeds, the session ends, or the attempt
/// budget runs out. Returns the attempts made.
async fn capture<P, L, D, S>(
    orchestrator: &mut Orchestrator<P, L, D, S>,
    handle: &CancelHandle,
    max_attempts: usize,
) -> Result<usize, EnrollError>
where
    P: CameraProvider,
    L: LandmarkModel,
    D: DescriptorModel,
    S: StorageSink,
{
    let mut ticker = tokio::time::interval(orchestrator.config().frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut attempts = 0;
    while attempts < max_attempts && orchestrator.state() == OrchestrationState::Capturing {
        ticker.tick().await;
        if handle.is_cancelled() {
            orchestrator.cancel()?;
            break;
        }
        attempts += 1;
        match orchestrator.capture_still().await {
            Ok(candidate) => {
                tracing::debug!(%candidate, attempts, "still captured");
            }
            Err(err) if orchestrator.state() == OrchestrationState::Capturing => {
                tracing::debug!(error = %err, attempts, "capture attempt failed");
            }
            Err(EnrollError::Cancelled) => break,
            Err(err) => return Err(err),
        }
    }
    Ok(attempts)
}

/// Map a terminal error to an outcome; anything else propagates.
fn settle<P, L, D, S>(
    orchestrator: &Orchestrator<P, L, D, S>,
    identity: String,
    err: EnrollError,
) -> Result<EnrollOutcome, EnrollError>
where
    P: CameraProvider,
    L: LandmarkModel,
    D: DescriptorModel,
    S: StorageSink,
{
    match orchestrator.failure() {
        Some(failure) if orchestrator.state() == OrchestrationState::Error => {
            Ok(EnrollOutcome::Failed {
                identity,
                failure: failure.clone(),
            })
        }
        _ => Err(err),
    }
}
