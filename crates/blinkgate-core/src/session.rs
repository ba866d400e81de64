//! Identity binding for a single enrollment attempt.
//!
//! The descriptor is bound to a candidate before the liveness challenge
//! starts and cannot be replaced while the challenge runs. A new capture
//! always creates a new candidate with a new id, so a liveness result can
//! never be attached to a descriptor it was not judged against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type CandidateId = Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("descriptor is missing or empty")]
    DescriptorMissing,
    #[error("descriptor has {got} values (expected {expected})")]
    DescriptorLength { expected: usize, got: usize },
    #[error("descriptor contains NaN/Inf values")]
    InvalidDescriptorValue,
    #[error("invalid transition: {0}")]
    InvalidTransition(&'static str),
    #[error("candidate {0} is not the active candidate")]
    StaleCandidate(CandidateId),
    #[error("candidate not ready for submission: {0}")]
    NotReady(&'static str),
}

/// A captured still and its identity descriptor, awaiting liveness.
#[derive(Debug, Clone)]
pub struct EnrollmentCandidate {
    id: CandidateId,
    still_image: Vec<u8>,
    descriptor: Vec<f32>,
    target_identity_id: String,
    created_at: DateTime<Utc>,
    liveness_passed: bool,
}

impl EnrollmentCandidate {
    pub fn id(&self) -> CandidateId {
        self.id
    }

    pub fn still_image(&self) -> &[u8] {
        &self.still_image
    }

    pub fn descriptor(&self) -> &[f32] {
        &self.descriptor
    }

    pub fn target_identity_id(&self) -> &str {
        &self.target_identity_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn liveness_passed(&self) -> bool {
        self.liveness_passed
    }
}

/// The persisted shape of a finished enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionPayload {
    pub identity_id: String,
    #[serde(skip)]
    pub image_bytes: Vec<u8>,
    pub descriptor: Vec<f32>,
    pub captured_at: DateTime<Utc>,
}

/// Holds at most one candidate and whether a challenge is waiting on it.
#[derive(Debug, Default)]
pub struct EnrollmentSession {
    descriptor_len: Option<usize>,
    current: Option<EnrollmentCandidate>,
    awaiting_liveness: bool,
}

impl EnrollmentSession {
    /// `descriptor_len` pins the embedding dimension when the model's output
    /// size is known.
    pub fn new(descriptor_len: Option<usize>) -> Self {
        Self {
            descriptor_len,
            current: None,
            awaiting_liveness: false,
        }
    }

    /// Bind a still and its descriptor into a fresh candidate.
    ///
    /// Any previous candidate is discarded, including one awaiting liveness.
    pub fn bind(
        &mut self,
        target_identity_id: &str,
        still_image: Vec<u8>,
        descriptor: Vec<f32>,
    ) -> Result<&EnrollmentCandidate, SessionError> {
        validate_descriptor(&descriptor, self.descriptor_len)?;

        if let Some(previous) = self.current.take() {
            tracing::debug!(candidate = %previous.id, "discarding previous candidate");
        }
        self.awaiting_liveness = false;

        let candidate = EnrollmentCandidate {
            id: Uuid::new_v4(),
            still_image,
            descriptor,
            target_identity_id: target_identity_id.to_string(),
            created_at: Utc::now(),
            liveness_passed: false,
        };
        tracing::info!(
            candidate = %candidate.id,
            identity = target_identity_id,
            dim = candidate.descriptor.len(),
            "candidate bound"
        );
        Ok(&*self.current.insert(candidate))
    }

    /// Mark `id` as the candidate an active liveness challenge is judging.
    pub fn begin_challenge(&mut self, id: CandidateId) -> Result<(), SessionError> {
        let candidate = self.active(id)?;
        if candidate.liveness_passed {
            return Err(SessionError::InvalidTransition("liveness already marked"));
        }
        self.awaiting_liveness = true;
        Ok(())
    }

    /// The challenge ended without a verdict (timeout, cancel).
    pub fn end_challenge(&mut self) {
        self.awaiting_liveness = false;
    }

    pub fn is_awaiting_liveness(&self) -> bool {
        self.awaiting_liveness
    }

    pub fn mark_liveness_passed(
        &mut self,
        id: CandidateId,
    ) -> Result<&EnrollmentCandidate, SessionError> {
        if !self.awaiting_liveness {
            return Err(SessionError::InvalidTransition(
                "no challenge is awaiting this candidate",
            ));
        }
        let candidate = match self.current.as_mut() {
            Some(c) if c.id == id => c,
            _ => {
                return Err(SessionError::InvalidTransition(
                    "candidate is not awaited by the active challenge",
                ))
            }
        };
        if candidate.liveness_passed {
            return Err(SessionError::InvalidTransition("liveness already marked"));
        }
        candidate.liveness_passed = true;
        self.awaiting_liveness = false;
        tracing::info!(candidate = %id, "liveness passed");
        Ok(&*candidate)
    }

    pub fn to_submission(&self, id: CandidateId) -> Result<SubmissionPayload, SessionError> {
        let candidate = self.active(id)?;
        if candidate.still_image.is_empty() {
            return Err(SessionError::NotReady("still image is empty"));
        }
        if candidate.descriptor.is_empty() {
            return Err(SessionError::NotReady("descriptor is missing"));
        }
        if !candidate.liveness_passed {
            return Err(SessionError::NotReady("liveness not passed"));
        }
        Ok(SubmissionPayload {
            identity_id: candidate.target_identity_id.clone(),
            image_bytes: candidate.still_image.clone(),
            descriptor: candidate.descriptor.clone(),
            captured_at: candidate.created_at,
        })
    }

    pub fn candidate(&self) -> Option<&EnrollmentCandidate> {
        self.current.as_ref()
    }

    /// Drop the candidate, if any.
    pub fn discard(&mut self) {
        if let Some(candidate) = self.current.take() {
            tracing::debug!(candidate = %candidate.id, "candidate discarded");
        }
        self.awaiting_liveness = false;
    }

    fn active(&self, id: CandidateId) -> Result<&EnrollmentCandidate, SessionError> {
        self.current
            .as_ref()
            .filter(|c| c.id == id)
            .ok_or(SessionError::StaleCandidate(id))
    }
}

fn validate_descriptor(values: &[f32], expected: Option<usize>) -> Result<(), SessionError> {
    if values.is_empty() {
        return Err(SessionError::DescriptorMissing);
    }
    if let Some(expected) = expected {
        if values.len() != expected {
            return Err(SessionError::DescriptorLength {
                expected,
                got: values.len(),
            });
        }
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(SessionError::InvalidDescriptorValue);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> Vec<f32> {
        (0..128).map(|i| i as f32 / 128.0).collect()
    }

    fn bound(session: &mut EnrollmentSession) -> CandidateId {
        session
            .bind("emp-42", vec![0xFF, 0xD8, 0xFF], descriptor())
            .unwrap()
            .id()
    }

    #[test]
    fn test_bind_rejects_empty_descriptor() {
        let mut session = EnrollmentSession::new(None);
        let err = session.bind("emp-42", vec![1], vec![]).unwrap_err();
        assert_eq!(err, SessionError::DescriptorMissing);
        assert!(session.candidate().is_none());
    }

    #[test]
    fn test_bind_rejects_wrong_dimension() {
        let mut session = EnrollmentSession::new(Some(128));
        let err = session.bind("emp-42", vec![1], vec![0.5; 64]).unwrap_err();
        assert_eq!(
            err,
            SessionError::DescriptorLength {
                expected: 128,
                got: 64
            }
        );
    }

    #[test]
    fn test_bind_rejects_nan() {
        let mut session = EnrollmentSession::new(None);
        let mut values = descriptor();
        values[7] = f32::NAN;
        let err = session.bind("emp-42", vec![1], values).unwrap_err();
        assert_eq!(err, SessionError::InvalidDescriptorValue);
    }

    #[test]
    fn test_happy_path() {
        let mut session = EnrollmentSession::new(Some(128));
        let id = bound(&mut session);
        session.begin_challenge(id).unwrap();
        assert!(session.is_awaiting_liveness());

        let candidate = session.mark_liveness_passed(id).unwrap();
        assert!(candidate.liveness_passed());
        assert!(!session.is_awaiting_liveness());

        let payload = session.to_submission(id).unwrap();
        assert_eq!(payload.identity_id, "emp-42");
        assert_eq!(payload.descriptor, descriptor());
        assert_eq!(payload.image_bytes, vec![0xFF, 0xD8, 0xFF]);
    }

    #[test]
    fn test_mark_without_challenge_fails() {
        let mut session = EnrollmentSession::new(None);
        let id = bound(&mut session);
        assert!(matches!(
            session.mark_liveness_passed(id),
            Err(SessionError::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_mark_twice_fails() {
        let mut session = EnrollmentSession::new(None);
        let id = bound(&mut session);
        session.begin_challenge(id).unwrap();
        session.mark_liveness_passed(id).unwrap();
        assert!(matches!(
            session.mark_liveness_passed(id),
            Err(SessionError::InvalidTransition(_))
        ));
        assert!(matches!(
            session.begin_challenge(id),
            Err(SessionError::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_rebind_invalidates_prior_candidate() {
        let mut session = EnrollmentSession::new(None);
        let first = bound(&mut session);
        session.begin_challenge(first).unwrap();

        let second = bound(&mut session);
        assert_ne!(first, second);
        assert!(!session.is_awaiting_liveness());

        session.begin_challenge(second).unwrap();
        assert!(matches!(
            session.mark_liveness_passed(first),
            Err(SessionError::InvalidTransition(_))
        ));
        assert_eq!(
            session.to_submission(first),
            Err(SessionError::StaleCandidate(first))
        );
    }

    #[test]
    fn test_to_submission_requires_liveness() {
        let mut session = EnrollmentSession::new(None);
        let id = bound(&mut session);
        assert!(matches!(session.to_submission(id), Err(SessionError::NotReady(_))));

        session.begin_challenge(id).unwrap();
        assert!(matches!(session.to_submission(id), Err(SessionError::NotReady(_))));

        session.end_challenge();
        assert!(matches!(
            session.mark_liveness_passed(id),
            Err(SessionError::InvalidTransition(_))
        ));
        assert!(matches!(session.to_submission(id), Err(SessionError::NotReady(_))));
    }

    #[test]
    fn test_to_submission_requires_image() {
        let mut session = EnrollmentSession::new(None);
        let id = session.bind("emp-42", vec![], descriptor()).unwrap().id();
        session.begin_challenge(id).unwrap();
        session.mark_liveness_passed(id).unwrap();
        assert_eq!(
            session.to_submission(id),
            Err(SessionError::NotReady("still image is empty"))
        );
    }

    #[test]
    fn test_discard_clears_everything() {
        let mut session = EnrollmentSession::new(None);
        let id = bound(&mut session);
        session.begin_challenge(id).unwrap();
        session.discard();
        assert!(session.candidate().is_none());
        assert!(!session.is_awaiting_liveness());
        assert_eq!(session.to_submission(id), Err(SessionError::StaleCandidate(id)));
    }
}
