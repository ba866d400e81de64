//! Cooperative cancellation and single-flight bookkeeping for the frame loop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Shared between an orchestrator and the cancel handles it hands out.
#[derive(Debug, Default)]
pub(crate) struct LoopControl {
    generation: AtomicU64,
    cancelled: AtomicU64,
    in_flight: AtomicBool,
}

impl LoopControl {
    /// Start a new session generation. Older handles stop applying.
    pub(crate) fn begin_session(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn cancel(&self, generation: u64) -> bool {
        if self.generation() != generation {
            return false;
        }
        self.cancelled.store(generation, Ordering::Release);
        true
    }

    /// True if `generation` is no longer current or was cancelled.
    pub(crate) fn should_stop(&self, generation: u64) -> bool {
        self.generation() != generation || self.cancelled.load(Ordering::Acquire) == generation
    }

    /// Claim the single iteration slot. `None` if an iteration is in flight.
    pub(crate) fn enter_iteration(self: &Arc<Self>) -> Option<IterationGuard> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| IterationGuard {
                control: Arc::clone(self),
            })
    }
}

/// Holds the iteration slot until dropped, including when the iteration's
/// future is dropped mid-await.
pub(crate) struct IterationGuard {
    control: Arc<LoopControl>,
}

impl Drop for IterationGuard {
    fn drop(&mut self) {
        self.control.in_flight.store(false, Ordering::Release);
    }
}

/// Requests cancellation of one orchestration session from another task.
///
/// Bound to the session that was current when the handle was created; once a
/// newer session starts, the handle does nothing.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    control: Arc<LoopControl>,
    generation: u64,
}

impl CancelHandle {
    pub(crate) fn new(control: Arc<LoopControl>) -> Self {
        let generation = control.generation();
        Self {
            control,
            generation,
        }
    }

    /// Ask the frame loop to stop. Returns false if the session is gone.
    pub fn cancel(&self) -> bool {
        self.control.cancel(self.generation)
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.should_stop(self.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_cancels_its_own_generation() {
        let control = Arc::new(LoopControl::default());
        let generation = control.begin_session();
        let handle = CancelHandle::new(control.clone());

        assert!(!control.should_stop(generation));
        assert!(handle.cancel());
        assert!(control.should_stop(generation));
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_stale_handle_is_inert() {
        let control = Arc::new(LoopControl::default());
        control.begin_session();
        let stale = CancelHandle::new(control.clone());

        let current = control.begin_session();
        assert!(!stale.cancel());
        assert!(!control.should_stop(current));
    }

    #[test]
    fn test_new_session_clears_cancellation() {
        let control = Arc::new(LoopControl::default());
        let first = control.begin_session();
        CancelHandle::new(control.clone()).cancel();
        assert!(control.should_stop(first));

        let second = control.begin_session();
        assert!(control.should_stop(first));
        assert!(!control.should_stop(second));
    }

    #[test]
    fn test_single_iteration_slot() {
        let control = Arc::new(LoopControl::default());
        let guard = control.enter_iteration().unwrap();
        assert!(control.enter_iteration().is_none());
        drop(guard);
        assert!(control.enter_iteration().is_some());
    }
}
