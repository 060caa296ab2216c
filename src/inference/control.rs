//! Cooperative cancellation and wall-clock budgets for running samplers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::InferenceError;

/// Shared flag that asks running chains to stop at the next iteration boundary.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Cancellation token plus an optional deadline, polled between sampler iterations.
#[derive(Debug, Clone, Default)]
pub struct SamplingControl {
    pub cancellation: CancellationToken,
    pub deadline: Option<Instant>,
}

impl SamplingControl {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cancellation(self, cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            ..self
        }
    }

    /// Impose a wall-clock budget measured from now.
    #[must_use]
    pub fn with_timeout(self, budget: Duration) -> Self {
        Self {
            deadline: Instant::now().checked_add(budget),
            ..self
        }
    }

    /// # Errors
    ///
    /// Returns `InferenceError::Cancelled` or `InferenceError::TimedOut` when the
    /// caller has asked sampling to stop.
    pub fn check(&self) -> Result<(), InferenceError> {
        if self.cancellation.is_cancelled() {
            return Err(InferenceError::Cancelled);
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(InferenceError::TimedOut);
        }
        Ok(())
    }
}
