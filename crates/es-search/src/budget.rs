//! Cancellation and resource limits for a running search.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared flag another thread can flip to stop a search between candidates.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why a search stopped before reaching SUCCESS or INFEASIBLE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    Cancelled,
    DeadlineExceeded,
    EvaluationLimit,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => f.write_str("search cancelled"),
            Self::DeadlineExceeded => f.write_str("search deadline exceeded"),
            Self::EvaluationLimit => f.write_str("candidate evaluation limit reached"),
        }
    }
}

/// Limits checked before every candidate is sent to the classifier.
#[derive(Debug, Clone, Default)]
pub struct SearchBudget {
    pub cancel: CancelToken,
    /// Wall-clock allowance measured from the start of the search.
    pub deadline: Option<Duration>,
    /// Maximum number of perturbed candidates classified.
    pub max_evaluations: Option<usize>,
}

impl SearchBudget {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_max_evaluations(mut self, max: usize) -> Self {
        self.max_evaluations = Some(max);
        self
    }

    /// How many more candidates may be classified, or why none may.
    pub fn allowance(&self, started: Instant, evaluations: usize) -> Result<usize, StopReason> {
        if self.cancel.is_cancelled() {
            return Err(StopReason::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if started.elapsed() >= deadline {
                return Err(StopReason::DeadlineExceeded);
            }
        }
        match self.max_evaluations {
            Some(max) if evaluations >= max => Err(StopReason::EvaluationLimit),
            Some(max) => Ok(max - evaluations),
            None => Ok(usize::MAX),
        }
    }
}
