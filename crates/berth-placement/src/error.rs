//! Error types for allocation runs.

use thiserror::Error;

use crate::step::Trace;

/// Result type alias for allocation operations.
pub type AllocationResult<T> = Result<T, AllocationError>;

/// Why an allocation produced no server.
///
/// Every variant raised after the pipeline started carries the trace
/// accumulated so far.
#[derive(Debug, Error)]
pub enum AllocationError {
    /// The request itself is unusable; no step ran.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Filtering left no candidates. This is an ordinary outcome, not a fault.
    #[error("no allocatable servers found")]
    Exhausted {
        /// Step that removed the last candidate, `None` when none were supplied.
        step: Option<&'static str>,
        trace: Trace,
    },

    /// A step returned output that breaks the step contract.
    #[error("step \"{step}\" violated the step contract: {detail}")]
    ContractViolation {
        step: &'static str,
        detail: String,
        trace: Trace,
    },

    #[error("allocation deadline exceeded before step \"{step}\"")]
    DeadlineExceeded { step: &'static str, trace: Trace },
}

impl AllocationError {
    /// The partial trace, when the pipeline got far enough to record one.
    pub fn trace(&self) -> Option<&Trace> {
        match self {
            AllocationError::InvalidRequest(_) => None,
            AllocationError::Exhausted { trace, .. }
            | AllocationError::ContractViolation { trace, .. }
            | AllocationError::DeadlineExceeded { trace, .. } => Some(trace),
        }
    }
}
