use thiserror::Error;

use crate::state_machine::JobStatus;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Invalid job spec: {0}")]
    InvalidSpec(String),

    #[error("Cannot {operation} job {job_id} while {status}")]
    InvalidState {
        job_id: String,
        status: JobStatus,
        operation: &'static str,
    },

    #[error("Stage {0} already recorded")]
    DuplicateStage(u32),

    #[error("Stage {got} out of order, expected stage {expected}")]
    OutOfOrder { expected: u32, got: u32 },

    #[error("Stage {0} is already settled")]
    StageSealed(u32),

    #[error("Stage executor failure: {0}")]
    ExecutorFailure(String),
}

impl JobError {
    /// Ledger integrity violations point at an executor or driver bug and
    /// fail the job instead of being corrected.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            JobError::DuplicateStage(_) | JobError::OutOfOrder { .. } | JobError::StageSealed(_)
        )
    }
}

/// Errors surfaced by the polling client.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Gave up after {failures} consecutive failed polls: {last_error}")]
    TooManyFailures { failures: u32, last_error: String },
}
