use std::fmt;

use serde::{Deserialize, Serialize};

use super::job::{FailureReason, Job};
use crate::error::JobError;

/// Flat job status, used for filtering and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    NeedsConfirm,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "PENDING"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::NeedsConfirm => write!(f, "NEEDS_CONFIRM"),
            JobStatus::Completed => write!(f, "COMPLETED"),
            JobStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// The job state machine.
///
/// PENDING → RUNNING → NEEDS_CONFIRM | COMPLETED | FAILED, and
/// NEEDS_CONFIRM → RUNNING on confirmation. Any non-terminal state may be
/// canceled into FAILED. COMPLETED and FAILED are terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    NeedsConfirm,
    Completed,
    Failed { reason: FailureReason },
}

impl JobState {
    pub fn status(&self) -> JobStatus {
        match self {
            JobState::Pending => JobStatus::Pending,
            JobState::Running => JobStatus::Running,
            JobState::NeedsConfirm => JobStatus::NeedsConfirm,
            JobState::Completed => JobStatus::Completed,
            JobState::Failed { .. } => JobStatus::Failed,
        }
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            JobState::Failed { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Inputs that move a job between states.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// The driver picked the job up.
    Start,
    /// The budget governor reported exhaustion.
    BudgetExhausted,
    /// A human granted more budget.
    Confirmed,
    /// Every planned stage completed.
    StagesFinished,
    Fail(FailureReason),
    Cancel,
}

impl JobEvent {
    fn operation(&self) -> &'static str {
        match self {
            JobEvent::Start => "start",
            JobEvent::BudgetExhausted => "pause",
            JobEvent::Confirmed => "confirm",
            JobEvent::StagesFinished => "complete",
            JobEvent::Fail(_) => "fail",
            JobEvent::Cancel => "cancel",
        }
    }
}

/// A state change that was applied to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Validates and applies state transitions.
pub struct StateMachine;

impl StateMachine {
    /// Compute the state that `event` leads to from `state`, if the edge exists.
    pub fn next(state: &JobState, event: &JobEvent) -> Option<JobState> {
        use JobState::*;

        match (state, event) {
            (Pending, JobEvent::Start) => Some(Running),
            (Running, JobEvent::BudgetExhausted) => Some(NeedsConfirm),
            (Running, JobEvent::StagesFinished) => Some(Completed),
            (Running, JobEvent::Fail(reason)) => Some(Failed {
                reason: reason.clone(),
            }),
            (NeedsConfirm, JobEvent::Confirmed) => Some(Running),
            (Pending | Running | NeedsConfirm, JobEvent::Cancel) => Some(Failed {
                reason: FailureReason::Canceled,
            }),
            _ => None,
        }
    }

    /// Apply `event` to `job`, bumping `updated_at`.
    ///
    /// Illegal edges leave the job untouched and return `InvalidState`.
    pub fn apply(job: &mut Job, event: JobEvent) -> Result<Transition, JobError> {
        let from = job.status();
        let Some(next) = Self::next(&job.state, &event) else {
            return Err(JobError::InvalidState {
                job_id: job.id.clone(),
                status: from,
                operation: event.operation(),
            });
        };

        job.state = next;
        job.touch();
        Ok(Transition {
            from,
            to: job.status(),
        })
    }
}
