mod budget;
mod job;
mod ledger;
mod state;

pub use budget::{Budget, BudgetGovernor};
pub use job::{
    FailureKind, FailureReason, GateDecision, Job, JobKind, JobOutputs, JobSnapshot, JobSpec,
    StageOutcome,
};
pub use ledger::{StageLedger, StagePayload, StageResult, StageStatus};
pub use state::{JobEvent, JobState, JobStatus, StateMachine, Transition};
