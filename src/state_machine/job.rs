use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::budget::{Budget, BudgetGovernor};
use super::ledger::{StageLedger, StagePayload, StageResult, StageStatus};
use super::state::{JobState, JobStatus};
use crate::error::JobError;

/// Distinguishes between logic failures and infrastructure failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Stage logic failed (no trades, invalid parameters, rejected result).
    Business(String),
    /// Infrastructure failed (engine crash, timeout, abort).
    System(String),
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Business(msg) => write!(f, "Business failure: {msg}"),
            FailureKind::System(msg) => write!(f, "System failure: {msg}"),
        }
    }
}

/// The result of executing one stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Completed(StagePayload),
    Failed(FailureKind),
}

/// Why a job ended in FAILED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureReason {
    StageFailed {
        stage_number: u32,
        failure: FailureKind,
    },
    Canceled,
    /// The stage ledger rejected a write.
    Integrity { message: String },
    /// A collaborator returned something the core cannot store.
    Executor { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::StageFailed {
                stage_number,
                failure,
            } => write!(f, "stage {stage_number} failed ({failure})"),
            FailureReason::Canceled => write!(f, "canceled"),
            FailureReason::Integrity { message } => write!(f, "ledger integrity: {message}"),
            FailureReason::Executor { message } => write!(f, "executor: {message}"),
        }
    }
}

/// The research workflow a job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Generate candidates, backtest them, select a winner.
    AutoBacktest,
    /// Multi-turn agent run gated by a turn/token budget.
    LabRun,
    ParamOptimization,
}

impl JobKind {
    pub fn default_stages(self) -> &'static [&'static str] {
        match self {
            JobKind::AutoBacktest => &["generate", "backtest", "select"],
            JobKind::LabRun => &["plan", "research", "evaluate"],
            JobKind::ParamOptimization => &["sample", "optimize", "validate"],
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::AutoBacktest => write!(f, "auto_backtest"),
            JobKind::LabRun => write!(f, "lab_run"),
            JobKind::ParamOptimization => write!(f, "param_optimization"),
        }
    }
}

/// Input for creating a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub kind: JobKind,
    pub symbol: String,
    pub strategy: String,
    /// Explicit stage plan. `None` uses the kind's default plan.
    #[serde(default)]
    pub stages: Option<Vec<String>>,
    #[serde(default)]
    pub limit_turns: Option<u64>,
    #[serde(default)]
    pub limit_tokens: Option<u64>,
    /// Opaque parameters forwarded to the stage executor.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl JobSpec {
    pub fn new(kind: JobKind, symbol: impl Into<String>, strategy: impl Into<String>) -> Self {
        Self {
            kind,
            symbol: symbol.into(),
            strategy: strategy.into(),
            stages: None,
            limit_turns: None,
            limit_tokens: None,
            params: serde_json::Value::Null,
        }
    }

    pub fn with_stages<I, S>(mut self, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stages = Some(stages.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_limits(mut self, turns: u64, tokens: u64) -> Self {
        self.limit_turns = Some(turns);
        self.limit_tokens = Some(tokens);
        self
    }

    /// Check required fields and resolve the stage plan.
    pub fn stage_plan(&self) -> Result<Vec<String>, JobError> {
        if self.symbol.trim().is_empty() {
            return Err(JobError::InvalidSpec("symbol is required".into()));
        }
        if self.strategy.trim().is_empty() {
            return Err(JobError::InvalidSpec("strategy is required".into()));
        }

        let plan: Vec<String> = match &self.stages {
            Some(stages) => stages.clone(),
            None => self
                .kind
                .default_stages()
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };
        if plan.is_empty() {
            return Err(JobError::InvalidSpec("stage plan is empty".into()));
        }
        if plan.iter().any(|s| s.trim().is_empty()) {
            return Err(JobError::InvalidSpec("stage names must not be blank".into()));
        }
        Ok(plan)
    }
}

/// Approve/reject verdict produced by a gate evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub approved: bool,
    pub reasons: Vec<String>,
}

impl GateDecision {
    pub fn approve() -> Self {
        Self {
            approved: true,
            reasons: Vec::new(),
        }
    }

    pub fn reject<I, S>(reasons: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            approved: false,
            reasons: reasons.into_iter().map(Into::into).collect(),
        }
    }

    /// Rejections carry at least one reason; approvals carry none.
    pub fn is_consistent(&self) -> bool {
        self.approved == self.reasons.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOutputs {
    /// Payload of the most recent completed stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<StagePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateDecision>,
}

/// One staged, long-running unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub spec: JobSpec,
    pub plan: Vec<String>,
    pub state: JobState,
    pub current_step: Option<String>,
    pub stages: StageLedger,
    pub budget: Budget,
    pub outputs: JobOutputs,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a PENDING job. Fails with `InvalidSpec` when required fields are missing.
    pub fn new(id: String, spec: JobSpec, budget: Budget) -> Result<Self, JobError> {
        let plan = spec.stage_plan()?;
        let now = Utc::now();
        Ok(Self {
            id,
            spec,
            plan,
            state: JobState::Pending,
            current_step: None,
            stages: StageLedger::new(),
            budget,
            outputs: JobOutputs::default(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn status(&self) -> JobStatus {
        self.state.status()
    }

    pub fn needs_confirm(&self) -> bool {
        self.status() == JobStatus::NeedsConfirm
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn budget_exhausted(&self) -> bool {
        BudgetGovernor::is_exhausted(&self.budget)
    }

    /// Name of the next stage to run, or `None` when the plan is done.
    pub fn next_stage_name(&self) -> Option<&str> {
        self.plan.get(self.stages.len()).map(String::as_str)
    }

    pub fn remaining_stages(&self) -> usize {
        self.plan.len().saturating_sub(self.stages.len())
    }

    /// Bump `updated_at`, never moving it backwards.
    pub fn touch(&mut self) {
        self.updated_at = self.updated_at.max(Utc::now());
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id.clone(),
            kind: self.spec.kind,
            symbol: self.spec.symbol.clone(),
            strategy: self.spec.strategy.clone(),
            status: self.status(),
            failure: self.state.failure().cloned(),
            needs_confirm: self.needs_confirm(),
            current_step: self.current_step.clone(),
            stage_plan: self.plan.clone(),
            stages: self.stages.as_slice().to_vec(),
            budget: self.budget,
            outputs: self.outputs.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Immutable, self-consistent view of a job handed to readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: String,
    pub kind: JobKind,
    pub symbol: String,
    pub strategy: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    pub needs_confirm: bool,
    pub current_step: Option<String>,
    pub stage_plan: Vec<String>,
    pub stages: Vec<StageResult>,
    pub budget: Budget,
    pub outputs: JobOutputs,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Number of completed stages out of the planned total.
    pub fn progress(&self) -> (usize, usize) {
        let done = self
            .stages
            .iter()
            .filter(|s| s.status == StageStatus::Completed)
            .count();
        (done, self.stage_plan.len())
    }
}
