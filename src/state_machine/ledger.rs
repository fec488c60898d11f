use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::{FailureKind, StageOutcome};
use crate::error::JobError;

/// Lifecycle of a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn is_settled(self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Failed)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageStatus::Pending => write!(f, "PENDING"),
            StageStatus::Running => write!(f, "RUNNING"),
            StageStatus::Completed => write!(f, "COMPLETED"),
            StageStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Payload produced by a completed stage.
///
/// Known shapes get their own variant; anything else travels as raw JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StagePayload {
    /// Named numeric results, e.g. `sharpe`, `max_drawdown`, `win_rate`.
    Metrics { values: BTreeMap<String, f64> },
    /// Candidate parameter sets and the one picked, if any.
    Selection {
        candidates: Vec<String>,
        selected: Option<String>,
    },
    Opaque { data: serde_json::Value },
}

impl StagePayload {
    pub fn metrics<I, K>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        StagePayload::Metrics {
            values: values.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        match self {
            StagePayload::Metrics { values } => values.get(name).copied(),
            _ => None,
        }
    }
}

/// Recorded outcome of one stage of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_number: u32,
    pub stage_name: String,
    pub status: StageStatus,
    /// Present only when `status` is `COMPLETED`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StagePayload>,
    /// Present only when `status` is `FAILED`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageResult {
    pub fn running(stage_number: u32, stage_name: impl Into<String>) -> Self {
        Self {
            stage_number,
            stage_name: stage_name.into(),
            status: StageStatus::Running,
            result: None,
            failure: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Append-only, gapless record of stage outcomes, numbered from 1.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageLedger {
    entries: Vec<StageResult>,
}

impl StageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a new stage entry.
    ///
    /// The number must be exactly one past the current maximum.
    pub fn append(&mut self, result: StageResult) -> Result<(), JobError> {
        let number = result.stage_number;
        if self.find(number).is_some() {
            return Err(JobError::DuplicateStage(number));
        }
        let expected = self.next_stage_number();
        if number != expected {
            return Err(JobError::OutOfOrder {
                expected,
                got: number,
            });
        }
        self.entries.push(result);
        Ok(())
    }

    /// Moves an unsettled entry to its final status. Settled entries are sealed.
    pub fn settle(
        &mut self,
        stage_number: u32,
        outcome: StageOutcome,
    ) -> Result<&StageResult, JobError> {
        let Some(index) = self.index_of(stage_number) else {
            let expected = self
                .in_flight()
                .map_or_else(|| self.next_stage_number(), |s| s.stage_number);
            return Err(JobError::OutOfOrder {
                expected,
                got: stage_number,
            });
        };
        let entry = &mut self.entries[index];
        if entry.status.is_settled() {
            return Err(JobError::StageSealed(stage_number));
        }

        match outcome {
            StageOutcome::Completed(payload) => {
                entry.status = StageStatus::Completed;
                entry.result = Some(payload);
            }
            StageOutcome::Failed(kind) => {
                entry.status = StageStatus::Failed;
                entry.failure = Some(kind);
            }
        }
        entry.finished_at = Some(Utc::now());
        Ok(entry)
    }

    pub fn find(&self, stage_number: u32) -> Option<&StageResult> {
        self.index_of(stage_number).map(|i| &self.entries[i])
    }

    /// The entry that has been started but not settled, if any.
    pub fn in_flight(&self) -> Option<&StageResult> {
        self.entries.last().filter(|e| !e.status.is_settled())
    }

    pub fn next_stage_number(&self) -> u32 {
        self.entries.len() as u32 + 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn as_slice(&self) -> &[StageResult] {
        &self.entries
    }

    fn index_of(&self, stage_number: u32) -> Option<usize> {
        let index = (stage_number as usize).checked_sub(1)?;
        (index < self.entries.len()).then_some(index)
    }
}
