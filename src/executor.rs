//! Stage executor seam.
//!
//! The numerical engines (backtests, optimizers, agent turns) live behind
//! [`StageExecutor`]. The core only sees a [`StageReport`]: the outcome plus
//! the turns and tokens the stage consumed.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::state_machine::{FailureKind, JobKind, StageOutcome, StagePayload, StageResult};

/// Job data handed to the executor for one stage.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub kind: JobKind,
    pub symbol: String,
    pub strategy: String,
    pub params: serde_json::Value,
    /// Stages settled before this one, in order.
    pub prior: Vec<StageResult>,
}

#[derive(Debug, Clone)]
pub struct StageRequest {
    pub job_id: String,
    pub stage_number: u32,
    pub stage_name: String,
    pub context: StageContext,
}

/// What an executor reports back for one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub outcome: StageOutcome,
    pub turns: u64,
    pub tokens: u64,
}

impl StageReport {
    pub fn completed(payload: StagePayload) -> Self {
        Self {
            outcome: StageOutcome::Completed(payload),
            turns: 0,
            tokens: 0,
        }
    }

    pub fn failed(kind: FailureKind) -> Self {
        Self {
            outcome: StageOutcome::Failed(kind),
            turns: 0,
            tokens: 0,
        }
    }

    pub fn with_usage(mut self, turns: u64, tokens: u64) -> Self {
        self.turns = turns;
        self.tokens = tokens;
        self
    }
}

/// Runs a single stage of a job.
///
/// Implementations should watch `cancel` and return early once it fires;
/// a report produced after the job was canceled is discarded.
pub trait StageExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        request: StageRequest,
        cancel: CancellationToken,
    ) -> impl Future<Output = StageReport> + Send;
}

/// One scripted stage: wait, then report.
#[derive(Debug, Clone)]
pub struct ScriptedStep {
    pub delay: Duration,
    pub report: StageReport,
}

impl ScriptedStep {
    pub fn new(report: StageReport) -> Self {
        Self {
            delay: Duration::ZERO,
            report,
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Deterministic executor that plays back a fixed script, one step per stage.
///
/// Stages past the end of the script repeat the last step.
#[derive(Debug)]
pub struct ScriptedExecutor {
    steps: Vec<ScriptedStep>,
    calls: AtomicU32,
}

impl ScriptedExecutor {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps,
            calls: AtomicU32::new(0),
        }
    }

    /// A plausible run for the given workflow, with `delay` per stage.
    pub fn demo(kind: JobKind, delay: Duration) -> Self {
        let candidates = || vec!["ema_9_21".to_string(), "ema_12_26".to_string(), "ema_20_50".to_string()];
        let steps = match kind {
            JobKind::AutoBacktest => vec![
                StageReport::completed(StagePayload::Selection {
                    candidates: candidates(),
                    selected: None,
                })
                .with_usage(1, 2_400),
                StageReport::completed(StagePayload::metrics([
                    ("sharpe", 1.42),
                    ("max_drawdown", 0.18),
                    ("win_rate", 0.56),
                    ("trades", 214.0),
                ]))
                .with_usage(1, 5_100),
                StageReport::completed(StagePayload::Selection {
                    candidates: candidates(),
                    selected: Some("ema_12_26".to_string()),
                })
                .with_usage(1, 1_800),
            ],
            JobKind::LabRun => vec![
                StageReport::completed(StagePayload::Opaque {
                    data: serde_json::json!({ "plan": ["scan regimes", "tune stops"] }),
                })
                .with_usage(2, 6_000),
                StageReport::completed(StagePayload::metrics([("sharpe", 1.1), ("max_drawdown", 0.22)]))
                    .with_usage(2, 9_500),
                StageReport::completed(StagePayload::metrics([("sharpe", 1.27), ("max_drawdown", 0.2)]))
                    .with_usage(1, 4_000),
            ],
            JobKind::ParamOptimization => vec![
                StageReport::completed(StagePayload::Selection {
                    candidates: candidates(),
                    selected: None,
                })
                .with_usage(1, 500),
                StageReport::completed(StagePayload::metrics([("sharpe", 1.65), ("max_drawdown", 0.15)]))
                    .with_usage(1, 700),
                StageReport::completed(StagePayload::metrics([("sharpe", 1.31), ("max_drawdown", 0.17)]))
                    .with_usage(1, 300),
            ],
        };
        Self::new(
            steps
                .into_iter()
                .map(|report| ScriptedStep::new(report).after(delay))
                .collect(),
        )
    }

    /// Number of stages executed so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn step_for(&self, stage_number: u32) -> Option<&ScriptedStep> {
        let index = (stage_number as usize).saturating_sub(1);
        self.steps.get(index).or_else(|| self.steps.last())
    }
}

impl StageExecutor for ScriptedExecutor {
    async fn execute(&self, request: StageRequest, cancel: CancellationToken) -> StageReport {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let Some(step) = self.step_for(request.stage_number).cloned() else {
            return StageReport::failed(FailureKind::System("empty script".into()));
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                StageReport::failed(FailureKind::System("aborted".into()))
            }
            _ = tokio::time::sleep(step.delay) => step.report,
        }
    }
}
