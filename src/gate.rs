//! Gate evaluation over a finished stage chain.

use crate::state_machine::{GateDecision, StagePayload, StageResult, StageStatus};

/// Produces the approve/reject verdict stored on a completed job.
pub trait GateEvaluator: Send + Sync {
    fn evaluate(&self, stages: &[StageResult]) -> GateDecision;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bound {
    AtLeast(f64),
    AtMost(f64),
}

/// Checks metrics of the last completed stage that produced any.
#[derive(Debug, Clone, Default)]
pub struct ThresholdGate {
    rules: Vec<(String, Bound)>,
}

impl ThresholdGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at_least(mut self, metric: impl Into<String>, min: f64) -> Self {
        self.rules.push((metric.into(), Bound::AtLeast(min)));
        self
    }

    pub fn at_most(mut self, metric: impl Into<String>, max: f64) -> Self {
        self.rules.push((metric.into(), Bound::AtMost(max)));
        self
    }
}

impl GateEvaluator for ThresholdGate {
    fn evaluate(&self, stages: &[StageResult]) -> GateDecision {
        let metrics = stages
            .iter()
            .rev()
            .filter(|s| s.status == StageStatus::Completed)
            .filter_map(|s| s.result.as_ref())
            .find(|p| matches!(p, StagePayload::Metrics { .. }));

        let Some(metrics) = metrics else {
            return GateDecision::reject(["no stage produced metrics"]);
        };

        let mut reasons = Vec::new();
        for (name, bound) in &self.rules {
            match (metrics.metric(name), bound) {
                (None, _) => reasons.push(format!("metric {name} missing")),
                (Some(v), Bound::AtLeast(min)) if v < *min => {
                    reasons.push(format!("{name} {v:.2} below minimum {min:.2}"))
                }
                (Some(v), Bound::AtMost(max)) if v > *max => {
                    reasons.push(format!("{name} {v:.2} above maximum {max:.2}"))
                }
                _ => {}
            }
        }

        if reasons.is_empty() {
            GateDecision::approve()
        } else {
            GateDecision::reject(reasons)
        }
    }
}
