use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RunledgerConfig;
use crate::error::JobError;
use crate::executor::{StageContext, StageExecutor, StageReport, StageRequest};
use crate::gate::GateEvaluator;
use crate::registry::{JobFilter, JobRegistry};
use crate::state_machine::{
    BudgetGovernor, FailureKind, FailureReason, Job, JobEvent, JobSnapshot, JobSpec, JobStatus,
    StageOutcome, StageResult, StateMachine,
};

/// What the driver should do after taking the job lock.
enum Claim {
    Run(StageRequest),
    Halt,
}

/// Drives jobs through their stages.
///
/// The job lock is held only to claim a stage and to settle it, never while
/// the executor runs, so readers and `cancel` are not held up by a slow stage.
pub struct JobOrchestrator<E> {
    registry: Arc<JobRegistry>,
    executor: Arc<E>,
    gate: Option<Arc<dyn GateEvaluator>>,
    config: Arc<RunledgerConfig>,
}

impl<E> Clone for JobOrchestrator<E> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            executor: Arc::clone(&self.executor),
            gate: self.gate.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

impl<E: StageExecutor> JobOrchestrator<E> {
    pub fn new(registry: Arc<JobRegistry>, executor: E, config: RunledgerConfig) -> Self {
        Self {
            registry,
            executor: Arc::new(executor),
            gate: None,
            config: Arc::new(config),
        }
    }

    /// Evaluate a gate decision once all stages complete.
    pub fn with_gate(mut self, gate: impl GateEvaluator + 'static) -> Self {
        self.gate = Some(Arc::new(gate));
        self
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn create(&self, spec: JobSpec) -> Result<String, JobError> {
        let id = self.registry.create(spec, &self.config.budget)?;
        info!(job_id = %id, "job created");
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Result<JobSnapshot, JobError> {
        self.registry.get(id)
    }

    pub fn list(&self, filter: &JobFilter) -> Vec<JobSnapshot> {
        self.registry.list(filter)
    }

    /// Run stages until the job completes, fails, or hits the budget gate.
    ///
    /// Fails with `InvalidState` when the job is terminal, waiting for
    /// confirmation, or already has a stage in flight.
    pub async fn advance(&self, id: &str) -> Result<JobSnapshot, JobError> {
        let cancel = self.registry.cancel_token(id)?;
        let gate = self.gate.as_deref();
        let mut first = true;

        loop {
            let claim = self
                .registry
                .mutate(id, |job| claim_next_stage(job, first, gate))
                .await?;
            first = false;

            let Claim::Run(request) = claim else {
                break;
            };
            let stage_number = request.stage_number;
            let report = self.run_stage(request, &cancel).await;

            self.registry
                .mutate(id, |job| settle_stage(job, stage_number, report, gate))
                .await?;
        }

        self.registry.get(id)
    }

    /// Grant the budget extension and move a NEEDS_CONFIRM job back to RUNNING.
    ///
    /// The extension is granted only together with the state change, so a
    /// second call for the same episode fails with `InvalidState`. When one
    /// extension does not cover the usage the job goes straight back to
    /// NEEDS_CONFIRM and the next confirmation grants another.
    pub async fn confirm(&self, id: &str) -> Result<JobSnapshot, JobError> {
        self.registry
            .mutate(id, |job| {
                StateMachine::apply(job, JobEvent::Confirmed)?;
                job.budget = BudgetGovernor::grant_extension(&job.budget);
                info!(
                    job_id = %job.id,
                    limit_turns = job.budget.limit_turns,
                    limit_tokens = job.budget.limit_tokens,
                    extensions = job.budget.extensions_granted,
                    "budget extended"
                );
                if job.budget_exhausted() {
                    pause_for_confirmation(job)?;
                }
                Ok(job.snapshot())
            })
            .await
    }

    /// `confirm` followed by `advance`.
    pub async fn confirm_and_resume(&self, id: &str) -> Result<JobSnapshot, JobError> {
        self.confirm(id).await?;
        self.advance(id).await
    }

    /// Fail a live job with reason `Canceled` and abort its in-flight stage.
    pub async fn cancel(&self, id: &str) -> Result<JobSnapshot, JobError> {
        let token = self.registry.cancel_token(id)?;
        let snapshot = self
            .registry
            .mutate(id, |job| {
                StateMachine::apply(job, JobEvent::Cancel)?;
                if let Some(stage_number) = job.stages.in_flight().map(|s| s.stage_number) {
                    job.stages.settle(
                        stage_number,
                        StageOutcome::Failed(FailureKind::System("canceled".into())),
                    )?;
                }
                job.current_step = None;
                Ok(job.snapshot())
            })
            .await?;

        token.cancel();
        info!(job_id = %id, "job canceled");
        Ok(snapshot)
    }

    /// Create a job and start driving it on its own task.
    pub fn submit(
        &self,
        spec: JobSpec,
    ) -> Result<(String, JoinHandle<Result<JobSnapshot, JobError>>), JobError> {
        let id = self.create(spec)?;
        let handle = self.spawn_advance(id.clone());
        Ok((id, handle))
    }

    pub fn spawn_advance(&self, id: String) -> JoinHandle<Result<JobSnapshot, JobError>> {
        let this = self.clone();
        tokio::spawn(async move { this.advance(&id).await })
    }

    pub fn spawn_confirm(&self, id: String) -> JoinHandle<Result<JobSnapshot, JobError>> {
        let this = self.clone();
        tokio::spawn(async move { this.confirm_and_resume(&id).await })
    }

    async fn run_stage(&self, request: StageRequest, cancel: &CancellationToken) -> StageReport {
        let stage_token = cancel.child_token();
        let job_id = request.job_id.clone();
        let stage_number = request.stage_number;
        debug!(job_id = %job_id, stage = stage_number, name = %request.stage_name, "stage started");

        let execution = self.executor.execute(request, stage_token.clone());
        let timed = async {
            match self.config.stage_timeout() {
                Some(limit) => match tokio::time::timeout(limit, execution).await {
                    Ok(report) => report,
                    Err(_) => {
                        stage_token.cancel();
                        StageReport::failed(FailureKind::System(format!(
                            "stage timed out after {}ms",
                            limit.as_millis()
                        )))
                    }
                },
                None => execution.await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(job_id = %job_id, stage = stage_number, "stage aborted");
                StageReport::failed(FailureKind::System("aborted".into()))
            }
            report = timed => report,
        }
    }
}

fn claim_next_stage(
    job: &mut Job,
    first: bool,
    gate: Option<&dyn GateEvaluator>,
) -> Result<Claim, JobError> {
    let reject = |job: &Job| JobError::InvalidState {
        job_id: job.id.clone(),
        status: job.status(),
        operation: "advance",
    };

    match job.status() {
        JobStatus::Pending => {
            StateMachine::apply(job, JobEvent::Start)?;
            info!(job_id = %job.id, kind = %job.spec.kind, "job started");
        }
        JobStatus::Running => {}
        _ if first => return Err(reject(job)),
        _ => return Ok(Claim::Halt),
    }

    // Another driver owns the stage in flight.
    if job.stages.in_flight().is_some() {
        return if first { Err(reject(job)) } else { Ok(Claim::Halt) };
    }

    if job.budget_exhausted() {
        pause_for_confirmation(job)?;
        return Ok(Claim::Halt);
    }

    let Some(stage_name) = job.next_stage_name().map(str::to_owned) else {
        finish(job, gate)?;
        return Ok(Claim::Halt);
    };

    let stage_number = job.stages.next_stage_number();
    if let Err(err) = job.stages.append(StageResult::running(stage_number, &stage_name)) {
        fail_job(job, &err)?;
        return Ok(Claim::Halt);
    }
    job.current_step = Some(stage_name.clone());
    job.touch();

    let settled = job.stages.len() - 1;
    Ok(Claim::Run(StageRequest {
        job_id: job.id.clone(),
        stage_number,
        stage_name,
        context: StageContext {
            kind: job.spec.kind,
            symbol: job.spec.symbol.clone(),
            strategy: job.spec.strategy.clone(),
            params: job.spec.params.clone(),
            prior: job.stages.as_slice()[..settled].to_vec(),
        },
    }))
}

fn settle_stage(
    job: &mut Job,
    stage_number: u32,
    report: StageReport,
    gate: Option<&dyn GateEvaluator>,
) -> Result<(), JobError> {
    if job.is_terminal() {
        debug!(job_id = %job.id, stage = stage_number, "discarding result for terminal job");
        return Ok(());
    }

    let settled = job
        .stages
        .settle(stage_number, report.outcome.clone())
        .map(|_| ());
    if let Err(err) = settled {
        return fail_job(job, &err);
    }
    BudgetGovernor::record_usage(&mut job.budget, report.turns, report.tokens);

    match report.outcome {
        StageOutcome::Failed(failure) => {
            warn!(job_id = %job.id, stage = stage_number, %failure, "stage failed");
            job.current_step = None;
            StateMachine::apply(
                job,
                JobEvent::Fail(FailureReason::StageFailed {
                    stage_number,
                    failure,
                }),
            )?;
        }
        StageOutcome::Completed(payload) => {
            debug!(job_id = %job.id, stage = stage_number, "stage completed");
            job.outputs.last_result = Some(payload);
            if job.budget_exhausted() {
                pause_for_confirmation(job)?;
            } else if job.remaining_stages() == 0 {
                finish(job, gate)?;
            } else {
                job.touch();
            }
        }
    }
    Ok(())
}

fn pause_for_confirmation(job: &mut Job) -> Result<(), JobError> {
    StateMachine::apply(job, JobEvent::BudgetExhausted)?;
    info!(
        job_id = %job.id,
        used_turns = job.budget.used_turns,
        limit_turns = job.budget.limit_turns,
        used_tokens = job.budget.used_tokens,
        limit_tokens = job.budget.limit_tokens,
        "budget exhausted, awaiting confirmation"
    );
    Ok(())
}

fn finish(job: &mut Job, gate: Option<&dyn GateEvaluator>) -> Result<(), JobError> {
    job.current_step = None;
    if let Some(gate) = gate {
        let decision = gate.evaluate(job.stages.as_slice());
        if !decision.is_consistent() {
            debug!(job_id = %job.id, ?decision, "inconsistent gate decision");
            return fail_job(
                job,
                &JobError::ExecutorFailure("gate decision reasons do not match verdict".into()),
            );
        }
        job.outputs.gate = Some(decision);
    }
    StateMachine::apply(job, JobEvent::StagesFinished)?;
    info!(job_id = %job.id, stages = job.stages.len(), "job completed");
    Ok(())
}

/// Integrity violations are recorded as such; anything else is blamed on the
/// executor side.
fn fail_job(job: &mut Job, err: &JobError) -> Result<(), JobError> {
    let message = err.to_string();
    let reason = if err.is_integrity_violation() {
        error!(job_id = %job.id, %err, "stage ledger integrity violation");
        FailureReason::Integrity { message }
    } else {
        error!(job_id = %job.id, %err, "job failed");
        FailureReason::Executor { message }
    };
    job.current_step = None;
    StateMachine::apply(job, JobEvent::Fail(reason))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ScriptedExecutor, ScriptedStep};
    use crate::gate::ThresholdGate;
    use crate::state_machine::{GateDecision, JobKind, StagePayload, StageStatus};
    use std::time::Duration;

    fn metrics(sharpe: f64) -> StagePayload {
        StagePayload::metrics([("sharpe", sharpe), ("max_drawdown", 0.1)])
    }

    fn ok(turns: u64, tokens: u64) -> ScriptedStep {
        ScriptedStep::new(StageReport::completed(metrics(1.5)).with_usage(turns, tokens))
    }

    fn orchestrator(steps: Vec<ScriptedStep>) -> JobOrchestrator<ScriptedExecutor> {
        JobOrchestrator::new(
            Arc::new(JobRegistry::new()),
            ScriptedExecutor::new(steps),
            RunledgerConfig::default(),
        )
    }

    fn spec() -> JobSpec {
        JobSpec::new(JobKind::AutoBacktest, "BTC-USDT-SWAP", "vegas")
    }

    async fn wait_for(orch: &JobOrchestrator<ScriptedExecutor>, id: &str, f: impl Fn(&JobSnapshot) -> bool) {
        for _ in 0..500 {
            if f(&orch.get(id).unwrap()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition never reached");
    }

    #[tokio::test]
    async fn three_stages_complete() {
        let orch = orchestrator(vec![ok(1, 100), ok(1, 100), ok(1, 100)]);
        let id = orch.create(spec()).unwrap();

        let snap = orch.advance(&id).await.unwrap();
        assert_eq!(snap.status, JobStatus::Completed);
        assert_eq!(snap.stages.len(), 3);
        assert!(snap.stages.iter().all(|s| s.status == StageStatus::Completed && s.result.is_some()));
        assert_eq!(snap.budget.used_turns, 3);
        assert_eq!(snap.budget.used_tokens, 300);
        assert!(snap.current_step.is_none());
        assert!(!snap.needs_confirm);
        assert_eq!(orch.executor().calls(), 3);
    }

    #[tokio::test]
    async fn budget_gate_pauses_then_resumes_at_next_stage() {
        let orch = orchestrator(vec![ok(2, 100), ok(1, 100), ok(1, 100)]);
        let id = orch.create(spec().with_limits(1, 15_000)).unwrap();

        let snap = orch.advance(&id).await.unwrap();
        assert_eq!(snap.status, JobStatus::NeedsConfirm);
        assert!(snap.needs_confirm);
        assert_eq!(snap.stages.len(), 1);

        let confirmed = orch.confirm(&id).await.unwrap();
        assert_eq!(confirmed.status, JobStatus::Running);
        assert_eq!(confirmed.budget.limit_turns, 4);
        assert_eq!(confirmed.budget.used_turns, 2);
        assert_eq!(confirmed.stages.len(), 1);

        let done = orch.advance(&id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.stages[1].stage_number, 2);
        assert_eq!(done.stages.len(), 3);
        assert_eq!(orch.executor().calls(), 3);
    }

    #[tokio::test]
    async fn failing_stage_fails_job() {
        let orch = orchestrator(vec![
            ok(1, 100),
            ScriptedStep::new(StageReport::failed(FailureKind::Business("no trades".into()))),
            ok(1, 100),
        ]);
        let id = orch.create(spec()).unwrap();

        let snap = orch.advance(&id).await.unwrap();
        assert_eq!(snap.status, JobStatus::Failed);
        assert_eq!(snap.stages.len(), 2);
        assert_eq!(snap.stages[1].status, StageStatus::Failed);
        assert!(snap.stages[1].result.is_none());
        assert_eq!(
            snap.failure,
            Some(FailureReason::StageFailed {
                stage_number: 2,
                failure: FailureKind::Business("no trades".into()),
            })
        );
        assert_eq!(orch.executor().calls(), 2);
    }

    #[tokio::test]
    async fn second_confirm_is_rejected_and_grants_once() {
        let orch = orchestrator(vec![ok(5, 100)]);
        let id = orch.create(spec().with_limits(3, 15_000)).unwrap();
        orch.advance(&id).await.unwrap();

        orch.confirm(&id).await.unwrap();
        let err = orch.confirm(&id).await.unwrap_err();
        assert!(matches!(
            err,
            JobError::InvalidState {
                status: JobStatus::Running,
                operation: "confirm",
                ..
            }
        ));

        let snap = orch.get(&id).unwrap();
        assert_eq!(snap.budget.extensions_granted, 1);
        assert_eq!(snap.budget.limit_turns, 6);
        assert_eq!(snap.budget.used_turns, 5);
    }

    #[tokio::test]
    async fn confirm_that_does_not_cover_usage_pauses_again() {
        let orch = orchestrator(vec![ok(9, 100), ok(1, 100)]);
        let id = orch.create(spec().with_limits(1, 15_000)).unwrap();
        orch.advance(&id).await.unwrap();

        let snap = orch.confirm(&id).await.unwrap();
        assert_eq!(snap.status, JobStatus::NeedsConfirm);
        assert!(snap.needs_confirm);
        assert_eq!(snap.budget.limit_turns, 4);
        assert_eq!(snap.budget.extensions_granted, 1);
        assert_eq!(orch.get(&id).unwrap(), snap);

        orch.confirm(&id).await.unwrap();
        let snap = orch.confirm(&id).await.unwrap();
        assert_eq!(snap.status, JobStatus::Running);
        assert!(!snap.needs_confirm);
        assert_eq!(snap.budget.limit_turns, 10);
        assert_eq!(snap.budget.extensions_granted, 3);

        // Stage 2 brings usage to the limit, stage 3 goes past it.
        let snap = orch.advance(&id).await.unwrap();
        assert_eq!(snap.status, JobStatus::NeedsConfirm);
        assert_eq!(snap.stages.len(), 3);
        assert_eq!(snap.budget.used_turns, 11);
    }

    #[tokio::test]
    async fn advance_rejects_gated_terminal_and_unknown_jobs() {
        let orch = orchestrator(vec![ok(9, 100)]);
        let id = orch.create(spec().with_limits(1, 15_000)).unwrap();
        orch.advance(&id).await.unwrap();

        let err = orch.advance(&id).await.unwrap_err();
        assert!(matches!(
            err,
            JobError::InvalidState {
                status: JobStatus::NeedsConfirm,
                ..
            }
        ));

        orch.cancel(&id).await.unwrap();
        assert!(matches!(
            orch.advance(&id).await,
            Err(JobError::InvalidState {
                status: JobStatus::Failed,
                ..
            })
        ));
        assert!(matches!(orch.advance("missing").await, Err(JobError::NotFound(_))));
        assert!(matches!(orch.confirm("missing").await, Err(JobError::NotFound(_))));
    }

    #[tokio::test]
    async fn exhaustion_after_last_stage_completes_on_confirm() {
        let orch = orchestrator(vec![ok(1, 100), ok(1, 100), ok(2, 100)]);
        let id = orch.create(spec().with_limits(3, 15_000)).unwrap();

        let snap = orch.advance(&id).await.unwrap();
        assert_eq!(snap.status, JobStatus::NeedsConfirm);
        assert_eq!(snap.stages.len(), 3);

        let done = orch.confirm_and_resume(&id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.stages.len(), 3);
        assert_eq!(orch.executor().calls(), 3);
    }

    #[tokio::test]
    async fn gate_decision_is_stored() {
        let orch = orchestrator(vec![
            ScriptedStep::new(StageReport::completed(metrics(0.4))),
        ])
        .with_gate(ThresholdGate::new().at_least("sharpe", 1.0));
        let id = orch.create(spec().with_stages(["backtest"])).unwrap();

        let snap = orch.advance(&id).await.unwrap();
        assert_eq!(snap.status, JobStatus::Completed);
        let gate = snap.outputs.gate.unwrap();
        assert!(!gate.approved);
        assert_eq!(gate.reasons, vec!["sharpe 0.40 below minimum 1.00".to_string()]);
        assert_eq!(snap.outputs.last_result, Some(metrics(0.4)));
    }

    struct BrokenGate;

    impl GateEvaluator for BrokenGate {
        fn evaluate(&self, _stages: &[StageResult]) -> GateDecision {
            GateDecision::reject(Vec::<String>::new())
        }
    }

    #[tokio::test]
    async fn inconsistent_gate_fails_job() {
        let orch = orchestrator(vec![ok(1, 1)]).with_gate(BrokenGate);
        let id = orch.create(spec().with_stages(["only"])).unwrap();

        let snap = orch.advance(&id).await.unwrap();
        assert_eq!(snap.status, JobStatus::Failed);
        assert!(matches!(
            &snap.failure,
            Some(FailureReason::Executor { message }) if message.starts_with("Stage executor failure")
        ));
        assert!(snap.outputs.gate.is_none());
    }

    #[tokio::test]
    async fn stage_timeout_fails_stage() {
        let config: RunledgerConfig = toml::from_str("stage_timeout_ms = 20").unwrap();
        let orch = JobOrchestrator::new(
            Arc::new(JobRegistry::new()),
            ScriptedExecutor::new(vec![ok(1, 1).after(Duration::from_secs(30))]),
            config,
        );
        let id = orch.create(spec()).unwrap();

        let snap = orch.advance(&id).await.unwrap();
        assert_eq!(snap.status, JobStatus::Failed);
        assert_eq!(snap.stages.len(), 1);
        assert!(matches!(
            &snap.stages[0].failure,
            Some(FailureKind::System(msg)) if msg.contains("timed out")
        ));
    }

    #[tokio::test]
    async fn cancel_aborts_in_flight_stage() {
        let orch = orchestrator(vec![ok(1, 1).after(Duration::from_secs(30))]);
        let id = orch.create(spec()).unwrap();
        let handle = orch.spawn_advance(id.clone());

        wait_for(&orch, &id, |s| {
            s.stages.first().is_some_and(|st| st.status == StageStatus::Running)
        })
        .await;
        assert!(orch.advance(&id).await.is_err());

        let canceled = orch.cancel(&id).await.unwrap();
        assert_eq!(canceled.status, JobStatus::Failed);
        assert_eq!(canceled.failure, Some(FailureReason::Canceled));
        assert_eq!(canceled.stages[0].status, StageStatus::Failed);

        let finished = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(finished.status, JobStatus::Failed);
        assert_eq!(finished.stages.len(), 1);
        assert_eq!(finished.budget.used_turns, 0);

        assert!(matches!(
            orch.cancel(&id).await,
            Err(JobError::InvalidState {
                operation: "cancel",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn cancel_pending_job() {
        let orch = orchestrator(vec![ok(1, 1)]);
        let id = orch.create(spec()).unwrap();
        let snap = orch.cancel(&id).await.unwrap();
        assert_eq!(snap.failure, Some(FailureReason::Canceled));
        assert!(snap.stages.is_empty());
        assert_eq!(orch.executor().calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_jobs_run_independently() {
        let orch = orchestrator(vec![ok(1, 10).after(Duration::from_millis(2))]);
        let mut handles = Vec::new();
        for _ in 0..20 {
            let (_, handle) = orch.submit(spec()).unwrap();
            handles.push(handle);
        }
        for handle in handles {
            let snap = handle.await.unwrap().unwrap();
            assert_eq!(snap.status, JobStatus::Completed);
            assert_eq!(snap.stages.len(), 3);
        }
        assert_eq!(
            orch.list(&JobFilter::all().with_status(JobStatus::Completed)).len(),
            20
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_advance_and_confirm_stay_consistent() {
        for _ in 0..10 {
            let orch = orchestrator(vec![ok(2, 10).after(Duration::from_millis(1))]);
            let id = orch
                .create(spec().with_stages(["s1", "s2", "s3", "s4", "s5"]).with_limits(1, 1_000_000))
                .unwrap();

            let mut confirms = 0u32;
            for _ in 0..200 {
                if orch.get(&id).unwrap().is_terminal() {
                    break;
                }
                let mut advances = Vec::new();
                let mut confirmations = Vec::new();
                for _ in 0..6 {
                    advances.push(orch.spawn_advance(id.clone()));
                    let this = orch.clone();
                    let id = id.clone();
                    confirmations.push(tokio::spawn(async move { this.confirm(&id).await }));
                }
                for handle in advances {
                    let _ = handle.await.unwrap();
                }
                for handle in confirmations {
                    if handle.await.unwrap().is_ok() {
                        confirms += 1;
                    }
                }
            }

            let snap = orch.get(&id).unwrap();
            assert_eq!(snap.status, JobStatus::Completed);
            assert_eq!(snap.stages.len(), 5);
            for (i, stage) in snap.stages.iter().enumerate() {
                assert_eq!(stage.stage_number, i as u32 + 1);
                assert_eq!(stage.status, StageStatus::Completed);
            }
            assert_eq!(snap.budget.extensions_granted, confirms);
            assert_eq!(snap.budget.limit_turns, 1 + 3 * u64::from(confirms));
            assert_eq!(snap.budget.used_turns, 10);
            assert_eq!(orch.executor().calls(), 5);
        }
    }
}
