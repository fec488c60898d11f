//! Client side of the polling contract.
//!
//! A [`JobPoller`] repeatedly fetches a job's snapshot until it reaches a
//! terminal status. Each fresh snapshot is emitted exactly once and in
//! order; duplicates and snapshots older than one already seen are dropped.
//! Transient fetch failures, including fetches that outlast
//! `fetch_timeout`, are skipped until more than `max_consecutive_failures`
//! happen in a row.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{JobError, PollError};
use crate::registry::JobRegistry;
use crate::state_machine::{JobSnapshot, JobStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    /// Delay between polls while the job is pending or running.
    pub interval: Duration,
    /// Delay between polls while the job waits for confirmation.
    pub confirm_interval: Duration,
    pub max_consecutive_failures: u32,
    /// Wait after the first COMPLETED observation before reporting completion.
    pub completion_grace: Duration,
    pub fetch_timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            confirm_interval: Duration::from_secs(2),
            max_consecutive_failures: 5,
            completion_grace: Duration::from_millis(1_500),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("transient fetch failure: {0}")]
    Transient(String),
}

/// Read path a poller fetches snapshots from.
pub trait SnapshotSource: Send + Sync {
    fn fetch(&self, job_id: &str) -> impl Future<Output = Result<JobSnapshot, FetchError>> + Send;
}

impl SnapshotSource for JobRegistry {
    async fn fetch(&self, job_id: &str) -> Result<JobSnapshot, FetchError> {
        self.get(job_id).map_err(|err| match err {
            JobError::NotFound(id) => FetchError::NotFound(id),
            other => FetchError::Transient(other.to_string()),
        })
    }
}

impl<T: SnapshotSource + ?Sized> SnapshotSource for Arc<T> {
    fn fetch(&self, job_id: &str) -> impl Future<Output = Result<JobSnapshot, FetchError>> + Send {
        (**self).fetch(job_id)
    }
}

/// Classification of one poll result.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// Newer than anything seen so far.
    Fresh(JobSnapshot),
    /// Identical to the last snapshot.
    Unchanged,
    /// Older than the last snapshot; dropped.
    Stale,
    /// Transient failure, nothing to show this tick.
    Missed { consecutive: u32 },
}

/// Reconciles fetched snapshots against what the client already rendered.
#[derive(Debug)]
pub struct PollTracker {
    last: Option<JobSnapshot>,
    consecutive_failures: u32,
    max_failures: u32,
}

impl PollTracker {
    pub fn new(max_failures: u32) -> Self {
        Self {
            last: None,
            consecutive_failures: 0,
            max_failures,
        }
    }

    pub fn last(&self) -> Option<&JobSnapshot> {
        self.last.as_ref()
    }

    pub fn observe(
        &mut self,
        fetched: Result<JobSnapshot, FetchError>,
    ) -> Result<Observation, PollError> {
        let snapshot = match fetched {
            Ok(snapshot) => snapshot,
            Err(FetchError::NotFound(id)) => return Err(PollError::NotFound(id)),
            Err(FetchError::Transient(reason)) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures > self.max_failures {
                    return Err(PollError::TooManyFailures {
                        failures: self.consecutive_failures,
                        last_error: reason,
                    });
                }
                return Ok(Observation::Missed {
                    consecutive: self.consecutive_failures,
                });
            }
        };
        self.consecutive_failures = 0;

        if let Some(last) = &self.last {
            if snapshot == *last {
                return Ok(Observation::Unchanged);
            }
            if snapshot.updated_at < last.updated_at || snapshot.stages.len() < last.stages.len() {
                return Ok(Observation::Stale);
            }
        }
        self.last = Some(snapshot.clone());
        Ok(Observation::Fresh(snapshot))
    }
}

/// Final result of watching a job.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Reported only after the completion grace period has passed.
    Completed(JobSnapshot),
    Failed(JobSnapshot),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    Update(JobSnapshot),
    Finished(PollOutcome),
}

pub struct JobPoller<S> {
    source: S,
    config: PollConfig,
}

impl<S: SnapshotSource> JobPoller<S> {
    pub fn new(source: S, config: PollConfig) -> Self {
        Self { source, config }
    }

    pub fn watch(&self, job_id: impl Into<String>) -> Watch<'_, S> {
        Watch {
            poller: self,
            job_id: job_id.into(),
            tracker: PollTracker::new(self.config.max_consecutive_failures),
            next_delay: None,
            pending: None,
            done: false,
        }
    }

    /// Poll until terminal, calling `on_update` for every fresh snapshot.
    pub async fn watch_until_terminal<F>(
        &self,
        job_id: impl Into<String>,
        mut on_update: F,
    ) -> Result<PollOutcome, PollError>
    where
        F: FnMut(&JobSnapshot),
    {
        let mut watch = self.watch(job_id);
        loop {
            match watch.next_event().await? {
                Some(PollEvent::Update(snapshot)) => on_update(&snapshot),
                Some(PollEvent::Finished(outcome)) => return Ok(outcome),
                None => unreachable!("watch ends with Finished"),
            }
        }
    }
}

/// Step-by-step view of one job's polling session.
pub struct Watch<'a, S> {
    poller: &'a JobPoller<S>,
    job_id: String,
    tracker: PollTracker,
    next_delay: Option<Duration>,
    pending: Option<PollOutcome>,
    done: bool,
}

impl<S: SnapshotSource> Watch<'_, S> {
    /// Wait for the next fresh snapshot or the final outcome.
    ///
    /// Returns `Ok(None)` once the outcome has been delivered.
    pub async fn next_event(&mut self) -> Result<Option<PollEvent>, PollError> {
        if self.done {
            return Ok(None);
        }
        if let Some(outcome) = self.pending.take() {
            if matches!(outcome, PollOutcome::Completed(_)) {
                tokio::time::sleep(self.poller.config.completion_grace).await;
            }
            self.done = true;
            return Ok(Some(PollEvent::Finished(outcome)));
        }

        loop {
            if let Some(delay) = self.next_delay.take() {
                tokio::time::sleep(delay).await;
            }
            let limit = self.poller.config.fetch_timeout;
            let fetched = tokio::time::timeout(limit, self.poller.source.fetch(&self.job_id))
                .await
                .unwrap_or_else(|_| {
                    Err(FetchError::Transient(format!(
                        "fetch timed out after {}ms",
                        limit.as_millis()
                    )))
                });
            let observation = self.tracker.observe(fetched).inspect_err(|err| {
                warn!(job_id = %self.job_id, %err, "polling stopped");
            })?;
            self.next_delay = Some(self.delay_for_last());

            match observation {
                Observation::Fresh(snapshot) => {
                    match snapshot.status {
                        JobStatus::Completed => {
                            self.pending = Some(PollOutcome::Completed(snapshot.clone()))
                        }
                        JobStatus::Failed => {
                            self.pending = Some(PollOutcome::Failed(snapshot.clone()))
                        }
                        _ => {}
                    }
                    return Ok(Some(PollEvent::Update(snapshot)));
                }
                Observation::Missed { consecutive } => {
                    debug!(job_id = %self.job_id, consecutive, "poll missed");
                }
                Observation::Stale => {
                    debug!(job_id = %self.job_id, "dropped stale snapshot");
                }
                Observation::Unchanged => {}
            }
        }
    }

    fn delay_for_last(&self) -> Duration {
        match self.tracker.last().map(|s| s.status) {
            Some(JobStatus::NeedsConfirm) => self.poller.config.confirm_interval,
            _ => self.poller.config.interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunledgerConfig;
    use crate::executor::{ScriptedExecutor, ScriptedStep, StageReport};
    use crate::orchestrator::JobOrchestrator;
    use crate::state_machine::{
        Budget, FailureReason, Job, JobKind, JobSpec, JobState, StagePayload, StageResult,
    };
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn snapshot(state: JobState, offset_ms: i64, stages: u32) -> JobSnapshot {
        let spec = JobSpec::new(JobKind::LabRun, "BTC-USDT", "lab");
        let base = chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let mut job = Job::new("job-1".into(), spec, Budget::new(3, 15_000, 3, 15_000)).unwrap();
        for n in 1..=stages {
            let mut stage = StageResult::running(n, format!("s{n}"));
            stage.started_at = base;
            job.stages.append(stage).unwrap();
        }
        job.state = state;
        job.created_at = base;
        job.updated_at = base + chrono::Duration::milliseconds(offset_ms);
        job.snapshot()
    }

    fn fast_config() -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(1),
            confirm_interval: Duration::from_millis(1),
            max_consecutive_failures: 2,
            completion_grace: Duration::from_millis(40),
            fetch_timeout: Duration::from_secs(1),
        }
    }

    struct ScriptedSource {
        responses: Mutex<VecDeque<Result<JobSnapshot, FetchError>>>,
        fetches: AtomicU32,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<JobSnapshot, FetchError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                fetches: AtomicU32::new(0),
            }
        }
    }

    impl SnapshotSource for ScriptedSource {
        async fn fetch(&self, _job_id: &str) -> Result<JobSnapshot, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(FetchError::Transient("script exhausted".into())))
        }
    }

    /// Leaves the first `stalls` fetches pending forever, then answers.
    struct StallingSource {
        stalls: AtomicU32,
        snapshot: JobSnapshot,
        fetches: AtomicU32,
    }

    impl SnapshotSource for StallingSource {
        async fn fetch(&self, _job_id: &str) -> Result<JobSnapshot, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let stalled = self
                .stalls
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if stalled {
                std::future::pending::<()>().await;
            }
            Ok(self.snapshot.clone())
        }
    }

    fn stalling(stalls: u32, snapshot: JobSnapshot) -> StallingSource {
        StallingSource {
            stalls: AtomicU32::new(stalls),
            snapshot,
            fetches: AtomicU32::new(0),
        }
    }

    #[test]
    fn tracker_drops_duplicates_and_stale() {
        let mut tracker = PollTracker::new(3);
        let first = snapshot(JobState::Running, 10, 1);

        assert!(matches!(tracker.observe(Ok(first.clone())), Ok(Observation::Fresh(_))));
        assert_eq!(tracker.observe(Ok(first.clone())).unwrap(), Observation::Unchanged);

        let older = snapshot(JobState::Pending, 5, 0);
        assert_eq!(tracker.observe(Ok(older)).unwrap(), Observation::Stale);
        assert_eq!(tracker.last(), Some(&first));

        let newer = snapshot(JobState::Running, 20, 2);
        assert!(matches!(tracker.observe(Ok(newer)), Ok(Observation::Fresh(s)) if s.stages.len() == 2));
    }

    #[test]
    fn tracker_gives_up_after_threshold() {
        let mut tracker = PollTracker::new(2);
        let transient = || Err(FetchError::Transient("502".into()));

        assert_eq!(tracker.observe(transient()).unwrap(), Observation::Missed { consecutive: 1 });
        assert_eq!(tracker.observe(transient()).unwrap(), Observation::Missed { consecutive: 2 });
        let err = tracker.observe(transient()).unwrap_err();
        assert!(matches!(err, PollError::TooManyFailures { failures: 3, .. }));
    }

    #[test]
    fn tracker_resets_failures_on_success() {
        let mut tracker = PollTracker::new(1);
        tracker.observe(Err(FetchError::Transient("timeout".into()))).unwrap();
        tracker.observe(Ok(snapshot(JobState::Running, 1, 0))).unwrap();
        assert_eq!(
            tracker.observe(Err(FetchError::Transient("timeout".into()))).unwrap(),
            Observation::Missed { consecutive: 1 }
        );
    }

    #[test]
    fn tracker_surfaces_not_found() {
        let mut tracker = PollTracker::new(5);
        let err = tracker.observe(Err(FetchError::NotFound("gone".into()))).unwrap_err();
        assert!(matches!(err, PollError::NotFound(id) if id == "gone"));
    }

    #[tokio::test]
    async fn watch_emits_in_order_and_stops_at_completion() {
        let source = ScriptedSource::new(vec![
            Ok(snapshot(JobState::Running, 1, 1)),
            Err(FetchError::Transient("503".into())),
            Ok(snapshot(JobState::Running, 1, 1)),
            Ok(snapshot(JobState::NeedsConfirm, 2, 1)),
            Ok(snapshot(JobState::Pending, 0, 0)),
            Ok(snapshot(JobState::Running, 3, 2)),
            Ok(snapshot(JobState::Completed, 4, 3)),
            Ok(snapshot(JobState::Completed, 4, 3)),
        ]);
        let poller = JobPoller::new(source, fast_config());

        let mut seen = Vec::new();
        let started = Instant::now();
        let outcome = poller
            .watch_until_terminal("job-1", |s| seen.push(s.status))
            .await
            .unwrap();

        assert!(matches!(outcome, PollOutcome::Completed(ref s) if s.stages.len() == 3));
        assert_eq!(
            seen,
            vec![
                JobStatus::Running,
                JobStatus::NeedsConfirm,
                JobStatus::Running,
                JobStatus::Completed
            ]
        );
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(poller.source.fetches.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn watch_reports_failure_without_grace() {
        let failed = JobState::Failed {
            reason: FailureReason::Canceled,
        };
        let source = ScriptedSource::new(vec![Ok(snapshot(failed, 1, 0))]);
        let config = PollConfig {
            completion_grace: Duration::from_secs(30),
            ..fast_config()
        };
        let poller = JobPoller::new(source, config);

        let mut watch = poller.watch("job-1");
        assert!(matches!(watch.next_event().await, Ok(Some(PollEvent::Update(_)))));
        let finished = tokio::time::timeout(Duration::from_secs(1), watch.next_event())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(finished, Some(PollEvent::Finished(PollOutcome::Failed(_)))));
        assert_eq!(watch.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn watch_surfaces_repeated_transport_failures() {
        let source = ScriptedSource::new(vec![Ok(snapshot(JobState::Running, 1, 0))]);
        let poller = JobPoller::new(source, fast_config());

        let err = poller.watch_until_terminal("job-1", |_| {}).await.unwrap_err();
        assert!(matches!(err, PollError::TooManyFailures { failures: 3, .. }));
    }

    #[tokio::test]
    async fn stalled_fetch_counts_as_a_miss() {
        let config = PollConfig {
            fetch_timeout: Duration::from_millis(20),
            completion_grace: Duration::ZERO,
            ..fast_config()
        };
        let poller = JobPoller::new(stalling(2, snapshot(JobState::Completed, 1, 3)), config);

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            poller.watch_until_terminal("job-1", |_| {}),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(matches!(outcome, PollOutcome::Completed(_)));
        assert_eq!(poller.source.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fetch_that_never_returns_gives_up() {
        let config = PollConfig {
            fetch_timeout: Duration::from_millis(20),
            ..fast_config()
        };
        let poller = JobPoller::new(stalling(u32::MAX, snapshot(JobState::Running, 1, 0)), config);

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            poller.watch_until_terminal("job-1", |_| {}),
        )
        .await
        .unwrap()
        .unwrap_err();

        assert!(matches!(
            err,
            PollError::TooManyFailures { failures: 3, ref last_error } if last_error.contains("timed out")
        ));
        assert_eq!(poller.source.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn confirm_interval_applies_while_waiting_for_confirmation() {
        let source = ScriptedSource::new(vec![
            Ok(snapshot(JobState::Running, 1, 1)),
            Ok(snapshot(JobState::NeedsConfirm, 2, 1)),
            Ok(snapshot(JobState::Running, 3, 1)),
        ]);
        let config = PollConfig {
            confirm_interval: Duration::from_millis(300),
            ..fast_config()
        };
        let poller = JobPoller::new(source, config);
        let mut watch = poller.watch("job-1");

        assert!(matches!(watch.next_event().await, Ok(Some(PollEvent::Update(_)))));

        let running = Instant::now();
        let next = watch.next_event().await.unwrap();
        assert!(matches!(next, Some(PollEvent::Update(ref s)) if s.needs_confirm));
        assert!(running.elapsed() < Duration::from_millis(300));

        let waiting = Instant::now();
        let next = watch.next_event().await.unwrap();
        assert!(matches!(next, Some(PollEvent::Update(ref s)) if s.status == JobStatus::Running));
        assert!(waiting.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn registry_source_reports_not_found() {
        let poller = JobPoller::new(Arc::new(JobRegistry::new()), fast_config());
        let err = poller.watch_until_terminal("missing", |_| {}).await.unwrap_err();
        assert!(matches!(err, PollError::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn watching_a_live_job_with_confirmation() {
        let registry = Arc::new(JobRegistry::new());
        let step = ScriptedStep::new(
            StageReport::completed(StagePayload::metrics([("sharpe", 1.2)])).with_usage(2, 100),
        )
        .after(Duration::from_millis(5));
        let orch = JobOrchestrator::new(
            Arc::clone(&registry),
            ScriptedExecutor::new(vec![step]),
            RunledgerConfig::default(),
        );
        let spec = JobSpec::new(JobKind::LabRun, "BTC-USDT", "lab").with_limits(1, 1_000_000);
        let (id, _handle) = orch.submit(spec).unwrap();

        let poller = JobPoller::new(Arc::clone(&registry), fast_config());
        let mut watch = poller.watch(id.clone());
        let mut last_seen: Option<JobSnapshot> = None;
        let outcome = loop {
            match watch.next_event().await.unwrap() {
                Some(PollEvent::Update(snap)) => {
                    assert_eq!(snap.needs_confirm, snap.status == JobStatus::NeedsConfirm);
                    if let Some(prev) = &last_seen {
                        assert!(snap.updated_at >= prev.updated_at);
                        assert!(snap.stages.len() >= prev.stages.len());
                    }
                    if snap.needs_confirm {
                        orch.spawn_confirm(id.clone());
                    }
                    last_seen = Some(snap);
                }
                Some(PollEvent::Finished(outcome)) => break outcome,
                None => unreachable!(),
            }
        };

        let PollOutcome::Completed(done) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(done.stages.len(), 3);
        assert!(done.budget.extensions_granted >= 1);
    }
}
