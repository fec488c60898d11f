//! Keyed job store with per-job write serialization.
//!
//! Each job lives in its own slot: writers take the slot's async mutex,
//! readers copy the last snapshot the writer published and never wait on
//! that mutex. Unrelated jobs never contend.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::config::BudgetConfig;
use crate::error::JobError;
use crate::state_machine::{Job, JobKind, JobSnapshot, JobSpec, JobStatus};

struct JobSlot {
    job: Mutex<Job>,
    published: RwLock<Arc<JobSnapshot>>,
    cancel: CancellationToken,
}

impl JobSlot {
    fn new(job: Job) -> Self {
        let snapshot = Arc::new(job.snapshot());
        Self {
            job: Mutex::new(job),
            published: RwLock::new(snapshot),
            cancel: CancellationToken::new(),
        }
    }

    fn publish(&self, snapshot: JobSnapshot) {
        let mut published = self.published.write().unwrap_or_else(PoisonError::into_inner);
        *published = Arc::new(snapshot);
    }

    fn current(&self) -> Arc<JobSnapshot> {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Selects jobs for history views.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub kind: Option<JobKind>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_kind(mut self, kind: JobKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn matches(&self, snapshot: &JobSnapshot) -> bool {
        self.status.is_none_or(|s| s == snapshot.status)
            && self.kind.is_none_or(|k| k == snapshot.kind)
    }
}

/// Owns every job. Nothing else holds a mutable reference to one.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Arc<JobSlot>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a PENDING job under a fresh identifier.
    pub fn create(&self, spec: JobSpec, budget: &BudgetConfig) -> Result<String, JobError> {
        let initial_budget = budget.budget_for(&spec);
        let mut job = Job::new(Uuid::new_v4().to_string(), spec, initial_budget)?;

        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        while jobs.contains_key(&job.id) {
            job.id = Uuid::new_v4().to_string();
        }
        let id = job.id.clone();
        debug!(job_id = %id, kind = %job.spec.kind, stages = job.plan.len(), "job registered");
        jobs.insert(id.clone(), Arc::new(JobSlot::new(job)));
        Ok(id)
    }

    /// Latest published snapshot of a job.
    pub fn get(&self, id: &str) -> Result<JobSnapshot, JobError> {
        Ok(self.slot(id)?.current().as_ref().clone())
    }

    /// Snapshots matching `filter`, oldest first.
    pub fn list(&self, filter: &JobFilter) -> Vec<JobSnapshot> {
        let slots: Vec<Arc<JobSlot>> = self
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut snapshots: Vec<JobSnapshot> = slots
            .iter()
            .map(|slot| slot.current())
            .filter(|snap| filter.matches(snap))
            .map(|snap| snap.as_ref().clone())
            .collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        snapshots
    }

    /// Run `f` with exclusive access to the job, then publish its snapshot.
    ///
    /// Calls on the same job are serialized; `f` must not block.
    pub async fn mutate<R, F>(&self, id: &str, f: F) -> Result<R, JobError>
    where
        F: FnOnce(&mut Job) -> Result<R, JobError>,
    {
        let slot = self.slot(id)?;
        let mut job = slot.job.lock().await;
        let result = f(&mut job);
        slot.publish(job.snapshot());
        result
    }

    /// Token fired when the job is canceled.
    pub fn cancel_token(&self, id: &str) -> Result<CancellationToken, JobError> {
        Ok(self.slot(id)?.cancel.clone())
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, id: &str) -> Result<Arc<JobSlot>, JobError> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }
}
