use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use crate::error::{MeshError, Result};
use crate::master::job::{Job, JobEvent, JobState, RecordOutcome};
use crate::protocol::{JobId, JobResult, JobSpec, NodeId};

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Handle to one job. Holding its lock serializes every mutation of that
/// job without blocking other jobs.
pub type JobEntry = Arc<Mutex<Job>>;

/// Tracks active jobs and their lifecycle state.
///
/// The map lock is held only to look up, insert or remove entries; all job
/// state lives behind the per-job lock.
#[derive(Debug)]
pub struct JobLedger {
    jobs: RwLock<HashMap<JobId, JobEntry>>,
    max_jobs: usize,
}

impl Default for JobLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl JobLedger {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            max_jobs,
        }
    }

    /// Allocate a new Pending job.
    pub async fn create(&self, spec: JobSpec) -> Result<JobId> {
        spec.validate()?;

        let mut jobs = self.jobs.write().await;
        if jobs.len() >= self.max_jobs {
            return Err(MeshError::LedgerFull(self.max_jobs));
        }
        let job = Job::new(spec);
        let job_id = job.id;
        jobs.insert(job_id, Arc::new(Mutex::new(job)));
        tracing::info!(job_id = %job_id, "Job created");
        Ok(job_id)
    }

    pub async fn entry(&self, job_id: JobId) -> Result<JobEntry> {
        self.jobs
            .read()
            .await
            .get(&job_id)
            .cloned()
            .ok_or(MeshError::UnknownJob(job_id))
    }

    pub async fn transition(&self, job_id: JobId, event: JobEvent) -> Result<JobState> {
        let entry = self.entry(job_id).await?;
        let mut job = entry.lock().await;
        job.transition(event)
    }

    /// Record a report from `node_id` for `job_id`.
    pub async fn record_result(
        &self,
        job_id: JobId,
        node_id: NodeId,
        payload: Value,
    ) -> Result<RecordOutcome> {
        let entry = self.entry(job_id).await?;
        let mut job = entry.lock().await;
        Ok(job.record(node_id, payload))
    }

    /// Worker results recorded for `job_id`, oldest first
    pub async fn results(&self, job_id: JobId) -> Result<Vec<JobResult>> {
        let entry = self.entry(job_id).await?;
        let job = entry.lock().await;
        Ok(job.results().to_vec())
    }

    async fn entries(&self) -> Vec<JobEntry> {
        self.jobs.read().await.values().cloned().collect()
    }

    /// Ids of jobs in `state`, oldest first
    pub async fn jobs_in(&self, state: JobState) -> Vec<JobId> {
        let mut matching = Vec::new();
        for entry in self.entries().await {
            let job = entry.lock().await;
            if job.state() == state {
                matching.push((job.created_at, job.id));
            }
        }
        matching.sort();
        matching.into_iter().map(|(_, id)| id).collect()
    }

    pub async fn pending_jobs(&self) -> Vec<JobId> {
        self.jobs_in(JobState::Pending).await
    }

    pub async fn running_jobs(&self) -> Vec<JobId> {
        self.jobs_in(JobState::Running).await
    }

    /// Snapshot of every job, sorted by creation time
    pub async fn all_jobs(&self) -> Vec<Job> {
        let mut jobs = Vec::new();
        for entry in self.entries().await {
            jobs.push(entry.lock().await.clone());
        }
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Drop finished jobs older than `retention`. Returns how many were removed.
    pub async fn prune_finished(&self, retention: Duration) -> usize {
        // A retention beyond what a timestamp can express keeps everything.
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return 0;
        };

        let mut expired = Vec::new();
        for entry in self.entries().await {
            let job = entry.lock().await;
            if job.state().is_terminal() && job.finished_at.is_some_and(|t| t <= cutoff) {
                expired.push(job.id);
            }
        }

        let mut jobs = self.jobs.write().await;
        for job_id in &expired {
            jobs.remove(job_id);
        }
        expired.len()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}
