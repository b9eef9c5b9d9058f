//! Job submission and control.

use std::sync::Arc;

use chrono::Utc;
use rollcall_core::{JobAction, JobPayload, JobRecord, JobStatus, JobType, ResourceId};
use rollcall_db::{JobFilter, JobRepo};
use serde_json::json;
use tracing::{debug, info};

use crate::SchedulerResult;
use crate::queue::{EnqueueOptions, EntryState, QueueBroker};

/// What putting a job on its queue actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// A fresh entry was added.
    Added,
    /// A waiting entry with the job's id already existed.
    AlreadyQueued,
    /// A worker holds the entry and keeps it.
    Claimed,
    /// A stale claim on the entry was dropped.
    Released,
}

/// Creates job records, keeps their queue entries in step and applies
/// operator control actions.
#[derive(Clone)]
pub struct JobService {
    jobs: Arc<dyn JobRepo>,
    broker: Arc<dyn QueueBroker>,
}

impl JobService {
    pub fn new(jobs: Arc<dyn JobRepo>, broker: Arc<dyn QueueBroker>) -> Self {
        Self { jobs, broker }
    }

    pub fn jobs(&self) -> &Arc<dyn JobRepo> {
        &self.jobs
    }

    pub fn broker(&self) -> &Arc<dyn QueueBroker> {
        &self.broker
    }

    /// Create a pending job and dispatch it.
    pub async fn submit(
        &self,
        payload: JobPayload,
        created_by: Option<String>,
    ) -> SchedulerResult<JobRecord> {
        payload.validate()?;
        let job = self.jobs.create(&JobRecord::new(payload, created_by)).await?;
        self.enqueue(&job).await?;
        info!(job_id = %job.id, job_type = %job.job_type, "Job submitted");
        Ok(job)
    }

    pub async fn get(&self, id: ResourceId) -> SchedulerResult<JobRecord> {
        Ok(self.jobs.get(id).await?)
    }

    pub async fn list(&self, filter: &JobFilter) -> SchedulerResult<Vec<JobRecord>> {
        Ok(self.jobs.list(filter).await?)
    }

    /// Apply a pause, resume or cancel. Resuming puts the job back on its
    /// queue so a processor picks it up from its checkpoint.
    pub async fn control(&self, id: ResourceId, action: JobAction) -> SchedulerResult<JobRecord> {
        let current = self.jobs.status(id).await?;
        action.check(current)?;

        let job = self
            .jobs
            .transition(id, action.allowed_from(), action.target())
            .await?;
        if action == JobAction::Resume {
            self.enqueue(&job).await?;
        }

        info!(job_id = %id, action = ?action, status = %job.status, "Job control applied");
        Ok(job)
    }

    /// Make sure the job has exactly one live entry on its queue.
    ///
    /// A finished entry left over from an earlier run is replaced. A claimed
    /// entry stays with its worker, which picks the job back up at its next
    /// status check or re-queues it after settling.
    pub async fn enqueue(&self, job: &JobRecord) -> SchedulerResult<Requeue> {
        let queue = job.job_type.queue_name();
        let existing = self.broker.get(queue, job.id).await?;

        let outcome = match existing.map(|e| e.state) {
            Some(EntryState::Waiting) => Requeue::AlreadyQueued,
            Some(EntryState::Active) => Requeue::Claimed,
            Some(state) => {
                debug_assert!(state.is_terminal());
                self.broker.remove(queue, job.id).await?;
                self.add(job).await?;
                Requeue::Added
            }
            None => {
                self.add(job).await?;
                Requeue::Added
            }
        };
        debug!(job_id = %job.id, queue, outcome = ?outcome, "Job queued");
        Ok(outcome)
    }

    /// Like [`enqueue`](Self::enqueue), but a claim on the entry is known to
    /// be dead and is released. Only for jobs no consumer in this process
    /// holds.
    pub async fn requeue_orphan(&self, job: &JobRecord) -> SchedulerResult<Requeue> {
        let queue = job.job_type.queue_name();
        let claimed = self
            .broker
            .get(queue, job.id)
            .await?
            .is_some_and(|e| e.state == EntryState::Active);
        if !claimed {
            return self.enqueue(job).await;
        }

        self.broker.release(queue, job.id).await?;
        debug!(job_id = %job.id, queue, "Released orphaned claim");
        Ok(Requeue::Released)
    }

    /// Called by a worker after settling the entry of a run that stopped on
    /// a pause. A resume that landed in between found the entry still claimed
    /// and left it alone, so the job is queued again here.
    pub async fn requeue_if_resumed(&self, id: ResourceId) -> SchedulerResult<Option<Requeue>> {
        let job = self.jobs.get(id).await?;
        if job.status != JobStatus::Processing {
            return Ok(None);
        }
        let outcome = self.enqueue(&job).await?;
        info!(job_id = %id, outcome = ?outcome, "Job resumed while stopping, queued again");
        Ok(Some(outcome))
    }

    async fn add(&self, job: &JobRecord) -> SchedulerResult<()> {
        let payload = json!({ "jobId": job.id, "type": job.job_type });
        self.broker
            .add(job.job_type.queue_name(), job.id, payload, EnqueueOptions::default())
            .await?;
        Ok(())
    }

    /// Delete terminal jobs older than the retention window.
    pub async fn cleanup(&self, retention_days: u32, keep_min: u32) -> SchedulerResult<u64> {
        let older_than = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let deleted = self.jobs.cleanup(older_than, keep_min).await?;
        let mut purged = 0;
        for job_type in JobType::ALL {
            purged += self
                .broker
                .purge_finished(job_type.queue_name(), older_than)
                .await?;
        }
        info!(deleted, purged, retention_days, keep_min, "Retention cleanup finished");
        Ok(deleted)
    }
}
