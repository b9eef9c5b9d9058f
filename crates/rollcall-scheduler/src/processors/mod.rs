//! Job processors, one per job family.
//!
//! A processor claims its record with `begin`, re-reads the status once per
//! batch and stops cleanly when an operator paused or cancelled the job. An
//! item already in flight always finishes. Setup failures and unexpected
//! errors flip the job to `failed`; per-item problems are only counted.

pub mod dispatch;
pub mod geocode;
pub mod import;

use std::time::Duration;

use async_trait::async_trait;
use rollcall_config::GeocodeTuning;
use rollcall_core::{
    ErrorCode, ErrorLogEntry, JobRecord, JobStatus, JobType, OutputStats, ProgressUpdate,
    ResourceId,
};
use rollcall_db::{DbError, JobRepo};
use tracing::{error, info};

use crate::{SchedulerError, SchedulerResult};

pub use dispatch::DispatchProcessor;
pub use geocode::GeocodeProcessor;
pub use import::{CsvFileSource, ImportProcessor, ImportRow, ImportSink, ImportSource, VoterSink};

/// How a processor run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Paused,
    Cancelled,
    Failed,
    /// The job was not runnable when the processor got to it.
    Skipped,
}

impl JobOutcome {
    fn for_status(status: JobStatus) -> Self {
        match status {
            JobStatus::Completed => JobOutcome::Completed,
            JobStatus::Paused => JobOutcome::Paused,
            JobStatus::Cancelled => JobOutcome::Cancelled,
            JobStatus::Failed => JobOutcome::Failed,
            JobStatus::Pending | JobStatus::Processing => JobOutcome::Skipped,
        }
    }
}

#[async_trait]
pub trait JobProcessor: Send + Sync {
    fn job_type(&self) -> JobType;

    /// Drive one job to a stopping point. Job-level failures are written to
    /// the record and reported as [`JobOutcome::Failed`]; `Err` means the
    /// record itself could not be updated.
    async fn process(&self, job_id: ResourceId) -> SchedulerResult<JobOutcome>;
}

/// Batch and flush cadence shared by the item processors.
#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub flush_every: u64,
    pub errors_per_flush: usize,
}

impl From<&GeocodeTuning> for BatchSettings {
    fn from(tuning: &GeocodeTuning) -> Self {
        Self {
            batch_size: tuning.batch_size.max(1),
            batch_delay: Duration::from_millis(tuning.batch_delay_ms),
            flush_every: tuning.flush_every.max(1),
            errors_per_flush: tuning.errors_per_flush,
        }
    }
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self::from(&GeocodeTuning::default())
    }
}

pub(crate) fn payload_mismatch(job: &JobRecord) -> SchedulerError {
    SchedulerError::PayloadMismatch {
        job_id: job.id.to_string(),
        found: job.data.payload.job_type().to_string(),
    }
}

/// Claim the record and run `work`, failing the job if it errors.
pub(crate) async fn run_claimed<F, Fut>(
    jobs: &dyn JobRepo,
    job_id: ResourceId,
    work: F,
) -> SchedulerResult<JobOutcome>
where
    F: FnOnce(JobRecord) -> Fut + Send,
    Fut: std::future::Future<Output = SchedulerResult<JobOutcome>> + Send,
{
    let Some(job) = jobs.begin(job_id).await? else {
        info!(job_id = %job_id, "Job is not runnable, skipping");
        return Ok(JobOutcome::Skipped);
    };

    match work(job).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => fail_job(jobs, job_id, &e).await,
    }
}

pub(crate) async fn fail_job(
    jobs: &dyn JobRepo,
    job_id: ResourceId,
    cause: &SchedulerError,
) -> SchedulerResult<JobOutcome> {
    error!(job_id = %job_id, error = %cause, "Job failed");
    match jobs
        .fail(job_id, ErrorLogEntry::new(cause.to_string(), Some(ErrorCode::Fatal)))
        .await
    {
        Ok(_) => Ok(JobOutcome::Failed),
        Err(DbError::InvalidTransition { from, .. }) => Ok(JobOutcome::for_status(from)),
        Err(e) => Err(e.into()),
    }
}

/// Status observed between batches, if it means the processor must stop.
pub(crate) async fn stop_requested(
    jobs: &dyn JobRepo,
    job_id: ResourceId,
) -> SchedulerResult<Option<JobStatus>> {
    let status = jobs.status(job_id).await?;
    Ok((status != JobStatus::Processing).then_some(status))
}

/// Log an operator stop on the record and map it to an outcome.
pub(crate) async fn acknowledge_stop(
    jobs: &dyn JobRepo,
    job_id: ResourceId,
    status: JobStatus,
    processed: u64,
) -> SchedulerResult<JobOutcome> {
    let code = match status {
        JobStatus::Paused => Some(ErrorCode::JobPaused),
        JobStatus::Cancelled => Some(ErrorCode::JobCancelled),
        _ => None,
    };
    info!(job_id = %job_id, status = %status, processed, "Processor stopping");
    if let Some(code) = code {
        let entry = ErrorLogEntry::new(format!("Job {} after {} items", status, processed), Some(code));
        jobs.append_errors(job_id, &[entry]).await?;
    }
    Ok(JobOutcome::for_status(status))
}

/// Finish a job, or acknowledge the stop if an operator got there first.
pub(crate) async fn finish(
    jobs: &dyn JobRepo,
    job_id: ResourceId,
    stats: &OutputStats,
    processed: u64,
) -> SchedulerResult<JobOutcome> {
    match jobs.complete(job_id, Some(stats)).await {
        Ok(record) => {
            info!(
                job_id = %job_id,
                processed = record.processed_items,
                total = record.total_items,
                "Job completed"
            );
            Ok(JobOutcome::Completed)
        }
        Err(DbError::InvalidTransition { from, .. }) => {
            acknowledge_stop(jobs, job_id, from, processed).await
        }
        Err(e) => Err(e.into()),
    }
}

/// Progress accumulated between flushes.
pub(crate) struct Checkpoint {
    job_id: ResourceId,
    pub processed: u64,
    total: u64,
    cursor: Option<String>,
    since_flush: u64,
    errors: Vec<ErrorLogEntry>,
}

impl Checkpoint {
    /// Continue from wherever the record says the job got to.
    pub fn resume(job: &JobRecord, total: u64) -> Self {
        let processed = if total > 0 {
            job.resume_index().min(total)
        } else {
            job.resume_index()
        };
        Self {
            job_id: job.id,
            processed,
            total,
            cursor: job.data.cursor.clone(),
            since_flush: 0,
            errors: Vec::new(),
        }
    }

    pub fn advance(&mut self, cursor: String) {
        self.processed += 1;
        self.since_flush += 1;
        self.cursor = Some(cursor);
    }

    pub fn item_error(&mut self, message: String) {
        self.errors.push(ErrorLogEntry::new(message, Some(ErrorCode::ItemFailed)));
    }

    /// The source ran dry, so the count covers the whole job. Returns the
    /// previous total when it had to change.
    ///
    /// With `skip_geocoded`, households finished after the last flush of a
    /// crashed run drop out of the eligible set and are never counted, so
    /// the total shrinks to match.
    pub fn settle_total(&mut self) -> Option<u64> {
        if self.total == self.processed {
            return None;
        }
        Some(std::mem::replace(&mut self.total, self.processed))
    }

    pub fn due(&self, settings: &BatchSettings) -> bool {
        self.since_flush >= settings.flush_every
    }

    /// Write counters, stats and the most recent item errors.
    pub async fn flush(
        &mut self,
        jobs: &dyn JobRepo,
        stats: OutputStats,
        settings: &BatchSettings,
    ) -> SchedulerResult<()> {
        let keep_from = self.errors.len().saturating_sub(settings.errors_per_flush);
        let errors = self.errors.split_off(keep_from);
        self.errors.clear();

        jobs.update_progress(
            self.job_id,
            &ProgressUpdate {
                processed_items: self.processed,
                total_items: Some(self.total),
                stats: Some(stats),
                cursor: self.cursor.clone(),
                errors,
            },
        )
        .await?;
        self.since_flush = 0;
        Ok(())
    }
}

pub(crate) fn bump(counter: &mut Option<u64>) {
    *counter = Some(counter.unwrap_or(0) + 1);
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use rollcall_core::{JobPayload, JobRecord, ProgressUpdate};
    use rollcall_db::{JobRepo, MemoryJobRepo};

    use super::BatchSettings;

    pub fn settings() -> BatchSettings {
        BatchSettings {
            batch_size: 100,
            batch_delay: std::time::Duration::ZERO,
            flush_every: 50,
            errors_per_flush: 10,
        }
    }

    pub async fn pending(jobs: &Arc<MemoryJobRepo>, payload: JobPayload) -> JobRecord {
        jobs.create(&JobRecord::new(payload, Some("test".to_string())))
            .await
            .unwrap()
    }

    /// A job that was mid-run when its process died.
    pub async fn interrupted(
        jobs: &Arc<MemoryJobRepo>,
        payload: JobPayload,
        processed: u64,
        total: u64,
        cursor: Option<String>,
    ) -> JobRecord {
        let job = pending(jobs, payload).await;
        jobs.begin(job.id).await.unwrap().unwrap();
        jobs.update_progress(
            job.id,
            &ProgressUpdate {
                processed_items: processed,
                total_items: Some(total),
                cursor,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        jobs.get(job.id).await.unwrap()
    }
}
