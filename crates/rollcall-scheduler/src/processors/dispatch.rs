//! Runs the task a cron trigger dispatched.

use std::sync::Arc;

use async_trait::async_trait;
use rollcall_config::RetentionPolicy;
use rollcall_core::job::{DispatchJobData, DispatchStats};
use rollcall_core::{
    JobPayload, JobRecord, JobStatus, JobType, OutputStats, ProgressUpdate, ResourceId,
    ScheduledTask,
};
use rollcall_db::{JobRepo, ScheduledJobRepo};
use tracing::{info, warn};

use super::{JobOutcome, JobProcessor, finish, payload_mismatch, run_claimed};
use crate::SchedulerResult;
use crate::service::JobService;

pub struct DispatchProcessor {
    jobs: Arc<dyn JobRepo>,
    scheduled: Arc<dyn ScheduledJobRepo>,
    service: JobService,
    retention: RetentionPolicy,
}

impl DispatchProcessor {
    pub fn new(
        scheduled: Arc<dyn ScheduledJobRepo>,
        service: JobService,
        retention: RetentionPolicy,
    ) -> Self {
        Self {
            jobs: service.jobs().clone(),
            scheduled,
            service,
            retention,
        }
    }

    async fn execute(&self, job: JobRecord) -> SchedulerResult<JobOutcome> {
        let JobPayload::ScheduledDispatch(data) = &job.data.payload else {
            return Err(payload_mismatch(&job));
        };

        let result = self.run_task(data).await;
        let last_status = match &result {
            Ok(_) => JobStatus::Completed,
            Err(_) => JobStatus::Failed,
        };
        if let Err(e) = self
            .scheduled
            .set_last_status(data.scheduled_job_id, last_status)
            .await
        {
            warn!(
                scheduled_job_id = %data.scheduled_job_id,
                error = %e,
                "Failed to record scheduled job status"
            );
        }

        let stats = OutputStats::Dispatch(result?);
        self.jobs
            .update_progress(
                job.id,
                &ProgressUpdate {
                    processed_items: 1,
                    total_items: Some(1),
                    stats: Some(stats.clone()),
                    ..Default::default()
                },
            )
            .await?;
        finish(self.jobs.as_ref(), job.id, &stats, 1).await
    }

    async fn run_task(&self, data: &DispatchJobData) -> SchedulerResult<DispatchStats> {
        let mut stats = DispatchStats {
            task: Some(data.task.label().to_string()),
            ..Default::default()
        };

        match &data.task {
            ScheduledTask::Geocode(input) => {
                let spawned = self
                    .service
                    .submit(
                        JobPayload::Geocode(input.clone()),
                        Some(format!("schedule:{}", data.scheduled_job_id)),
                    )
                    .await?;
                info!(
                    scheduled_job_id = %data.scheduled_job_id,
                    spawned_job_id = %spawned.id,
                    "Scheduled geocode job submitted"
                );
                stats.spawned_job_id = Some(spawned.id);
            }
            ScheduledTask::RetentionCleanup {
                retention_days,
                keep_min,
            } => {
                let deleted = self
                    .service
                    .cleanup(
                        retention_days.unwrap_or(self.retention.days),
                        keep_min.unwrap_or(self.retention.keep_min),
                    )
                    .await?;
                stats.records_deleted = Some(deleted);
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl JobProcessor for DispatchProcessor {
    fn job_type(&self) -> JobType {
        JobType::ScheduledDispatch
    }

    async fn process(&self, job_id: ResourceId) -> SchedulerResult<JobOutcome> {
        run_claimed(self.jobs.as_ref(), job_id, |job| self.execute(job)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::testing::pending;
    use crate::queue::MemoryQueueBroker;
    use rollcall_core::job::GeocodeJobData;
    use rollcall_core::{ErrorCode, ScheduledJob};
    use rollcall_db::{JobFilter, MemoryJobRepo, MemoryScheduledJobRepo};

    struct Fixture {
        jobs: Arc<MemoryJobRepo>,
        scheduled: Arc<MemoryScheduledJobRepo>,
        broker: Arc<MemoryQueueBroker>,
        processor: DispatchProcessor,
    }

    fn fixture() -> Fixture {
        let jobs = Arc::new(MemoryJobRepo::new());
        let scheduled = Arc::new(MemoryScheduledJobRepo::new());
        let broker = Arc::new(MemoryQueueBroker::new());
        let service = JobService::new(jobs.clone(), broker.clone());
        let processor =
            DispatchProcessor::new(scheduled.clone(), service, RetentionPolicy::default());
        Fixture {
            jobs,
            scheduled,
            broker,
            processor,
        }
    }

    async fn dispatch(fx: &Fixture, task: ScheduledTask) -> (ScheduledJob, JobRecord) {
        let template = fx
            .scheduled
            .create(&ScheduledJob::new("nightly", "0 0 2 * * *", task.clone()))
            .await
            .unwrap();
        let job = pending(
            &fx.jobs,
            JobPayload::ScheduledDispatch(DispatchJobData {
                scheduled_job_id: template.id,
                task,
            }),
        )
        .await;
        (template, job)
    }

    #[tokio::test]
    async fn test_geocode_task_spawns_job() {
        let fx = fixture();
        let (template, job) = dispatch(&fx, ScheduledTask::Geocode(GeocodeJobData::default())).await;

        let outcome = fx.processor.process(job.id).await.unwrap();
        assert_eq!(outcome, JobOutcome::Completed);

        let done = fx.jobs.get(job.id).await.unwrap();
        let OutputStats::Dispatch(stats) = &done.output_stats else {
            panic!("unexpected stats {:?}", done.output_stats);
        };
        assert_eq!(stats.task.as_deref(), Some("geocode"));
        let spawned_id = stats.spawned_job_id.unwrap();
        assert_eq!((done.processed_items, done.total_items), (1, 1));

        let spawned = fx.jobs.get(spawned_id).await.unwrap();
        assert_eq!(spawned.status, JobStatus::Pending);
        assert_eq!(spawned.created_by, Some(format!("schedule:{}", template.id)));
        assert_eq!(fx.broker.entries("geocode").await.len(), 1);

        let template = fx.scheduled.get(template.id).await.unwrap();
        assert_eq!(template.last_status, Some(JobStatus::Completed));
    }

    #[tokio::test]
    async fn test_retention_task_reports_deleted_count() {
        let fx = fixture();
        let (_, job) = dispatch(
            &fx,
            ScheduledTask::RetentionCleanup {
                retention_days: Some(7),
                keep_min: Some(0),
            },
        )
        .await;

        assert_eq!(fx.processor.process(job.id).await.unwrap(), JobOutcome::Completed);
        let done = fx.jobs.get(job.id).await.unwrap();
        let OutputStats::Dispatch(stats) = &done.output_stats else {
            panic!("unexpected stats {:?}", done.output_stats);
        };
        assert_eq!(stats.records_deleted, Some(0));
    }

    #[tokio::test]
    async fn test_failed_task_marks_template() {
        let fx = fixture();
        let (template, job) = dispatch(
            &fx,
            ScheduledTask::Geocode(GeocodeJobData {
                batch_size: Some(0),
                ..Default::default()
            }),
        )
        .await;

        assert_eq!(fx.processor.process(job.id).await.unwrap(), JobOutcome::Failed);
        let failed = fx.jobs.get(job.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_log.last().unwrap().code, Some(ErrorCode::Fatal));
        assert!(fx
            .jobs
            .list(&JobFilter::default())
            .await
            .unwrap()
            .iter()
            .all(|j| j.job_type == JobType::ScheduledDispatch));

        let template = fx.scheduled.get(template.id).await.unwrap();
        assert_eq!(template.last_status, Some(JobStatus::Failed));
    }
}
