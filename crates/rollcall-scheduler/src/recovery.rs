//! Startup reconciliation of the job store against the broker.
//!
//! A crashed process leaves records `processing` with nobody working on them,
//! and `pending` records whose broker entry may be missing, finished or still
//! claimed by the dead worker. Recovery puts every such job back on its queue
//! exactly once; running it again changes nothing.

use chrono::Utc;
use rollcall_core::job::{RecoveryInfo, RecoveryMode};
use rollcall_core::{ErrorCode, ErrorLogEntry, JobRecord, JobStatus};
use rollcall_db::JobFilter;
use serde::Serialize;
use tracing::{info, warn};

use crate::SchedulerResult;
use crate::service::JobService;
use crate::worker::InFlight;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverySummary {
    pub scanned: u64,
    pub pending_requeued: u64,
    pub processing_recovered: u64,
    pub failed: u64,
    pub skipped: u64,
}

enum Recovered {
    Requeued,
    Reset,
    Failed,
}

pub struct RecoveryService {
    service: JobService,
    in_flight: InFlight,
}

impl RecoveryService {
    pub fn new(service: JobService, in_flight: InFlight) -> Self {
        Self { service, in_flight }
    }

    pub async fn recover(&self) -> SchedulerResult<RecoverySummary> {
        let candidates = self
            .service
            .list(&JobFilter::with_statuses(&[
                JobStatus::Pending,
                JobStatus::Processing,
            ]))
            .await?;

        let mut summary = RecoverySummary::default();
        for job in candidates {
            summary.scanned += 1;
            if !job.job_type.is_recoverable() || self.in_flight.contains(job.id) {
                summary.skipped += 1;
                continue;
            }

            match self.recover_job(&job).await {
                Ok(Recovered::Requeued) => summary.pending_requeued += 1,
                Ok(Recovered::Reset) => summary.processing_recovered += 1,
                Ok(Recovered::Failed) => summary.failed += 1,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Failed to recover job");
                    summary.failed += 1;
                }
            }
        }

        info!(
            scanned = summary.scanned,
            pending_requeued = summary.pending_requeued,
            processing_recovered = summary.processing_recovered,
            failed = summary.failed,
            skipped = summary.skipped,
            "Job recovery finished"
        );
        Ok(summary)
    }

    async fn recover_job(&self, job: &JobRecord) -> SchedulerResult<Recovered> {
        let jobs = self.service.jobs();

        if let Err(e) = job.data.payload.validate() {
            jobs.fail(
                job.id,
                ErrorLogEntry::new(
                    format!("Recovery failed: {}", e),
                    Some(ErrorCode::Recovery),
                ),
            )
            .await?;
            return Ok(Recovered::Failed);
        }

        let (job, recovered) = match job.status {
            JobStatus::Processing => {
                let info = RecoveryInfo {
                    mode: RecoveryMode::UnexpectedShutdown,
                    recovered_at: Utc::now(),
                    checkpoint_index: Some(job.processed_items),
                };
                let reset = jobs.reset_for_recovery(job.id, &info).await?;
                info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    checkpoint = job.processed_items,
                    "Recovered interrupted job"
                );
                (reset, Recovered::Reset)
            }
            _ => (job.clone(), Recovered::Requeued),
        };

        self.service.requeue_orphan(&job).await?;
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::processors::testing::{interrupted, pending};
    use crate::queue::{EntryState, MemoryQueueBroker, QueueBroker};
    use rollcall_core::job::{DispatchJobData, GeocodeJobData, ImportJobData};
    use rollcall_core::{JobPayload, ResourceId, ScheduledTask};
    use rollcall_db::{JobRepo, MemoryJobRepo};

    struct Fixture {
        jobs: Arc<MemoryJobRepo>,
        broker: Arc<MemoryQueueBroker>,
        in_flight: InFlight,
        recovery: RecoveryService,
    }

    fn fixture() -> Fixture {
        let jobs = Arc::new(MemoryJobRepo::new());
        let broker = Arc::new(MemoryQueueBroker::new());
        let in_flight = InFlight::new();
        let recovery = RecoveryService::new(
            JobService::new(jobs.clone(), broker.clone()),
            in_flight.clone(),
        );
        Fixture {
            jobs,
            broker,
            in_flight,
            recovery,
        }
    }

    fn geocode() -> JobPayload {
        JobPayload::Geocode(GeocodeJobData::default())
    }

    #[tokio::test]
    async fn test_crashed_job_is_reset_and_requeued() {
        let fx = fixture();
        let job = interrupted(&fx.jobs, geocode(), 60, 150, Some("cursor".to_string())).await;

        let summary = fx.recovery.recover().await.unwrap();
        assert_eq!(summary.scanned, 1);
        assert_eq!(summary.processing_recovered, 1);

        let recovered = fx.jobs.get(job.id).await.unwrap();
        assert_eq!(recovered.status, JobStatus::Pending);
        assert_eq!(recovered.started_at, None);
        assert_eq!(recovered.processed_items, 60);
        let info = recovered.data.recovery.unwrap();
        assert_eq!(info.mode, RecoveryMode::UnexpectedShutdown);
        assert_eq!(info.checkpoint_index, Some(60));

        let entries = fx.broker.entries("geocode").await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, job.id);
        assert_eq!(entries[0].state, EntryState::Waiting);
    }

    #[tokio::test]
    async fn test_recovery_is_idempotent() {
        let fx = fixture();
        interrupted(&fx.jobs, geocode(), 10, 20, None).await;
        pending(&fx.jobs, geocode()).await;

        let first = fx.recovery.recover().await.unwrap();
        assert_eq!(first.processing_recovered, 1);
        assert_eq!(first.pending_requeued, 1);

        let second = fx.recovery.recover().await.unwrap();
        assert_eq!(second.scanned, 2);
        assert_eq!(second.pending_requeued, 2);
        assert_eq!(second.processing_recovered, 0);
        assert_eq!(fx.broker.entries("geocode").await.len(), 2);
    }

    #[tokio::test]
    async fn test_stale_claim_is_released() {
        let fx = fixture();
        let job = pending(&fx.jobs, geocode()).await;
        fx.recovery.recover().await.unwrap();
        fx.broker.claim("geocode", "dead-worker").await.unwrap().unwrap();

        fx.recovery.recover().await.unwrap();
        let entry = fx.broker.get("geocode", job.id).await.unwrap().unwrap();
        assert_eq!(entry.state, EntryState::Waiting);
        assert_eq!(entry.claimed_by, None);
    }

    #[tokio::test]
    async fn test_finished_entry_is_replaced() {
        let fx = fixture();
        let job = pending(&fx.jobs, geocode()).await;
        fx.recovery.recover().await.unwrap();
        fx.broker.claim("geocode", "w").await.unwrap().unwrap();
        fx.broker.fail("geocode", job.id, "w", "lost").await.unwrap();

        fx.recovery.recover().await.unwrap();
        let entries = fx.broker.entries("geocode").await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].state, EntryState::Waiting);
    }

    #[tokio::test]
    async fn test_skips_in_flight_and_scheduled_jobs() {
        let fx = fixture();
        let held = interrupted(&fx.jobs, geocode(), 5, 10, None).await;
        let _guard = fx.in_flight.hold(held.id);
        pending(
            &fx.jobs,
            JobPayload::ScheduledDispatch(DispatchJobData {
                scheduled_job_id: ResourceId::new(),
                task: ScheduledTask::RetentionCleanup {
                    retention_days: None,
                    keep_min: None,
                },
            }),
        )
        .await;

        let summary = fx.recovery.recover().await.unwrap();
        assert_eq!(summary.skipped, 2);
        assert_eq!(fx.jobs.get(held.id).await.unwrap().status, JobStatus::Processing);
        assert!(fx.broker.entries("geocode").await.is_empty());
    }

    #[tokio::test]
    async fn test_unusable_payload_fails_job() {
        let fx = fixture();
        let job = pending(
            &fx.jobs,
            JobPayload::Import(ImportJobData {
                file_path: String::new(),
                delimiter: None,
                key_column: None,
            }),
        )
        .await;

        let summary = fx.recovery.recover().await.unwrap();
        assert_eq!(summary.failed, 1);
        let failed = fx.jobs.get(job.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_log[0].code, Some(ErrorCode::Recovery));
    }
}
