//! Cron triggers for scheduled job templates.
//!
//! Each enabled [`ScheduledJob`] gets a trigger holding its parsed schedule
//! and next fire time. A tick loop submits a `scheduled-dispatch` job for
//! every trigger that came due; ticks missed while the process was busy or
//! down collapse into a single run.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use rollcall_core::job::DispatchJobData;
use rollcall_core::{JobPayload, ResourceId, ScheduledJob};
use rollcall_db::ScheduledJobRepo;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::service::JobService;
use crate::{SchedulerError, SchedulerResult};

/// Parse a six or seven field cron expression (seconds first).
pub fn validate_cron_expression(expression: &str) -> SchedulerResult<Schedule> {
    Schedule::from_str(expression.trim()).map_err(|e| SchedulerError::InvalidCron {
        expression: expression.to_string(),
        message: e.to_string(),
    })
}

/// First fire time strictly after `after`.
pub fn next_run(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

struct Trigger {
    job: ScheduledJob,
    schedule: Schedule,
    next: Option<DateTime<Utc>>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct CronScheduler {
    scheduled: Arc<dyn ScheduledJobRepo>,
    service: JobService,
    triggers: Mutex<HashMap<ResourceId, Trigger>>,
    tick: Duration,
    running: Mutex<Option<Running>>,
}

impl CronScheduler {
    pub fn new(scheduled: Arc<dyn ScheduledJobRepo>, service: JobService) -> Self {
        Self {
            scheduled,
            service,
            triggers: Mutex::new(HashMap::new()),
            tick: Duration::from_secs(1),
            running: Mutex::new(None),
        }
    }

    /// Load enabled templates and start the tick loop. Calling it twice is a
    /// no-op.
    pub async fn start(self: &Arc<Self>) -> SchedulerResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        for job in self.scheduled.list_enabled().await? {
            if let Err(e) = self.register(&job).await {
                warn!(scheduled_job_id = %job.id, name = %job.name, error = %e, "Skipping scheduled job");
            }
        }

        let (shutdown, mut stop) = watch::channel(false);
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(scheduler.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.run_due(Utc::now()).await;
                    }
                    _ = stop.changed() => break,
                }
            }
        });

        info!(triggers = self.triggers.lock().await.len(), "Cron scheduler started");
        *running = Some(Running { shutdown, handle });
        Ok(())
    }

    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.shutdown.send(true);
        if let Err(e) = running.handle.await {
            warn!(error = %e, "Cron loop ended abnormally");
        }
        info!("Cron scheduler stopped");
    }

    /// Add or replace the trigger for `job`. Disabled templates are removed.
    /// Returns the next fire time.
    pub async fn register(&self, job: &ScheduledJob) -> SchedulerResult<Option<DateTime<Utc>>> {
        if !job.enabled {
            self.unregister(job.id).await;
            return Ok(None);
        }

        let schedule = validate_cron_expression(&job.schedule)?;
        let next = next_run(&schedule, Utc::now());
        self.scheduled.set_next_run(job.id, next).await?;

        debug!(scheduled_job_id = %job.id, next = ?next, "Registered cron trigger");
        self.triggers.lock().await.insert(
            job.id,
            Trigger {
                job: job.clone(),
                schedule,
                next,
            },
        );
        Ok(next)
    }

    pub async fn unregister(&self, id: ResourceId) -> bool {
        let removed = self.triggers.lock().await.remove(&id).is_some();
        if removed {
            debug!(scheduled_job_id = %id, "Unregistered cron trigger");
        }
        removed
    }

    pub async fn registered(&self) -> Vec<ResourceId> {
        let mut ids: Vec<_> = self.triggers.lock().await.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn next_fire(&self, id: ResourceId) -> Option<DateTime<Utc>> {
        self.triggers.lock().await.get(&id).and_then(|t| t.next)
    }

    /// Fire every trigger due at `now`, returning the dispatch jobs created.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Vec<ResourceId> {
        let due: Vec<(ScheduledJob, Option<DateTime<Utc>>)> = {
            let mut triggers = self.triggers.lock().await;
            triggers
                .values_mut()
                .filter(|t| t.next.is_some_and(|next| next <= now))
                .map(|t| {
                    t.next = next_run(&t.schedule, now);
                    (t.job.clone(), t.next)
                })
                .collect()
        };

        let mut spawned = Vec::with_capacity(due.len());
        for (job, next) in due {
            let payload = JobPayload::ScheduledDispatch(DispatchJobData {
                scheduled_job_id: job.id,
                task: job.task.clone(),
            });
            match self
                .service
                .submit(payload, Some(format!("schedule:{}", job.id)))
                .await
            {
                Ok(record) => {
                    info!(
                        scheduled_job_id = %job.id,
                        name = %job.name,
                        job_id = %record.id,
                        "Scheduled job triggered"
                    );
                    spawned.push(record.id);
                }
                Err(e) => {
                    warn!(scheduled_job_id = %job.id, error = %e, "Failed to dispatch scheduled job");
                }
            }

            if let Err(e) = self.scheduled.record_run(job.id, now, next).await {
                warn!(scheduled_job_id = %job.id, error = %e, "Failed to record scheduled run");
            }
        }
        spawned
    }
}
