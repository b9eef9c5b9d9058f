//! Process-scoped wiring of pool, consumers, processors and cron.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rollcall_config::{SystemConfig, WorkerLimits};
use rollcall_core::JobType;
use rollcall_db::{HouseholdRepo, JobRepo, ScheduledJobRepo, SettingsRepo, VoterRepo};
use rollcall_geocode::ProviderRegistry;
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::SchedulerResult;
use crate::cron::CronScheduler;
use crate::pool::{PoolSnapshot, WorkerPool};
use crate::processors::{
    BatchSettings, DispatchProcessor, GeocodeProcessor, ImportProcessor, ImportSource, JobProcessor,
    VoterSink,
};
use crate::queue::{QueueBroker, QueueCounts};
use crate::recovery::RecoveryService;
use crate::service::JobService;
use crate::worker::{Consumer, InFlight};

/// Storage and integrations the runtime drives.
pub struct RuntimeDeps {
    pub jobs: Arc<dyn JobRepo>,
    pub households: Arc<dyn HouseholdRepo>,
    pub voters: Arc<dyn VoterRepo>,
    pub scheduled: Arc<dyn ScheduledJobRepo>,
    pub broker: Arc<dyn QueueBroker>,
    pub registry: Arc<ProviderRegistry>,
    pub import_source: Arc<dyn ImportSource>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkersStatus {
    pub active_workers: usize,
    pub worker_names: Vec<String>,
    pub pool: PoolSnapshot,
    pub queues: BTreeMap<String, QueueCounts>,
}

struct ConsumerHandle {
    name: String,
    handle: JoinHandle<()>,
}

/// Owns everything that runs jobs in this process. Nothing starts until
/// [`JobRuntime::start`].
pub struct JobRuntime {
    config: SystemConfig,
    service: JobService,
    pool: WorkerPool,
    in_flight: InFlight,
    processors: BTreeMap<JobType, Arc<dyn JobProcessor>>,
    recovery: RecoveryService,
    cron: Arc<CronScheduler>,
    scheduled: Arc<dyn ScheduledJobRepo>,
    poll_interval: Duration,
    shutdown: watch::Sender<bool>,
    consumers: Mutex<Vec<ConsumerHandle>>,
}

impl JobRuntime {
    pub fn new(config: SystemConfig, deps: RuntimeDeps) -> Self {
        let service = JobService::new(deps.jobs.clone(), deps.broker.clone());
        let settings = BatchSettings::from(&config.geocode);
        let in_flight = InFlight::new();

        let processors: [Arc<dyn JobProcessor>; 3] = [
            Arc::new(ImportProcessor::new(
                deps.jobs.clone(),
                deps.import_source,
                Arc::new(VoterSink::new(deps.voters)),
                settings,
            )),
            Arc::new(GeocodeProcessor::new(
                deps.jobs.clone(),
                deps.households,
                deps.registry,
                settings,
            )),
            Arc::new(DispatchProcessor::new(
                deps.scheduled.clone(),
                service.clone(),
                config.retention,
            )),
        ];

        Self {
            pool: WorkerPool::new(config.workers),
            processors: processors.into_iter().map(|p| (p.job_type(), p)).collect(),
            recovery: RecoveryService::new(service.clone(), in_flight.clone()),
            cron: Arc::new(CronScheduler::new(deps.scheduled.clone(), service.clone())),
            scheduled: deps.scheduled,
            in_flight,
            service,
            config,
            poll_interval: Duration::from_secs(1),
            shutdown: watch::Sender::new(false),
            consumers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn service(&self) -> &JobService {
        &self.service
    }

    pub fn recovery(&self) -> &RecoveryService {
        &self.recovery
    }

    pub fn cron(&self) -> &Arc<CronScheduler> {
        &self.cron
    }

    pub fn scheduled(&self) -> &Arc<dyn ScheduledJobRepo> {
        &self.scheduled
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Recover leftovers, then start consumers and the cron loop.
    pub async fn start(&self) -> SchedulerResult<()> {
        let mut consumers = self.consumers.lock().await;
        if !consumers.is_empty() {
            return Ok(());
        }

        if self.config.recover_on_startup {
            self.recovery.recover().await?;
        }

        self.shutdown.send_replace(false);
        let pid = std::process::id();
        for (job_type, processor) in &self.processors {
            let queue = job_type.queue_name();
            for n in 0..self.config.consumers.for_type(*job_type) {
                let name = format!("{}-{}-{}", queue, pid, n);
                let consumer = Consumer::new(
                    name.clone(),
                    *job_type,
                    self.service.clone(),
                    self.pool.clone(),
                    processor.clone(),
                    self.in_flight.clone(),
                )
                .with_poll_interval(self.poll_interval);
                let shutdown = self.shutdown.subscribe();
                let handle = tokio::spawn(async move { consumer.run(shutdown).await });
                consumers.push(ConsumerHandle { name, handle });
            }
        }

        self.cron.start().await?;
        info!(
            consumers = consumers.len(),
            max_workers = self.config.workers.max_workers,
            "Job runtime started"
        );
        Ok(())
    }

    /// Stop claiming work and wait for running jobs to reach a stopping point.
    pub async fn stop(&self) {
        self.cron.stop().await;
        self.shutdown.send_replace(true);

        let consumers = std::mem::take(&mut *self.consumers.lock().await);
        for consumer in consumers {
            if let Err(e) = consumer.handle.await {
                warn!(worker_id = %consumer.name, error = %e, "Consumer ended abnormally");
            }
        }
        info!("Job runtime stopped");
    }

    pub async fn status(&self) -> SchedulerResult<WorkersStatus> {
        let worker_names: Vec<String> = self
            .consumers
            .lock()
            .await
            .iter()
            .map(|c| c.name.clone())
            .collect();

        let mut queues = BTreeMap::new();
        for job_type in JobType::ALL {
            let queue = job_type.queue_name();
            queues.insert(queue.to_string(), self.service.broker().counts(queue).await?);
        }

        Ok(WorkersStatus {
            active_workers: worker_names.len(),
            worker_names,
            pool: self.pool.snapshot(),
            queues,
        })
    }
}

/// Worker limits saved through the settings API win over the config file.
pub async fn effective_limits(settings: &dyn SettingsRepo, file: WorkerLimits) -> WorkerLimits {
    match settings.worker_limits().await {
        Ok(Some(saved)) => match saved.validate() {
            Ok(()) => saved,
            Err(e) => {
                warn!(error = %e, "Ignoring invalid saved worker limits");
                file
            }
        },
        Ok(None) => file,
        Err(e) => {
            warn!(error = %e, "Failed to read saved worker limits");
            file
        }
    }
}
