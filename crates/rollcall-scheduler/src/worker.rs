//! Queue consumers that feed jobs through the worker pool.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rollcall_core::{JobType, ResourceId};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::pool::WorkerPool;
use crate::processors::{JobOutcome, JobProcessor};
use crate::queue::QueueEntry;
use crate::service::JobService;

/// Jobs currently claimed by a consumer in this process.
#[derive(Clone, Default)]
pub struct InFlight {
    ids: Arc<Mutex<HashSet<ResourceId>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark `id` in flight until the guard drops.
    pub fn hold(&self, id: ResourceId) -> InFlightGuard {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        InFlightGuard {
            ids: self.ids.clone(),
            id,
        }
    }
}

pub struct InFlightGuard {
    ids: Arc<Mutex<HashSet<ResourceId>>>,
    id: ResourceId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Claims entries from one queue and runs them once the pool has room.
pub struct Consumer {
    id: String,
    job_type: JobType,
    service: JobService,
    pool: WorkerPool,
    processor: Arc<dyn JobProcessor>,
    in_flight: InFlight,
    poll_interval: Duration,
}

impl Consumer {
    pub fn new(
        id: impl Into<String>,
        job_type: JobType,
        service: JobService,
        pool: WorkerPool,
        processor: Arc<dyn JobProcessor>,
        in_flight: InFlight,
    ) -> Self {
        Self {
            id: id.into(),
            job_type,
            service,
            pool,
            processor,
            in_flight,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run until `shutdown` flips to true. A job already running is
    /// finished before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let queue = self.job_type.queue_name();
        info!(worker_id = %self.id, queue, "Starting consumer");

        while !*shutdown.borrow() {
            match self.service.broker().claim(queue, &self.id).await {
                Ok(Some(entry)) => {
                    if !self.handle(entry, &mut shutdown).await {
                        break;
                    }
                }
                Ok(None) => {
                    self.idle(self.poll_interval, &mut shutdown).await;
                }
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "Failed to claim queue entry");
                    self.idle(self.poll_interval * 5, &mut shutdown).await;
                }
            }
        }

        info!(worker_id = %self.id, queue, "Consumer stopped");
    }

    /// Returns false if shutdown arrived while waiting for a pool slot.
    async fn handle(&self, entry: QueueEntry, shutdown: &mut watch::Receiver<bool>) -> bool {
        let queue = self.job_type.queue_name();
        let job_id = entry.id;
        let _held = self.in_flight.hold(job_id);
        debug!(worker_id = %self.id, job_id = %job_id, "Claimed queue entry");

        let permit = tokio::select! {
            permit = self.pool.acquire(self.job_type) => permit,
            _ = stopped(shutdown) => {
                if let Err(e) = self.service.broker().release(queue, job_id).await {
                    warn!(job_id = %job_id, error = %e, "Failed to release queue entry");
                }
                return false;
            }
        };

        let result = self.processor.process(job_id).await;
        drop(permit);

        let broker = self.service.broker();
        let (settled, outcome) = match result {
            Ok(outcome) => {
                debug!(job_id = %job_id, outcome = ?outcome, "Job run finished");
                (broker.complete(queue, job_id, &self.id).await, Some(outcome))
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Job processing error");
                let settled = broker.fail(queue, job_id, &self.id, &e.to_string()).await;
                (settled, None)
            }
        };
        if let Err(e) = settled {
            warn!(job_id = %job_id, error = %e, "Failed to settle queue entry");
        }

        if outcome == Some(JobOutcome::Paused) {
            if let Err(e) = self.service.requeue_if_resumed(job_id).await {
                warn!(job_id = %job_id, error = %e, "Failed to re-queue resumed job");
            }
        }
        true
    }

    async fn idle(&self, duration: Duration, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = sleep(duration) => {}
            _ = stopped(shutdown) => {}
        }
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    // An error means the sender is gone, which also means stop.
    let _ = shutdown.wait_for(|stop| *stop).await;
}
