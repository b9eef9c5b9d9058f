//! Central worker pool.
//!
//! Gates job execution with a global cap and a cap per job type. Callers that
//! do not fit wait in a single FIFO list. A release wakes, in order, every
//! waiter whose type has room, until the global cap is reached again. A
//! waiter whose type is at its own cap stays queued even while other types
//! are admitted past it.
//!
//! The state is a plain mutex-guarded struct. Waiters park on oneshot
//! channels.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::channel::oneshot;
use rollcall_config::WorkerLimits;
use rollcall_core::JobType;
use serde::Serialize;
use tracing::debug;

#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

struct Shared {
    limits: WorkerLimits,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    active: usize,
    active_by_type: HashMap<JobType, usize>,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
}

struct Waiter {
    id: u64,
    job_type: JobType,
    grant: oneshot::Sender<()>,
}

/// Utilization at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSnapshot {
    pub max_workers: usize,
    pub active_workers: usize,
    pub waiting_jobs: usize,
    pub max_by_type: BTreeMap<String, usize>,
    pub active_by_type: BTreeMap<String, usize>,
}

impl PoolState {
    fn active_for(&self, job_type: JobType) -> usize {
        self.active_by_type.get(&job_type).copied().unwrap_or(0)
    }

    fn fits(&self, limits: &WorkerLimits, job_type: JobType) -> bool {
        self.active < limits.max_workers && self.active_for(job_type) < limits.limit_for(job_type)
    }

    fn take(&mut self, job_type: JobType) {
        self.active += 1;
        *self.active_by_type.entry(job_type).or_insert(0) += 1;
    }

    fn give_back(&mut self, job_type: JobType) {
        self.active = self.active.saturating_sub(1);
        if let Some(count) = self.active_by_type.get_mut(&job_type) {
            *count = count.saturating_sub(1);
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand freed slots to waiters in FIFO order.
    fn wake(&self, state: &mut PoolState) {
        let mut i = 0;
        while i < state.waiters.len() && state.active < self.limits.max_workers {
            let job_type = state.waiters[i].job_type;
            if state.active_for(job_type) >= self.limits.limit_for(job_type) {
                i += 1;
                continue;
            }
            let Some(waiter) = state.waiters.remove(i) else {
                break;
            };
            state.take(job_type);
            if waiter.grant.send(()).is_err() {
                // Receiver went away without deregistering.
                state.give_back(job_type);
            }
        }
    }

    fn release(&self, job_type: JobType) {
        let mut state = self.lock();
        state.give_back(job_type);
        self.wake(&mut state);
    }
}

impl WorkerPool {
    pub fn new(limits: WorkerLimits) -> Self {
        Self {
            shared: Arc::new(Shared {
                limits,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn limits(&self) -> WorkerLimits {
        self.shared.limits
    }

    /// Wait for a slot for `job_type`. The slot is held until the returned
    /// permit is dropped.
    pub async fn acquire(&self, job_type: JobType) -> PoolPermit {
        loop {
            let (id, receiver) = {
                let mut state = self.shared.lock();
                if state.fits(&self.shared.limits, job_type) {
                    state.take(job_type);
                    return self.permit(job_type);
                }
                let (grant, receiver) = oneshot::channel();
                let id = state.next_waiter;
                state.next_waiter += 1;
                state.waiters.push_back(Waiter {
                    id,
                    job_type,
                    grant,
                });
                debug!(job_type = %job_type, waiting = state.waiters.len(), "Waiting for worker slot");
                (id, receiver)
            };

            let mut wait = Wait {
                shared: &self.shared,
                id,
                job_type,
                receiver,
                granted: false,
            };
            if (&mut wait.receiver).await.is_ok() {
                wait.granted = true;
                return self.permit(job_type);
            }
        }
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self, job_type: JobType) -> Option<PoolPermit> {
        let mut state = self.shared.lock();
        if state.fits(&self.shared.limits, job_type) {
            state.take(job_type);
            Some(self.permit(job_type))
        } else {
            None
        }
    }

    fn permit(&self, job_type: JobType) -> PoolPermit {
        PoolPermit {
            shared: Arc::clone(&self.shared),
            job_type,
        }
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.shared.lock();
        let limits = &self.shared.limits;
        PoolSnapshot {
            max_workers: limits.max_workers,
            active_workers: state.active,
            waiting_jobs: state.waiters.len(),
            max_by_type: JobType::ALL
                .iter()
                .map(|t| (t.as_str().to_string(), limits.limit_for(*t)))
                .collect(),
            active_by_type: JobType::ALL
                .iter()
                .map(|t| (t.as_str().to_string(), state.active_for(*t)))
                .collect(),
        }
    }
}

/// A held worker slot. Dropping it releases the slot.
pub struct PoolPermit {
    shared: Arc<Shared>,
    job_type: JobType,
}

impl PoolPermit {
    pub fn job_type(&self) -> JobType {
        self.job_type
    }
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        self.shared.release(self.job_type);
    }
}

/// Deregisters an abandoned waiter, returning any slot granted to it.
struct Wait<'a> {
    shared: &'a Shared,
    id: u64,
    job_type: JobType,
    receiver: oneshot::Receiver<()>,
    granted: bool,
}

impl Drop for Wait<'_> {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        let mut state = self.shared.lock();
        if let Some(pos) = state.waiters.iter().position(|w| w.id == self.id) {
            state.waiters.remove(pos);
            return;
        }
        if let Ok(Some(())) = self.receiver.try_recv() {
            state.give_back(self.job_type);
            self.shared.wake(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::time::Duration;

    fn limits(max: usize, import: usize, geocode: usize, scheduled: usize) -> WorkerLimits {
        WorkerLimits {
            max_workers: max,
            import_workers: import,
            geocode_workers: geocode,
            scheduled_workers: scheduled,
        }
    }

    async fn wait_for_waiters(pool: &WorkerPool, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while pool.snapshot().waiting_jobs != count {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_immediate_grant_within_caps() {
        let pool = WorkerPool::new(limits(3, 1, 2, 1));
        let a = pool.acquire(JobType::Geocode).await;
        let b = pool.acquire(JobType::Geocode).await;
        let c = pool.acquire(JobType::Import).await;

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.active_workers, 3);
        assert_eq!(snapshot.active_by_type["geocode"], 2);
        assert_eq!(snapshot.active_by_type["import"], 1);
        assert_eq!(snapshot.max_by_type["scheduled-dispatch"], 1);

        drop((a, b, c));
        assert_eq!(pool.snapshot().active_workers, 0);
    }

    #[tokio::test]
    async fn test_type_cap_blocks_even_with_global_room() {
        let pool = WorkerPool::new(limits(4, 1, 1, 1));
        let held = pool.acquire(JobType::Import).await;
        assert!(pool.try_acquire(JobType::Import).is_none());
        assert!(pool.acquire(JobType::Import).now_or_never().is_none());
        // The abandoned acquire left no waiter behind.
        assert_eq!(pool.snapshot().waiting_jobs, 0);

        let other = pool.try_acquire(JobType::Geocode);
        assert!(other.is_some());
        drop(held);
        assert!(pool.try_acquire(JobType::Import).is_some());
    }

    #[tokio::test]
    async fn test_waiters_woken_in_fifo_order() {
        let pool = WorkerPool::new(limits(1, 1, 1, 1));
        let first = pool.acquire(JobType::Geocode).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        for (n, job_type) in [(1, JobType::Import), (2, JobType::Geocode), (3, JobType::Import)] {
            let task_pool = pool.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let permit = task_pool.acquire(job_type).await;
                tx.send(n).unwrap();
                tokio::task::yield_now().await;
                drop(permit);
            });
            wait_for_waiters(&pool, n).await;
        }

        drop(first);
        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(rx.recv().await.unwrap());
        }
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(pool.snapshot().waiting_jobs, 0);
    }

    #[tokio::test]
    async fn test_release_skips_waiter_at_type_cap() {
        let pool = WorkerPool::new(limits(2, 1, 2, 1));
        let import = pool.acquire(JobType::Import).await;
        let geocode = pool.acquire(JobType::Geocode).await;

        let queued_import = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(JobType::Import).await })
        };
        wait_for_waiters(&pool, 1).await;
        let queued_geocode = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(JobType::Geocode).await })
        };
        wait_for_waiters(&pool, 2).await;

        // Freeing a geocode slot admits the geocode waiter; import is still at its cap.
        drop(geocode);
        let granted = tokio::time::timeout(Duration::from_secs(5), queued_geocode)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(granted.job_type(), JobType::Geocode);
        assert_eq!(pool.snapshot().waiting_jobs, 1);

        drop(granted);
        // A global slot is free but import is still capped by the held permit.
        assert_eq!(pool.snapshot().waiting_jobs, 1);

        drop(import);
        let granted = tokio::time::timeout(Duration::from_secs(5), queued_import)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(granted.job_type(), JobType::Import);

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.active_workers, 1);
        assert_eq!(snapshot.waiting_jobs, 0);
    }

    #[tokio::test]
    async fn test_caps_never_exceeded_under_load() {
        let pool = WorkerPool::new(limits(3, 1, 2, 1));
        let peak = Arc::new(Mutex::new((0usize, 0usize, 0usize)));

        let mut handles = Vec::new();
        for i in 0..30 {
            let pool = pool.clone();
            let peak = Arc::clone(&peak);
            let job_type = JobType::ALL[i % 3];
            handles.push(tokio::spawn(async move {
                let _permit = pool.acquire(job_type).await;
                let snapshot = pool.snapshot();
                {
                    let mut peak = peak.lock().unwrap();
                    peak.0 = peak.0.max(snapshot.active_workers);
                    peak.1 = peak.1.max(snapshot.active_by_type["import"]);
                    peak.2 = peak.2.max(snapshot.active_by_type["geocode"]);
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let (global, import, geocode) = *peak.lock().unwrap();
        assert!(global <= 3);
        assert!(import <= 1);
        assert!(geocode <= 2);
        assert_eq!(pool.snapshot().active_workers, 0);
    }

    #[tokio::test]
    async fn test_dropped_waiter_does_not_leak_slot() {
        let pool = WorkerPool::new(limits(1, 1, 1, 1));
        let held = pool.acquire(JobType::Import).await;

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let _permit = pool.acquire(JobType::Geocode).await;
                futures::future::pending::<()>().await;
            })
        };
        wait_for_waiters(&pool, 1).await;
        waiter.abort();
        let _ = waiter.await;

        assert_eq!(pool.snapshot().waiting_jobs, 0);
        drop(held);
        assert_eq!(pool.snapshot().active_workers, 0);
        assert!(pool.try_acquire(JobType::Geocode).is_some());
    }
}
