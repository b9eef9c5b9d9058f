//! Job scheduling for Rollcall.
//!
//! Queues dispatch work per job family, a shared worker pool bounds how much
//! of it runs at once, and processors drive each job record to a terminal
//! state. Recovery reconciles records left behind by a crash, and cron
//! triggers spawn recurring jobs.

pub mod cron;
pub mod error;
pub mod pool;
pub mod processors;
pub mod queue;
pub mod recovery;
pub mod runtime;
pub mod service;
pub mod worker;

pub use crate::cron::{CronScheduler, validate_cron_expression};
pub use error::{SchedulerError, SchedulerResult};
pub use pool::{PoolPermit, PoolSnapshot, WorkerPool};
pub use processors::{JobOutcome, JobProcessor};
pub use queue::{
    EnqueueOptions, EntryState, MemoryQueueBroker, PgQueueBroker, QueueBroker, QueueCounts,
    QueueEntry,
};
pub use recovery::{RecoveryService, RecoverySummary};
pub use runtime::{JobRuntime, RuntimeDeps, WorkersStatus, effective_limits};
pub use service::{JobService, Requeue};
pub use worker::{Consumer, InFlight};
