//! Scheduled job template repository.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollcall_core::{JobStatus, ResourceId, ScheduledJob, ScheduledTask};
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{DbError, DbResult};

/// Database row for scheduled jobs.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScheduledJobRow {
    pub id: Uuid,
    pub name: String,
    pub schedule: String,
    pub enabled: bool,
    pub task: serde_json::Value,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
    pub run_count: i64,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ScheduledJobRow> for ScheduledJob {
    type Error = DbError;

    fn try_from(row: ScheduledJobRow) -> Result<Self, Self::Error> {
        let task: ScheduledTask = serde_json::from_value(row.task)?;
        let last_status = row
            .last_status
            .map(|s| {
                s.parse::<JobStatus>()
                    .map_err(|_| DbError::InvalidData(format!("Unknown job status: {}", s)))
            })
            .transpose()?;

        Ok(ScheduledJob {
            id: ResourceId::from_uuid(row.id),
            name: row.name,
            schedule: row.schedule,
            enabled: row.enabled,
            task,
            last_run_at: row.last_run_at,
            next_run_at: row.next_run_at,
            last_status,
            run_count: row.run_count.max(0) as u64,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
pub trait ScheduledJobRepo: Send + Sync {
    async fn create(&self, job: &ScheduledJob) -> DbResult<ScheduledJob>;
    async fn get(&self, id: ResourceId) -> DbResult<ScheduledJob>;
    async fn list(&self) -> DbResult<Vec<ScheduledJob>>;
    async fn list_enabled(&self) -> DbResult<Vec<ScheduledJob>>;

    /// Replace name, schedule and task.
    async fn update(&self, job: &ScheduledJob) -> DbResult<ScheduledJob>;
    async fn set_enabled(&self, id: ResourceId, enabled: bool) -> DbResult<ScheduledJob>;
    async fn delete(&self, id: ResourceId) -> DbResult<()>;

    /// Record a trigger: bumps the run count and stamps the run times.
    async fn record_run(
        &self,
        id: ResourceId,
        ran_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> DbResult<()>;

    async fn set_next_run(&self, id: ResourceId, next_run_at: Option<DateTime<Utc>>)
    -> DbResult<()>;

    /// Outcome of the most recently spawned job.
    async fn set_last_status(&self, id: ResourceId, status: JobStatus) -> DbResult<()>;
}

/// PostgreSQL implementation.
pub struct PgScheduledJobRepo {
    pool: PgPool,
}

impl PgScheduledJobRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn not_found(id: ResourceId) -> DbError {
    DbError::NotFound(format!("scheduled job {}", id))
}

fn require_row(affected: u64, id: ResourceId) -> DbResult<()> {
    if affected == 0 {
        Err(not_found(id))
    } else {
        Ok(())
    }
}

#[async_trait]
impl ScheduledJobRepo for PgScheduledJobRepo {
    async fn create(&self, job: &ScheduledJob) -> DbResult<ScheduledJob> {
        let row = sqlx::query_as::<_, ScheduledJobRow>(
            r#"
            INSERT INTO scheduled_jobs (
                id, name, schedule, enabled, task, next_run_at, run_count, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 0, $7)
            RETURNING *
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.name)
        .bind(&job.schedule)
        .bind(job.enabled)
        .bind(serde_json::to_value(&job.task)?)
        .bind(job.next_run_at)
        .bind(job.created_at)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get(&self, id: ResourceId) -> DbResult<ScheduledJob> {
        let row =
            sqlx::query_as::<_, ScheduledJobRow>("SELECT * FROM scheduled_jobs WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| not_found(id))?;

        row.try_into()
    }

    async fn list(&self) -> DbResult<Vec<ScheduledJob>> {
        let rows = sqlx::query_as::<_, ScheduledJobRow>(
            "SELECT * FROM scheduled_jobs ORDER BY name, id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    async fn list_enabled(&self) -> DbResult<Vec<ScheduledJob>> {
        let rows = sqlx::query_as::<_, ScheduledJobRow>(
            "SELECT * FROM scheduled_jobs WHERE enabled ORDER BY name, id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    async fn update(&self, job: &ScheduledJob) -> DbResult<ScheduledJob> {
        let row = sqlx::query_as::<_, ScheduledJobRow>(
            r#"
            UPDATE scheduled_jobs SET name = $2, schedule = $3, task = $4, next_run_at = $5
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.name)
        .bind(&job.schedule)
        .bind(serde_json::to_value(&job.task)?)
        .bind(job.next_run_at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| not_found(job.id))?;

        row.try_into()
    }

    async fn set_enabled(&self, id: ResourceId, enabled: bool) -> DbResult<ScheduledJob> {
        let row = sqlx::query_as::<_, ScheduledJobRow>(
            "UPDATE scheduled_jobs SET enabled = $2 WHERE id = $1 RETURNING *",
        )
        .bind(id.as_uuid())
        .bind(enabled)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| not_found(id))?;

        row.try_into()
    }

    async fn delete(&self, id: ResourceId) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM scheduled_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;

        require_row(result.rows_affected(), id)
    }

    async fn record_run(
        &self,
        id: ResourceId,
        ran_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET last_run_at = $2, next_run_at = $3, run_count = run_count + 1
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(ran_at)
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;

        require_row(result.rows_affected(), id)
    }

    async fn set_next_run(
        &self,
        id: ResourceId,
        next_run_at: Option<DateTime<Utc>>,
    ) -> DbResult<()> {
        let result = sqlx::query("UPDATE scheduled_jobs SET next_run_at = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(next_run_at)
            .execute(&self.pool)
            .await?;

        require_row(result.rows_affected(), id)
    }

    async fn set_last_status(&self, id: ResourceId, status: JobStatus) -> DbResult<()> {
        let result = sqlx::query("UPDATE scheduled_jobs SET last_status = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;

        require_row(result.rows_affected(), id)
    }
}

/// In-memory implementation for tests and embedded runs.
#[derive(Default)]
pub struct MemoryScheduledJobRepo {
    jobs: RwLock<HashMap<ResourceId, ScheduledJob>>,
}

impl MemoryScheduledJobRepo {
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_job<T>(
        &self,
        id: ResourceId,
        f: impl FnOnce(&mut ScheduledJob) -> T + Send,
    ) -> DbResult<T> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or_else(|| not_found(id))?;
        Ok(f(job))
    }

    fn sorted(mut jobs: Vec<ScheduledJob>) -> Vec<ScheduledJob> {
        jobs.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        jobs
    }
}

#[async_trait]
impl ScheduledJobRepo for MemoryScheduledJobRepo {
    async fn create(&self, job: &ScheduledJob) -> DbResult<ScheduledJob> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(DbError::Duplicate(format!("scheduled job {}", job.id)));
        }
        let mut stored = job.clone();
        stored.run_count = 0;
        jobs.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get(&self, id: ResourceId) -> DbResult<ScheduledJob> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    async fn list(&self) -> DbResult<Vec<ScheduledJob>> {
        let jobs = self.jobs.read().await;
        Ok(Self::sorted(jobs.values().cloned().collect()))
    }

    async fn list_enabled(&self) -> DbResult<Vec<ScheduledJob>> {
        let jobs = self.jobs.read().await;
        Ok(Self::sorted(
            jobs.values().filter(|j| j.enabled).cloned().collect(),
        ))
    }

    async fn update(&self, job: &ScheduledJob) -> DbResult<ScheduledJob> {
        let update = job.clone();
        self.with_job(job.id, move |stored| {
            stored.name = update.name;
            stored.schedule = update.schedule;
            stored.task = update.task;
            stored.next_run_at = update.next_run_at;
            stored.clone()
        })
        .await
    }

    async fn set_enabled(&self, id: ResourceId, enabled: bool) -> DbResult<ScheduledJob> {
        self.with_job(id, |stored| {
            stored.enabled = enabled;
            stored.clone()
        })
        .await
    }

    async fn delete(&self, id: ResourceId) -> DbResult<()> {
        self.jobs
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found(id))
    }

    async fn record_run(
        &self,
        id: ResourceId,
        ran_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> DbResult<()> {
        self.with_job(id, |stored| {
            stored.last_run_at = Some(ran_at);
            stored.next_run_at = next_run_at;
            stored.run_count += 1;
        })
        .await
    }

    async fn set_next_run(
        &self,
        id: ResourceId,
        next_run_at: Option<DateTime<Utc>>,
    ) -> DbResult<()> {
        self.with_job(id, |stored| stored.next_run_at = next_run_at)
            .await
    }

    async fn set_last_status(&self, id: ResourceId, status: JobStatus) -> DbResult<()> {
        self.with_job(id, |stored| stored.last_status = Some(status))
            .await
    }
}
