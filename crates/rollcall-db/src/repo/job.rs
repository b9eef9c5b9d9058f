//! Job record repository.
//!
//! Every status write is a compare-and-set against the statuses the state
//! machine allows, so concurrent writers (a control request racing a
//! processor) can never move a job out of a terminal state.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollcall_core::job::{ERROR_LOG_CAP, RecoveryInfo, append_capped, clamp_processed};
use rollcall_core::{
    ErrorLogEntry, JobData, JobRecord, JobStatus, JobType, OutputStats, ProgressUpdate,
    ResourceId,
};
use sqlx::{PgConnection, PgPool};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{DbError, DbResult};

/// Database row for jobs.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub job_type: String,
    pub status: String,
    pub total_items: i64,
    pub processed_items: i64,
    pub output_stats: serde_json::Value,
    pub error_log: serde_json::Value,
    pub data: serde_json::Value,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = DbError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let job_type = JobType::canonicalize(&row.job_type)
            .ok_or_else(|| DbError::InvalidData(format!("Unknown job type: {}", row.job_type)))?;
        let status: JobStatus = row
            .status
            .parse()
            .map_err(|_| DbError::InvalidData(format!("Unknown job status: {}", row.status)))?;

        let output_stats = OutputStats::from_value(job_type, row.output_stats).map_err(|e| {
            DbError::InvalidData(format!("job {} output stats: {}", row.id, e))
        })?;
        let error_log: Vec<ErrorLogEntry> = serde_json::from_value(row.error_log)
            .map_err(|e| DbError::InvalidData(format!("job {} error log: {}", row.id, e)))?;
        let data: JobData = serde_json::from_value(row.data)?;

        Ok(JobRecord {
            id: ResourceId::from_uuid(row.id),
            job_type,
            status,
            total_items: row.total_items.max(0) as u64,
            processed_items: row.processed_items.max(0) as u64,
            output_stats,
            error_log,
            data,
            created_by: row.created_by,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

/// Read filter for job listings.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Empty matches every status.
    pub statuses: Vec<JobStatus>,
    /// Empty matches every family.
    pub job_types: Vec<JobType>,
    pub limit: Option<i64>,
}

impl JobFilter {
    pub fn with_statuses(statuses: &[JobStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            ..Default::default()
        }
    }

    fn matches(&self, job: &JobRecord) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && (self.job_types.is_empty() || self.job_types.contains(&job.job_type))
    }
}

#[async_trait]
pub trait JobRepo: Send + Sync {
    async fn create(&self, job: &JobRecord) -> DbResult<JobRecord>;
    async fn get(&self, id: ResourceId) -> DbResult<JobRecord>;

    /// Newest first.
    async fn list(&self, filter: &JobFilter) -> DbResult<Vec<JobRecord>>;

    /// Current status only; processors poll this between batches.
    async fn status(&self, id: ResourceId) -> DbResult<JobStatus>;

    /// Move a job to `to` if its current status is in `from` and the state
    /// machine allows the edge. Terminal targets stamp `completed_at`.
    async fn transition(
        &self,
        id: ResourceId,
        from: &[JobStatus],
        to: JobStatus,
    ) -> DbResult<JobRecord>;

    /// Hand a job to a processor: `pending -> processing` stamps `started_at`,
    /// an already `processing` job (resume handoff) is accepted as is.
    /// Returns `None` when the job is paused or terminal.
    async fn begin(&self, id: ResourceId) -> DbResult<Option<JobRecord>>;

    /// Write counters, merge stats, store the cursor and append errors.
    /// Never touches status.
    async fn update_progress(&self, id: ResourceId, update: &ProgressUpdate) -> DbResult<()>;

    async fn append_errors(&self, id: ResourceId, entries: &[ErrorLogEntry]) -> DbResult<()>;

    /// Merge final stats and flip `processing -> completed` in one write.
    async fn complete(&self, id: ResourceId, stats: Option<&OutputStats>) -> DbResult<JobRecord>;

    /// Append a fatal entry and flip to `failed` from pending or processing.
    async fn fail(&self, id: ResourceId, entry: ErrorLogEntry) -> DbResult<JobRecord>;

    /// Recovery reset: `processing -> pending`, clearing timestamps and
    /// recording the recovery metadata.
    async fn reset_for_recovery(&self, id: ResourceId, info: &RecoveryInfo)
    -> DbResult<JobRecord>;

    /// Delete terminal jobs finished before `older_than`, always keeping the
    /// `keep_min` most recently finished ones.
    async fn cleanup(&self, older_than: DateTime<Utc>, keep_min: u32) -> DbResult<u64>;
}

fn status_strings(statuses: &[JobStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

const TERMINAL: [JobStatus; 3] = [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled];

/// PostgreSQL implementation.
pub struct PgJobRepo {
    pool: PgPool,
}

impl PgJobRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Explain why a compare-and-set matched no row.
    async fn rejected(&self, id: ResourceId, to: JobStatus) -> DbError {
        match self.status(id).await {
            Ok(from) => DbError::InvalidTransition { from, to },
            Err(e) => e,
        }
    }
}

async fn append_errors_in(
    conn: &mut PgConnection,
    id: Uuid,
    entries: &[ErrorLogEntry],
) -> DbResult<()> {
    if entries.is_empty() {
        return Ok(());
    }
    sqlx::query(
        r#"
        UPDATE jobs SET error_log = (
            SELECT COALESCE(jsonb_agg(entry ORDER BY ord), '[]'::jsonb)
            FROM (
                SELECT entry, ord
                FROM jsonb_array_elements(jobs.error_log || $2::jsonb) WITH ORDINALITY AS t(entry, ord)
                ORDER BY ord DESC
                LIMIT $3
            ) recent
        )
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(serde_json::to_value(entries)?)
    .bind(ERROR_LOG_CAP as i64)
    .execute(conn)
    .await?;

    Ok(())
}

#[async_trait]
impl JobRepo for PgJobRepo {
    async fn create(&self, job: &JobRecord) -> DbResult<JobRecord> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO jobs (
                id, job_type, status, total_items, processed_items, output_stats,
                error_log, data, created_by, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.job_type.as_str())
        .bind(job.status.as_str())
        .bind(job.total_items as i64)
        .bind(job.processed_items as i64)
        .bind(serde_json::Value::Object(job.output_stats.to_patch()))
        .bind(serde_json::to_value(&job.error_log)?)
        .bind(serde_json::to_value(&job.data)?)
        .bind(job.created_by.as_deref())
        .bind(job.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                DbError::Duplicate(format!("job {}", job.id))
            }
            other => DbError::Database(other),
        })?;

        row.try_into()
    }

    async fn get(&self, id: ResourceId) -> DbResult<JobRecord> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;

        row.try_into()
    }

    async fn list(&self, filter: &JobFilter) -> DbResult<Vec<JobRecord>> {
        let types: Vec<String> = filter
            .job_types
            .iter()
            .map(|t| t.as_str().to_string())
            .collect();

        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM jobs
            WHERE (cardinality($1::text[]) = 0 OR status = ANY($1))
              AND (cardinality($2::text[]) = 0 OR job_type = ANY($2))
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "#,
        )
        .bind(status_strings(&filter.statuses))
        .bind(types)
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    async fn status(&self, id: ResourceId) -> DbResult<JobStatus> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        let status = status.ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        status
            .parse()
            .map_err(|_| DbError::InvalidData(format!("Unknown job status: {}", status)))
    }

    async fn transition(
        &self,
        id: ResourceId,
        from: &[JobStatus],
        to: JobStatus,
    ) -> DbResult<JobRecord> {
        let allowed: Vec<JobStatus> = from
            .iter()
            .copied()
            .filter(|s| s.can_transition_to(to))
            .collect();

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs SET
                status = $2,
                started_at = CASE WHEN $2 = 'processing' THEN COALESCE(started_at, NOW()) ELSE started_at END,
                completed_at = CASE WHEN $3 THEN NOW() ELSE completed_at END
            WHERE id = $1 AND status = ANY($4)
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(to.as_str())
        .bind(to.is_terminal())
        .bind(status_strings(&allowed))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(self.rejected(id, to).await),
        }
    }

    async fn begin(&self, id: ResourceId) -> DbResult<Option<JobRecord>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs SET status = 'processing', started_at = COALESCE(started_at, NOW())
            WHERE id = $1 AND status IN ('pending', 'processing')
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(row.try_into()?)),
            None => {
                // Distinguish "not claimable" from "does not exist".
                self.status(id).await?;
                Ok(None)
            }
        }
    }

    async fn update_progress(&self, id: ResourceId, update: &ProgressUpdate) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let stats = update
            .stats
            .as_ref()
            .map(|s| serde_json::Value::Object(s.to_patch()))
            .unwrap_or_else(|| serde_json::json!({}));

        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                total_items = COALESCE($3, total_items),
                processed_items = CASE
                    WHEN COALESCE($3, total_items) > 0 THEN LEAST($2, COALESCE($3, total_items))
                    ELSE $2
                END,
                output_stats = output_stats || $4::jsonb,
                data = CASE
                    WHEN $5::text IS NULL THEN data
                    ELSE jsonb_set(data, '{cursor}', to_jsonb($5::text))
                END
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(update.processed_items as i64)
        .bind(update.total_items.map(|t| t as i64))
        .bind(stats)
        .bind(update.cursor.as_deref())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("job {}", id)));
        }

        append_errors_in(&mut tx, *id.as_uuid(), &update.errors).await?;
        tx.commit().await?;

        Ok(())
    }

    async fn append_errors(&self, id: ResourceId, entries: &[ErrorLogEntry]) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        append_errors_in(&mut conn, *id.as_uuid(), entries).await
    }

    async fn complete(&self, id: ResourceId, stats: Option<&OutputStats>) -> DbResult<JobRecord> {
        let stats = stats
            .map(|s| serde_json::Value::Object(s.to_patch()))
            .unwrap_or_else(|| serde_json::json!({}));

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs SET
                output_stats = output_stats || $2::jsonb,
                status = 'completed',
                completed_at = NOW()
            WHERE id = $1 AND status = 'processing'
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(stats)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(self.rejected(id, JobStatus::Completed).await),
        }
    }

    async fn fail(&self, id: ResourceId, entry: ErrorLogEntry) -> DbResult<JobRecord> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1 FOR UPDATE")
                .bind(id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?;
        let current: JobStatus = current
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?
            .parse()
            .map_err(|_| DbError::InvalidData(format!("Unknown job status for {}", id)))?;

        if !current.can_transition_to(JobStatus::Failed) {
            return Err(DbError::InvalidTransition {
                from: current,
                to: JobStatus::Failed,
            });
        }

        append_errors_in(&mut tx, *id.as_uuid(), std::slice::from_ref(&entry)).await?;

        let row = sqlx::query_as::<_, JobRow>(
            "UPDATE jobs SET status = 'failed', completed_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(id.as_uuid())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        row.try_into()
    }

    async fn reset_for_recovery(
        &self,
        id: ResourceId,
        info: &RecoveryInfo,
    ) -> DbResult<JobRecord> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs SET
                status = 'pending',
                started_at = NULL,
                completed_at = NULL,
                data = jsonb_set(data, '{recovery}', $2::jsonb)
            WHERE id = $1 AND status = 'processing'
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(serde_json::to_value(info)?)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(self.rejected(id, JobStatus::Pending).await),
        }
    }

    async fn cleanup(&self, older_than: DateTime<Utc>, keep_min: u32) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status = ANY($1)
              AND completed_at < $2
              AND id NOT IN (
                  SELECT id FROM jobs
                  WHERE status = ANY($1)
                  ORDER BY completed_at DESC NULLS LAST
                  LIMIT $3
              )
            "#,
        )
        .bind(status_strings(&TERMINAL))
        .bind(older_than)
        .bind(keep_min as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

/// In-memory implementation for tests and embedded runs.
#[derive(Default)]
pub struct MemoryJobRepo {
    jobs: RwLock<HashMap<ResourceId, JobRecord>>,
}

impl MemoryJobRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(id: ResourceId) -> DbError {
    DbError::NotFound(format!("job {}", id))
}

#[async_trait]
impl JobRepo for MemoryJobRepo {
    async fn create(&self, job: &JobRecord) -> DbResult<JobRecord> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(DbError::Duplicate(format!("job {}", job.id)));
        }
        jobs.insert(job.id, job.clone());
        Ok(job.clone())
    }

    async fn get(&self, id: ResourceId) -> DbResult<JobRecord> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    async fn list(&self, filter: &JobFilter) -> DbResult<Vec<JobRecord>> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<JobRecord> =
            jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            matching.truncate(limit.max(0) as usize);
        }
        Ok(matching)
    }

    async fn status(&self, id: ResourceId) -> DbResult<JobStatus> {
        self.jobs
            .read()
            .await
            .get(&id)
            .map(|j| j.status)
            .ok_or_else(|| not_found(id))
    }

    async fn transition(
        &self,
        id: ResourceId,
        from: &[JobStatus],
        to: JobStatus,
    ) -> DbResult<JobRecord> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or_else(|| not_found(id))?;

        if !from.contains(&job.status) || !job.status.can_transition_to(to) {
            return Err(DbError::InvalidTransition {
                from: job.status,
                to,
            });
        }

        job.status = to;
        if to == JobStatus::Processing && job.started_at.is_none() {
            job.started_at = Some(Utc::now());
        }
        if to.is_terminal() {
            job.completed_at = Some(Utc::now());
        }
        Ok(job.clone())
    }

    async fn begin(&self, id: ResourceId) -> DbResult<Option<JobRecord>> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or_else(|| not_found(id))?;

        match job.status {
            JobStatus::Pending | JobStatus::Processing => {
                job.status = JobStatus::Processing;
                if job.started_at.is_none() {
                    job.started_at = Some(Utc::now());
                }
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn update_progress(&self, id: ResourceId, update: &ProgressUpdate) -> DbResult<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or_else(|| not_found(id))?;

        if let Some(total) = update.total_items {
            job.total_items = total;
        }
        job.processed_items = clamp_processed(update.processed_items, job.total_items);
        if let Some(stats) = &update.stats {
            job.output_stats
                .merge(stats)
                .map_err(|e| DbError::InvalidData(e.to_string()))?;
        }
        if let Some(cursor) = &update.cursor {
            job.data.cursor = Some(cursor.clone());
        }
        append_capped(&mut job.error_log, update.errors.iter().cloned());
        Ok(())
    }

    async fn append_errors(&self, id: ResourceId, entries: &[ErrorLogEntry]) -> DbResult<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or_else(|| not_found(id))?;
        append_capped(&mut job.error_log, entries.iter().cloned());
        Ok(())
    }

    async fn complete(&self, id: ResourceId, stats: Option<&OutputStats>) -> DbResult<JobRecord> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or_else(|| not_found(id))?;

        if job.status != JobStatus::Processing {
            return Err(DbError::InvalidTransition {
                from: job.status,
                to: JobStatus::Completed,
            });
        }
        if let Some(stats) = stats {
            job.output_stats
                .merge(stats)
                .map_err(|e| DbError::InvalidData(e.to_string()))?;
        }
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        Ok(job.clone())
    }

    async fn fail(&self, id: ResourceId, entry: ErrorLogEntry) -> DbResult<JobRecord> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or_else(|| not_found(id))?;

        if !job.status.can_transition_to(JobStatus::Failed) {
            return Err(DbError::InvalidTransition {
                from: job.status,
                to: JobStatus::Failed,
            });
        }
        append_capped(&mut job.error_log, [entry]);
        job.status = JobStatus::Failed;
        job.completed_at = Some(Utc::now());
        Ok(job.clone())
    }

    async fn reset_for_recovery(
        &self,
        id: ResourceId,
        info: &RecoveryInfo,
    ) -> DbResult<JobRecord> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or_else(|| not_found(id))?;

        if job.status != JobStatus::Processing {
            return Err(DbError::InvalidTransition {
                from: job.status,
                to: JobStatus::Pending,
            });
        }
        job.status = JobStatus::Pending;
        job.started_at = None;
        job.completed_at = None;
        job.data.recovery = Some(info.clone());
        Ok(job.clone())
    }

    async fn cleanup(&self, older_than: DateTime<Utc>, keep_min: u32) -> DbResult<u64> {
        let mut jobs = self.jobs.write().await;

        let mut terminal: Vec<(ResourceId, Option<DateTime<Utc>>)> = jobs
            .values()
            .filter(|j| j.status.is_terminal())
            .map(|j| (j.id, j.completed_at))
            .collect();
        // Most recently finished first; unfinished stamps sort last.
        terminal.sort_by(|a, b| match (a.1, b.1) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });

        let doomed: Vec<ResourceId> = terminal
            .into_iter()
            .skip(keep_min as usize)
            .filter(|(_, done)| done.is_some_and(|t| t < older_than))
            .map(|(id, _)| id)
            .collect();

        for id in &doomed {
            jobs.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rollcall_core::job::{GeocodeJobData, GeocodeStats, RecoveryMode};
    use rollcall_core::{ErrorCode, JobPayload};

    fn geocode_job() -> JobRecord {
        JobRecord::new(JobPayload::Geocode(GeocodeJobData::default()), None)
    }

    async fn processing_job(repo: &MemoryJobRepo) -> ResourceId {
        let job = repo.create(&geocode_job()).await.unwrap();
        repo.begin(job.id).await.unwrap();
        job.id
    }

    fn row_for(job: &JobRecord) -> JobRow {
        JobRow {
            id: *job.id.as_uuid(),
            job_type: job.job_type.as_str().to_string(),
            status: job.status.to_string(),
            total_items: 0,
            processed_items: 0,
            output_stats: serde_json::json!({}),
            error_log: serde_json::json!([]),
            data: serde_json::to_value(&job.data).unwrap(),
            created_by: None,
            created_at: job.created_at,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_row_conversion() {
        let job = geocode_job();
        let mut row = row_for(&job);
        row.output_stats = serde_json::json!({ "householdsGeocoded": 12 });
        row.error_log = serde_json::to_value(vec![ErrorLogEntry::new("no match", None)]).unwrap();

        let record = JobRecord::try_from(row).unwrap();
        assert_eq!(record.id, job.id);
        assert_eq!(record.error_log.len(), 1);
        let OutputStats::Geocode(stats) = record.output_stats else {
            panic!("expected geocode stats");
        };
        assert_eq!(stats.households_geocoded, Some(12));
    }

    #[test]
    fn test_corrupt_row_is_rejected() {
        let job = geocode_job();

        let mut row = row_for(&job);
        row.output_stats = serde_json::json!({ "householdsGeocoded": "a dozen" });
        let err = JobRecord::try_from(row).unwrap_err();
        assert!(matches!(err, DbError::InvalidData(ref msg) if msg.contains("output stats")));

        let mut row = row_for(&job);
        row.error_log = serde_json::json!([
            { "timestamp": Utc::now(), "message": "kept" },
            { "message": 42 }
        ]);
        let err = JobRecord::try_from(row).unwrap_err();
        assert!(matches!(err, DbError::InvalidData(ref msg) if msg.contains("error log")));

        let mut row = row_for(&job);
        row.error_log = serde_json::json!({ "not": "a list" });
        assert!(JobRecord::try_from(row).is_err());
    }

    #[tokio::test]
    async fn test_begin_stamps_started_at() {
        let repo = MemoryJobRepo::new();
        let job = repo.create(&geocode_job()).await.unwrap();
        assert!(job.started_at.is_none());

        let begun = repo.begin(job.id).await.unwrap().unwrap();
        assert_eq!(begun.status, JobStatus::Processing);
        assert!(begun.started_at.is_some());

        // A resume handoff accepts the processing job unchanged.
        let again = repo.begin(job.id).await.unwrap().unwrap();
        assert_eq!(again.started_at, begun.started_at);
    }

    #[tokio::test]
    async fn test_begin_refuses_paused() {
        let repo = MemoryJobRepo::new();
        let id = processing_job(&repo).await;
        repo.transition(id, &[JobStatus::Processing], JobStatus::Paused)
            .await
            .unwrap();
        assert!(repo.begin(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_terminal_status_is_never_overwritten() {
        let repo = MemoryJobRepo::new();
        let id = processing_job(&repo).await;
        repo.transition(id, &[JobStatus::Processing], JobStatus::Cancelled)
            .await
            .unwrap();

        let err = repo.complete(id, None).await.unwrap_err();
        assert!(matches!(
            err,
            DbError::InvalidTransition {
                from: JobStatus::Cancelled,
                to: JobStatus::Completed
            }
        ));
        assert!(repo.fail(id, ErrorLogEntry::new("late", None)).await.is_err());
        assert!(repo.begin(id).await.unwrap().is_none());
        assert_eq!(repo.status(id).await.unwrap(), JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_transition_respects_expected_from() {
        let repo = MemoryJobRepo::new();
        let job = repo.create(&geocode_job()).await.unwrap();
        let err = repo
            .transition(job.id, &[JobStatus::Paused], JobStatus::Processing)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_progress_clamps_and_merges() {
        let repo = MemoryJobRepo::new();
        let id = processing_job(&repo).await;

        repo.update_progress(
            id,
            &ProgressUpdate {
                processed_items: 50,
                total_items: Some(150),
                stats: Some(OutputStats::Geocode(GeocodeStats {
                    provider: Some("census".to_string()),
                    households_geocoded: Some(48),
                    ..Default::default()
                })),
                cursor: Some("abc".to_string()),
                errors: vec![ErrorLogEntry::new("no match", Some(ErrorCode::ItemFailed))],
            },
        )
        .await
        .unwrap();

        repo.update_progress(
            id,
            &ProgressUpdate {
                processed_items: 170,
                stats: Some(OutputStats::Geocode(GeocodeStats {
                    households_geocoded: Some(140),
                    ..Default::default()
                })),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let job = repo.get(id).await.unwrap();
        assert_eq!(job.total_items, 150);
        assert_eq!(job.processed_items, 150);
        assert_eq!(job.data.cursor.as_deref(), Some("abc"));
        assert_eq!(job.error_log.len(), 1);
        assert_eq!(job.status, JobStatus::Processing);
        match job.output_stats {
            OutputStats::Geocode(s) => {
                assert_eq!(s.provider.as_deref(), Some("census"));
                assert_eq!(s.households_geocoded, Some(140));
            }
            other => panic!("unexpected stats {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_error_log_stays_capped() {
        let repo = MemoryJobRepo::new();
        let id = processing_job(&repo).await;
        let entries: Vec<ErrorLogEntry> = (0..120)
            .map(|i| ErrorLogEntry::new(format!("e{}", i), None))
            .collect();
        repo.append_errors(id, &entries).await.unwrap();

        let job = repo.get(id).await.unwrap();
        assert_eq!(job.error_log.len(), ERROR_LOG_CAP);
        assert_eq!(job.error_log.last().unwrap().message, "e119");
    }

    #[tokio::test]
    async fn test_reset_for_recovery() {
        let repo = MemoryJobRepo::new();
        let id = processing_job(&repo).await;
        let info = RecoveryInfo {
            mode: RecoveryMode::UnexpectedShutdown,
            recovered_at: Utc::now(),
            checkpoint_index: Some(50),
        };

        let job = repo.reset_for_recovery(id, &info).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());
        assert_eq!(job.data.recovery, Some(info.clone()));

        // A second reset finds nothing to do.
        assert!(repo.reset_for_recovery(id, &info).await.is_err());
    }

    #[tokio::test]
    async fn test_list_filters_and_orders() {
        let repo = MemoryJobRepo::new();
        let first = repo.create(&geocode_job()).await.unwrap();
        let mut later = geocode_job();
        later.created_at = first.created_at + Duration::seconds(1);
        let later = repo.create(&later).await.unwrap();
        repo.begin(later.id).await.unwrap();

        let all = repo.list(&JobFilter::default()).await.unwrap();
        assert_eq!(all[0].id, later.id);

        let pending = repo
            .list(&JobFilter::with_statuses(&[JobStatus::Pending]))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, first.id);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_minimum() {
        let repo = MemoryJobRepo::new();
        for _ in 0..5 {
            let id = processing_job(&repo).await;
            repo.complete(id, None).await.unwrap();
        }
        let live = repo.create(&geocode_job()).await.unwrap();

        let future = Utc::now() + Duration::days(1);
        let deleted = repo.cleanup(future, 2).await.unwrap();
        assert_eq!(deleted, 3);

        let remaining = repo.list(&JobFilter::default()).await.unwrap();
        assert_eq!(remaining.len(), 3);
        assert!(remaining.iter().any(|j| j.id == live.id));
    }
}
