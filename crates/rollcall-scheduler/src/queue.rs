//! Work queues, one per job family.
//!
//! An entry's id is always the id of the job record it dispatches, so adding
//! the same job twice is a no-op and the record and its entry can be
//! reconciled independently. Entries are disposable: the job record is the
//! source of truth.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollcall_core::ResourceId;
use rollcall_db::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Waiting => "waiting",
            EntryState::Active => "active",
            EntryState::Completed => "completed",
            EntryState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryState::Completed | EntryState::Failed)
    }
}

impl std::str::FromStr for EntryState {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(EntryState::Waiting),
            "active" => Ok(EntryState::Active),
            "completed" => Ok(EntryState::Completed),
            "failed" => Ok(EntryState::Failed),
            other => Err(DbError::InvalidData(format!("Unknown entry state: {}", other))),
        }
    }
}

/// A dispatched unit of work.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: ResourceId,
    pub queue: String,
    pub payload: serde_json::Value,
    pub state: EntryState,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub available_at: DateTime<Utc>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Hold the entry back until this much time has passed.
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    fn available_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.delay
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| now + d)
            .unwrap_or(now)
    }
}

/// Entry counts for one queue. `delayed` entries are waiting but not yet
/// available.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub failed: u64,
    pub delayed: u64,
    pub completed: u64,
}

#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Add an entry. Returns `false` without touching anything when an entry
    /// with this id is already on the queue, whatever its state.
    async fn add(
        &self,
        queue: &str,
        id: ResourceId,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> DbResult<bool>;

    async fn get(&self, queue: &str, id: ResourceId) -> DbResult<Option<QueueEntry>>;

    async fn remove(&self, queue: &str, id: ResourceId) -> DbResult<bool>;

    /// Claim the oldest available waiting entry.
    async fn claim(&self, queue: &str, worker_id: &str) -> DbResult<Option<QueueEntry>>;

    /// Finish an entry. Ignored unless `worker_id` still holds the claim.
    async fn complete(&self, queue: &str, id: ResourceId, worker_id: &str) -> DbResult<()>;

    async fn fail(&self, queue: &str, id: ResourceId, worker_id: &str, error: &str)
    -> DbResult<()>;

    /// Return an active entry to waiting, dropping its claim.
    async fn release(&self, queue: &str, id: ResourceId) -> DbResult<()>;

    async fn counts(&self, queue: &str) -> DbResult<QueueCounts>;

    /// Delete completed and failed entries that finished before `before`.
    async fn purge_finished(&self, queue: &str, before: DateTime<Utc>) -> DbResult<u64>;
}

/// Database row for queue entries.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueEntryRow {
    pub id: Uuid,
    pub queue: String,
    pub payload: serde_json::Value,
    pub state: String,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub available_at: DateTime<Utc>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<QueueEntryRow> for QueueEntry {
    type Error = DbError;

    fn try_from(row: QueueEntryRow) -> Result<Self, Self::Error> {
        Ok(QueueEntry {
            id: ResourceId::from_uuid(row.id),
            queue: row.queue,
            payload: row.payload,
            state: row.state.parse()?,
            claimed_by: row.claimed_by,
            claimed_at: row.claimed_at,
            available_at: row.available_at,
            error: row.error,
            created_at: row.created_at,
            finished_at: row.finished_at,
        })
    }
}

/// Queue broker backed by PostgreSQL.
/// Claims use SKIP LOCKED so several processes can consume one queue.
pub struct PgQueueBroker {
    pool: PgPool,
}

impl PgQueueBroker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueueBroker for PgQueueBroker {
    async fn add(
        &self,
        queue: &str,
        id: ResourceId,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> DbResult<bool> {
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO queue_entries (id, queue, payload, state, available_at, created_at)
            VALUES ($1, $2, $3, 'waiting', $4, NOW())
            ON CONFLICT (queue, id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(id.as_uuid())
        .bind(queue)
        .bind(payload)
        .bind(options.available_at(Utc::now()))
        .fetch_optional(&self.pool)
        .await?;
        Ok(inserted.is_some())
    }

    async fn get(&self, queue: &str, id: ResourceId) -> DbResult<Option<QueueEntry>> {
        sqlx::query_as::<_, QueueEntryRow>(
            "SELECT * FROM queue_entries WHERE queue = $1 AND id = $2",
        )
        .bind(queue)
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .map(QueueEntry::try_from)
        .transpose()
    }

    async fn remove(&self, queue: &str, id: ResourceId) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM queue_entries WHERE queue = $1 AND id = $2")
            .bind(queue)
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn claim(&self, queue: &str, worker_id: &str) -> DbResult<Option<QueueEntry>> {
        sqlx::query_as::<_, QueueEntryRow>(
            r#"
            UPDATE queue_entries
            SET state = 'active', claimed_by = $2, claimed_at = NOW()
            WHERE queue = $1 AND id = (
                SELECT id FROM queue_entries
                WHERE queue = $1 AND state = 'waiting' AND available_at <= NOW()
                ORDER BY available_at ASC, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(queue)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?
        .map(QueueEntry::try_from)
        .transpose()
    }

    async fn complete(&self, queue: &str, id: ResourceId, worker_id: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE queue_entries
            SET state = 'completed', finished_at = NOW()
            WHERE queue = $1 AND id = $2 AND state = 'active' AND claimed_by = $3
            "#,
        )
        .bind(queue)
        .bind(id.as_uuid())
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(
        &self,
        queue: &str,
        id: ResourceId,
        worker_id: &str,
        error: &str,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE queue_entries
            SET state = 'failed', error = $4, finished_at = NOW()
            WHERE queue = $1 AND id = $2 AND state = 'active' AND claimed_by = $3
            "#,
        )
        .bind(queue)
        .bind(id.as_uuid())
        .bind(worker_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release(&self, queue: &str, id: ResourceId) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE queue_entries
            SET state = 'waiting', claimed_by = NULL, claimed_at = NULL
            WHERE queue = $1 AND id = $2 AND state = 'active'
            "#,
        )
        .bind(queue)
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn counts(&self, queue: &str) -> DbResult<QueueCounts> {
        let (waiting, delayed, active, completed, failed): (i64, i64, i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                    COUNT(*) FILTER (WHERE state = 'waiting' AND available_at <= NOW()),
                    COUNT(*) FILTER (WHERE state = 'waiting' AND available_at > NOW()),
                    COUNT(*) FILTER (WHERE state = 'active'),
                    COUNT(*) FILTER (WHERE state = 'completed'),
                    COUNT(*) FILTER (WHERE state = 'failed')
                FROM queue_entries
                WHERE queue = $1
                "#,
            )
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;

        Ok(QueueCounts {
            waiting: waiting.max(0) as u64,
            active: active.max(0) as u64,
            failed: failed.max(0) as u64,
            delayed: delayed.max(0) as u64,
            completed: completed.max(0) as u64,
        })
    }

    async fn purge_finished(&self, queue: &str, before: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM queue_entries
            WHERE queue = $1
              AND state IN ('completed', 'failed')
              AND finished_at < $2
            "#,
        )
        .bind(queue)
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// In-memory broker for tests and embedded runs.
#[derive(Default)]
pub struct MemoryQueueBroker {
    entries: RwLock<BTreeMap<(String, ResourceId), QueueEntry>>,
}

impl MemoryQueueBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry on a queue, oldest first.
    pub async fn entries(&self, queue: &str) -> Vec<QueueEntry> {
        let mut entries: Vec<QueueEntry> = self
            .entries
            .read()
            .await
            .values()
            .filter(|e| e.queue == queue)
            .cloned()
            .collect();
        entries.sort_by_key(|e| (e.created_at, e.id));
        entries
    }
}

fn key(queue: &str, id: ResourceId) -> (String, ResourceId) {
    (queue.to_string(), id)
}

#[async_trait]
impl QueueBroker for MemoryQueueBroker {
    async fn add(
        &self,
        queue: &str,
        id: ResourceId,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> DbResult<bool> {
        let mut entries = self.entries.write().await;
        let key = key(queue, id);
        if entries.contains_key(&key) {
            return Ok(false);
        }
        let now = Utc::now();
        entries.insert(
            key,
            QueueEntry {
                id,
                queue: queue.to_string(),
                payload,
                state: EntryState::Waiting,
                claimed_by: None,
                claimed_at: None,
                available_at: options.available_at(now),
                error: None,
                created_at: now,
                finished_at: None,
            },
        );
        Ok(true)
    }

    async fn get(&self, queue: &str, id: ResourceId) -> DbResult<Option<QueueEntry>> {
        Ok(self.entries.read().await.get(&key(queue, id)).cloned())
    }

    async fn remove(&self, queue: &str, id: ResourceId) -> DbResult<bool> {
        Ok(self.entries.write().await.remove(&key(queue, id)).is_some())
    }

    async fn claim(&self, queue: &str, worker_id: &str) -> DbResult<Option<QueueEntry>> {
        let mut entries = self.entries.write().await;
        let now = Utc::now();
        let next = entries
            .values_mut()
            .filter(|e| e.queue == queue && e.state == EntryState::Waiting && e.available_at <= now)
            .min_by_key(|e| (e.available_at, e.created_at, e.id));

        Ok(next.map(|entry| {
            entry.state = EntryState::Active;
            entry.claimed_by = Some(worker_id.to_string());
            entry.claimed_at = Some(now);
            entry.clone()
        }))
    }

    async fn complete(&self, queue: &str, id: ResourceId, worker_id: &str) -> DbResult<()> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(&key(queue, id)).filter(|e| {
            e.state == EntryState::Active && e.claimed_by.as_deref() == Some(worker_id)
        }) {
            entry.state = EntryState::Completed;
            entry.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn fail(
        &self,
        queue: &str,
        id: ResourceId,
        worker_id: &str,
        error: &str,
    ) -> DbResult<()> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(&key(queue, id)).filter(|e| {
            e.state == EntryState::Active && e.claimed_by.as_deref() == Some(worker_id)
        }) {
            entry.state = EntryState::Failed;
            entry.error = Some(error.to_string());
            entry.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn release(&self, queue: &str, id: ResourceId) -> DbResult<()> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries
            .get_mut(&key(queue, id))
            .filter(|e| e.state == EntryState::Active)
        {
            entry.state = EntryState::Waiting;
            entry.claimed_by = None;
            entry.claimed_at = None;
        }
        Ok(())
    }

    async fn counts(&self, queue: &str) -> DbResult<QueueCounts> {
        let entries = self.entries.read().await;
        let now = Utc::now();
        let mut counts = QueueCounts::default();
        for entry in entries.values().filter(|e| e.queue == queue) {
            match entry.state {
                EntryState::Waiting if entry.available_at > now => counts.delayed += 1,
                EntryState::Waiting => counts.waiting += 1,
                EntryState::Active => counts.active += 1,
                EntryState::Completed => counts.completed += 1,
                EntryState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn purge_finished(&self, queue: &str, before: DateTime<Utc>) -> DbResult<u64> {
        let mut entries = self.entries.write().await;
        let count = entries.len();
        entries.retain(|_, e| {
            e.queue != queue
                || !e.state.is_terminal()
                || e.finished_at.is_none_or(|at| at >= before)
        });
        Ok((count - entries.len()) as u64)
    }
}
