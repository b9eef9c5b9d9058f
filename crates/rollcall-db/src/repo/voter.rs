//! Voter record sink for import jobs.
//!
//! Records are keyed by their external id and stored as a flat field map.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::DbResult;

/// What an upsert did to the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    /// Stored fields were already identical.
    Unchanged,
}

#[async_trait]
pub trait VoterRepo: Send + Sync {
    async fn upsert(&self, external_id: &str, fields: &Map<String, Value>)
    -> DbResult<UpsertOutcome>;

    async fn count(&self) -> DbResult<u64>;
}

/// PostgreSQL implementation.
pub struct PgVoterRepo {
    pool: PgPool,
}

impl PgVoterRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VoterRepo for PgVoterRepo {
    async fn upsert(
        &self,
        external_id: &str,
        fields: &Map<String, Value>,
    ) -> DbResult<UpsertOutcome> {
        // xmax is zero only for freshly inserted tuples.
        let inserted: Option<bool> = sqlx::query_scalar(
            r#"
            INSERT INTO voters (id, external_id, fields, created_at, updated_at)
            VALUES ($1, $2, $3, NOW(), NOW())
            ON CONFLICT (external_id) DO UPDATE
                SET fields = EXCLUDED.fields, updated_at = NOW()
                WHERE voters.fields IS DISTINCT FROM EXCLUDED.fields
            RETURNING (xmax = 0)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(external_id)
        .bind(Value::Object(fields.clone()))
        .fetch_optional(&self.pool)
        .await?;

        Ok(match inserted {
            Some(true) => UpsertOutcome::Created,
            Some(false) => UpsertOutcome::Updated,
            None => UpsertOutcome::Unchanged,
        })
    }

    async fn count(&self) -> DbResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM voters")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

/// In-memory implementation for tests and embedded runs.
#[derive(Default)]
pub struct MemoryVoterRepo {
    records: RwLock<HashMap<String, Map<String, Value>>>,
}

impl MemoryVoterRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, external_id: &str) -> Option<Map<String, Value>> {
        self.records.read().await.get(external_id).cloned()
    }
}

#[async_trait]
impl VoterRepo for MemoryVoterRepo {
    async fn upsert(
        &self,
        external_id: &str,
        fields: &Map<String, Value>,
    ) -> DbResult<UpsertOutcome> {
        let mut records = self.records.write().await;
        let outcome = match records.get(external_id) {
            None => UpsertOutcome::Created,
            Some(existing) if existing == fields => return Ok(UpsertOutcome::Unchanged),
            Some(_) => UpsertOutcome::Updated,
        };
        records.insert(external_id.to_string(), fields.clone());
        Ok(outcome)
    }

    async fn count(&self) -> DbResult<u64> {
        Ok(self.records.read().await.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn test_upsert_outcomes() {
        let repo = MemoryVoterRepo::new();
        let first = fields(json!({ "name": "Ada", "precinct": "12" }));
        let moved = fields(json!({ "name": "Ada", "precinct": "14" }));

        assert_eq!(repo.upsert("V1", &first).await.unwrap(), UpsertOutcome::Created);
        assert_eq!(repo.upsert("V1", &first).await.unwrap(), UpsertOutcome::Unchanged);
        assert_eq!(repo.upsert("V1", &moved).await.unwrap(), UpsertOutcome::Updated);
        assert_eq!(repo.count().await.unwrap(), 1);
        assert_eq!(repo.get("V1").await.unwrap()["precinct"], "14");
    }
}
