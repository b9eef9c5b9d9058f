//! Key/value system settings.

use std::collections::HashMap;

use async_trait::async_trait;
use rollcall_config::WorkerLimits;
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::DbResult;

const WORKER_LIMITS_KEY: &str = "worker_limits";

#[async_trait]
pub trait SettingsRepo: Send + Sync {
    async fn get_raw(&self, key: &str) -> DbResult<Option<serde_json::Value>>;
    async fn put_raw(&self, key: &str, value: serde_json::Value) -> DbResult<()>;

    /// Persisted worker limits, if any were ever saved.
    async fn worker_limits(&self) -> DbResult<Option<WorkerLimits>> {
        match self.get_raw(WORKER_LIMITS_KEY).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn save_worker_limits(&self, limits: &WorkerLimits) -> DbResult<()> {
        self.put_raw(WORKER_LIMITS_KEY, serde_json::to_value(limits)?)
            .await
    }
}

/// PostgreSQL implementation.
pub struct PgSettingsRepo {
    pool: PgPool,
}

impl PgSettingsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsRepo for PgSettingsRepo {
    async fn get_raw(&self, key: &str) -> DbResult<Option<serde_json::Value>> {
        let value = sqlx::query_scalar("SELECT value FROM settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn put_raw(&self, key: &str, value: serde_json::Value) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at) VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory implementation for tests and embedded runs.
#[derive(Default)]
pub struct MemorySettingsRepo {
    values: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemorySettingsRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsRepo for MemorySettingsRepo {
    async fn get_raw(&self, key: &str) -> DbResult<Option<serde_json::Value>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn put_raw(&self, key: &str, value: serde_json::Value) -> DbResult<()> {
        self.values.write().await.insert(key.to_string(), value);
        Ok(())
    }
}
