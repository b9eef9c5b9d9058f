//! Geocoding provider configuration repository.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollcall_core::ProviderConfig;
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::{DbError, DbResult};

/// Database row for provider configurations.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProviderConfigRow {
    pub provider_id: String,
    pub is_enabled: bool,
    pub is_primary: bool,
    pub priority: i32,
    pub config: serde_json::Value,
    pub requests_processed: i64,
    pub requests_failed: i64,
    pub updated_at: DateTime<Utc>,
}

impl From<ProviderConfigRow> for ProviderConfig {
    fn from(row: ProviderConfigRow) -> Self {
        ProviderConfig {
            provider_id: row.provider_id,
            is_enabled: row.is_enabled,
            is_primary: row.is_primary,
            priority: row.priority,
            config: row.config,
            requests_processed: row.requests_processed.max(0) as u64,
            requests_failed: row.requests_failed.max(0) as u64,
            updated_at: row.updated_at,
        }
    }
}

#[async_trait]
pub trait ProviderConfigRepo: Send + Sync {
    /// Primary first, then by ascending priority.
    async fn list(&self) -> DbResult<Vec<ProviderConfig>>;
    async fn get(&self, provider_id: &str) -> DbResult<ProviderConfig>;

    /// Insert or replace a configuration. Marking one primary clears the
    /// flag on every other provider.
    async fn upsert(&self, config: &ProviderConfig) -> DbResult<ProviderConfig>;

    /// Add to the usage counters.
    async fn record_usage(&self, provider_id: &str, processed: u64, failed: u64) -> DbResult<()>;
}

/// PostgreSQL implementation.
pub struct PgProviderConfigRepo {
    pool: PgPool,
}

impl PgProviderConfigRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProviderConfigRepo for PgProviderConfigRepo {
    async fn list(&self) -> DbResult<Vec<ProviderConfig>> {
        let rows = sqlx::query_as::<_, ProviderConfigRow>(
            "SELECT * FROM geocoder_providers ORDER BY is_primary DESC, priority, provider_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get(&self, provider_id: &str) -> DbResult<ProviderConfig> {
        let row = sqlx::query_as::<_, ProviderConfigRow>(
            "SELECT * FROM geocoder_providers WHERE provider_id = $1",
        )
        .bind(provider_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("provider {}", provider_id)))?;

        Ok(row.into())
    }

    async fn upsert(&self, config: &ProviderConfig) -> DbResult<ProviderConfig> {
        let mut tx = self.pool.begin().await?;

        if config.is_primary {
            sqlx::query(
                "UPDATE geocoder_providers SET is_primary = FALSE WHERE provider_id <> $1",
            )
            .bind(&config.provider_id)
            .execute(&mut *tx)
            .await?;
        }

        let row = sqlx::query_as::<_, ProviderConfigRow>(
            r#"
            INSERT INTO geocoder_providers (
                provider_id, is_enabled, is_primary, priority, config, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (provider_id) DO UPDATE SET
                is_enabled = EXCLUDED.is_enabled,
                is_primary = EXCLUDED.is_primary,
                priority = EXCLUDED.priority,
                config = EXCLUDED.config,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(&config.provider_id)
        .bind(config.is_enabled)
        .bind(config.is_primary)
        .bind(config.priority)
        .bind(&config.config)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row.into())
    }

    async fn record_usage(&self, provider_id: &str, processed: u64, failed: u64) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE geocoder_providers
            SET requests_processed = requests_processed + $2,
                requests_failed = requests_failed + $3
            WHERE provider_id = $1
            "#,
        )
        .bind(provider_id)
        .bind(processed as i64)
        .bind(failed as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// In-memory implementation for tests and embedded runs.
#[derive(Default)]
pub struct MemoryProviderConfigRepo {
    configs: RwLock<HashMap<String, ProviderConfig>>,
}

impl MemoryProviderConfigRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProviderConfigRepo for MemoryProviderConfigRepo {
    async fn list(&self) -> DbResult<Vec<ProviderConfig>> {
        let configs = self.configs.read().await;
        let mut list: Vec<ProviderConfig> = configs.values().cloned().collect();
        list.sort_by(|a, b| {
            b.is_primary
                .cmp(&a.is_primary)
                .then(a.priority.cmp(&b.priority))
                .then(a.provider_id.cmp(&b.provider_id))
        });
        Ok(list)
    }

    async fn get(&self, provider_id: &str) -> DbResult<ProviderConfig> {
        self.configs
            .read()
            .await
            .get(provider_id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("provider {}", provider_id)))
    }

    async fn upsert(&self, config: &ProviderConfig) -> DbResult<ProviderConfig> {
        let mut configs = self.configs.write().await;
        if config.is_primary {
            for other in configs.values_mut() {
                other.is_primary = false;
            }
        }

        let mut stored = config.clone();
        if let Some(existing) = configs.get(&config.provider_id) {
            stored.requests_processed = existing.requests_processed;
            stored.requests_failed = existing.requests_failed;
        }
        stored.updated_at = Utc::now();
        configs.insert(stored.provider_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn record_usage(&self, provider_id: &str, processed: u64, failed: u64) -> DbResult<()> {
        if let Some(config) = self.configs.write().await.get_mut(provider_id) {
            config.requests_processed += processed;
            config.requests_failed += failed;
        }
        Ok(())
    }
}
