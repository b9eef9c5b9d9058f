//! Household repository, the geocoding view of address records.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollcall_core::{GeocodeResult, Household, HouseholdFilter, ResourceId};
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{DbError, DbResult};

/// Database row for households.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HouseholdRow {
    pub id: Uuid,
    pub address_line: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub geocoded_at: Option<DateTime<Utc>>,
    pub geocode_source: Option<String>,
}

impl From<HouseholdRow> for Household {
    fn from(row: HouseholdRow) -> Self {
        Household {
            id: ResourceId::from_uuid(row.id),
            address_line: row.address_line,
            city: row.city,
            state: row.state,
            zip: row.zip,
            latitude: row.latitude,
            longitude: row.longitude,
            geocoded_at: row.geocoded_at,
            geocode_source: row.geocode_source,
        }
    }
}

#[async_trait]
pub trait HouseholdRepo: Send + Sync {
    /// Households a geocode job with these filters would visit.
    async fn count_eligible(&self, filter: &HouseholdFilter, skip_geocoded: bool)
    -> DbResult<u64>;

    /// Next page of eligible households in id order, strictly after `after`.
    async fn fetch_batch(
        &self,
        filter: &HouseholdFilter,
        skip_geocoded: bool,
        after: Option<ResourceId>,
        limit: usize,
    ) -> DbResult<Vec<Household>>;

    async fn save_coordinates(&self, id: ResourceId, result: &GeocodeResult) -> DbResult<()>;
}

/// PostgreSQL implementation.
pub struct PgHouseholdRepo {
    pool: PgPool,
}

impl PgHouseholdRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const ELIGIBLE: &str = r#"
    ($1::text IS NULL OR lower(city) = lower($1))
    AND ($2::text IS NULL OR lower(state) = lower($2))
    AND ($3::text IS NULL OR zip = $3)
    AND (cardinality($4::uuid[]) = 0 OR id = ANY($4))
    AND (NOT $5 OR latitude IS NULL OR longitude IS NULL)
"#;

fn filter_ids(filter: &HouseholdFilter) -> Vec<Uuid> {
    filter.household_ids.iter().map(|id| *id.as_uuid()).collect()
}

#[async_trait]
impl HouseholdRepo for PgHouseholdRepo {
    async fn count_eligible(
        &self,
        filter: &HouseholdFilter,
        skip_geocoded: bool,
    ) -> DbResult<u64> {
        let count: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM households WHERE {}", ELIGIBLE))
                .bind(filter.city.as_deref())
                .bind(filter.state.as_deref())
                .bind(filter.zip.as_deref())
                .bind(filter_ids(filter))
                .bind(skip_geocoded)
                .fetch_one(&self.pool)
                .await?;

        Ok(count.max(0) as u64)
    }

    async fn fetch_batch(
        &self,
        filter: &HouseholdFilter,
        skip_geocoded: bool,
        after: Option<ResourceId>,
        limit: usize,
    ) -> DbResult<Vec<Household>> {
        let sql = format!(
            "SELECT * FROM households WHERE {} AND ($6::uuid IS NULL OR id > $6) ORDER BY id LIMIT $7",
            ELIGIBLE
        );
        let rows = sqlx::query_as::<_, HouseholdRow>(&sql)
            .bind(filter.city.as_deref())
            .bind(filter.state.as_deref())
            .bind(filter.zip.as_deref())
            .bind(filter_ids(filter))
            .bind(skip_geocoded)
            .bind(after.map(|id| *id.as_uuid()))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn save_coordinates(&self, id: ResourceId, result: &GeocodeResult) -> DbResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE households
            SET latitude = $2, longitude = $3, geocoded_at = NOW(), geocode_source = $4
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(result.latitude)
        .bind(result.longitude)
        .bind(&result.source)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("household {}", id)));
        }
        Ok(())
    }
}

/// In-memory implementation for tests and embedded runs.
#[derive(Default)]
pub struct MemoryHouseholdRepo {
    households: RwLock<BTreeMap<ResourceId, Household>>,
}

impl MemoryHouseholdRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, household: Household) {
        self.households.write().await.insert(household.id, household);
    }

    pub async fn get(&self, id: ResourceId) -> Option<Household> {
        self.households.read().await.get(&id).cloned()
    }
}

fn eligible(household: &Household, filter: &HouseholdFilter, skip_geocoded: bool) -> bool {
    filter.matches(household) && !(skip_geocoded && household.is_geocoded())
}

#[async_trait]
impl HouseholdRepo for MemoryHouseholdRepo {
    async fn count_eligible(
        &self,
        filter: &HouseholdFilter,
        skip_geocoded: bool,
    ) -> DbResult<u64> {
        let households = self.households.read().await;
        Ok(households
            .values()
            .filter(|h| eligible(h, filter, skip_geocoded))
            .count() as u64)
    }

    async fn fetch_batch(
        &self,
        filter: &HouseholdFilter,
        skip_geocoded: bool,
        after: Option<ResourceId>,
        limit: usize,
    ) -> DbResult<Vec<Household>> {
        let households = self.households.read().await;
        Ok(households
            .values()
            .filter(|h| after.is_none_or(|a| h.id > a))
            .filter(|h| eligible(h, filter, skip_geocoded))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn save_coordinates(&self, id: ResourceId, result: &GeocodeResult) -> DbResult<()> {
        let mut households = self.households.write().await;
        let household = households
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("household {}", id)))?;
        household.latitude = Some(result.latitude);
        household.longitude = Some(result.longitude);
        household.geocoded_at = Some(Utc::now());
        household.geocode_source = Some(result.source.clone());
        Ok(())
    }
}
