//! Application state.

use std::sync::Arc;

use rollcall_config::SystemConfig;
use rollcall_db::{
    PgHouseholdRepo, PgJobRepo, PgProviderConfigRepo, PgScheduledJobRepo, PgSettingsRepo,
    PgVoterRepo, SettingsRepo,
};
use rollcall_geocode::ProviderRegistry;
use rollcall_scheduler::processors::CsvFileSource;
use rollcall_scheduler::{JobRuntime, JobService, PgQueueBroker, RuntimeDeps};
use sqlx::PgPool;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<JobRuntime>,
    pub settings: Arc<dyn SettingsRepo>,
    pub registry: Arc<ProviderRegistry>,
    /// Checked by the readiness probe when present.
    pub pool: Option<PgPool>,
}

impl AppState {
    pub fn new(
        runtime: Arc<JobRuntime>,
        settings: Arc<dyn SettingsRepo>,
        registry: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            runtime,
            settings,
            registry,
            pool: None,
        }
    }

    /// Wire every repository to PostgreSQL. Queue entries live behind
    /// `broker_pool`, which may be the same database.
    pub fn postgres(pool: PgPool, broker_pool: PgPool, config: SystemConfig) -> Self {
        let registry = Arc::new(ProviderRegistry::with_builtin(
            Arc::new(PgProviderConfigRepo::new(pool.clone())),
            Some(pool.clone()),
        ));
        let deps = RuntimeDeps {
            jobs: Arc::new(PgJobRepo::new(pool.clone())),
            households: Arc::new(PgHouseholdRepo::new(pool.clone())),
            voters: Arc::new(PgVoterRepo::new(pool.clone())),
            scheduled: Arc::new(PgScheduledJobRepo::new(pool.clone())),
            broker: Arc::new(PgQueueBroker::new(broker_pool)),
            registry: registry.clone(),
            import_source: Arc::new(CsvFileSource),
        };
        let runtime = Arc::new(JobRuntime::new(config, deps));
        let settings = Arc::new(PgSettingsRepo::new(pool.clone()));

        Self {
            runtime,
            settings,
            registry,
            pool: Some(pool),
        }
    }

    pub fn jobs(&self) -> &JobService {
        self.runtime.service()
    }
}
