//! Household geocoding.

use std::sync::Arc;

use async_trait::async_trait;
use rollcall_core::job::GeocodeStats;
use rollcall_core::{
    GeocodeResult, GeocodingProvider, Household, JobPayload, JobRecord, JobType, OutputStats,
    ResourceId,
};
use rollcall_db::{HouseholdRepo, JobRepo};
use rollcall_geocode::ProviderRegistry;
use tracing::{debug, info};

use super::{
    BatchSettings, Checkpoint, JobOutcome, JobProcessor, acknowledge_stop, bump, finish,
    payload_mismatch, run_claimed, stop_requested,
};
use crate::SchedulerResult;

pub struct GeocodeProcessor {
    jobs: Arc<dyn JobRepo>,
    households: Arc<dyn HouseholdRepo>,
    registry: Arc<ProviderRegistry>,
    settings: BatchSettings,
}

/// Per-item result: a match, a clean miss, or a provider error message.
type Lookup = Result<Option<GeocodeResult>, String>;

impl GeocodeProcessor {
    pub fn new(
        jobs: Arc<dyn JobRepo>,
        households: Arc<dyn HouseholdRepo>,
        registry: Arc<ProviderRegistry>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            jobs,
            households,
            registry,
            settings,
        }
    }

    async fn execute(&self, job: JobRecord) -> SchedulerResult<JobOutcome> {
        let JobPayload::Geocode(data) = &job.data.payload else {
            return Err(payload_mismatch(&job));
        };
        job.data.payload.validate()?;

        let provider = self
            .registry
            .resolve(data.provider_id.as_deref(), data.allow_fallback)
            .await?;
        let provider_id = provider.provider_id().to_string();
        let batch_size = data.batch_size.unwrap_or(self.settings.batch_size).max(1);

        // A resumed job keeps its original total; geocoded households drop
        // out of the eligible set as the job runs.
        let total = if job.total_items > 0 {
            job.total_items
        } else {
            self.households
                .count_eligible(&data.filters, data.skip_geocoded)
                .await?
        };

        let mut stats = match &job.output_stats {
            OutputStats::Geocode(stats) => stats.clone(),
            _ => GeocodeStats::default(),
        };
        stats.provider = Some(provider_id.clone());

        let mut progress = Checkpoint::resume(&job, total);
        let mut cursor: Option<ResourceId> =
            job.data.cursor.as_deref().and_then(|c| c.parse().ok());
        progress
            .flush(self.jobs.as_ref(), OutputStats::Geocode(stats.clone()), &self.settings)
            .await?;

        info!(
            job_id = %job.id,
            provider = %provider_id,
            fallbacks = ?provider.fallback_ids(),
            total,
            resume_from = progress.processed,
            "Starting geocode job"
        );

        let mut run = RunCounts::default();
        loop {
            if let Some(status) = stop_requested(self.jobs.as_ref(), job.id).await? {
                progress
                    .flush(self.jobs.as_ref(), OutputStats::Geocode(stats.clone()), &self.settings)
                    .await?;
                self.registry
                    .record_usage(&provider_id, run.processed, run.failed)
                    .await;
                return acknowledge_stop(self.jobs.as_ref(), job.id, status, progress.processed)
                    .await;
            }

            let batch = self
                .households
                .fetch_batch(&data.filters, data.skip_geocoded, cursor, batch_size)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            cursor = Some(last.id);
            let last_page = batch.len() < batch_size;

            let lookups = lookup(&provider, &batch).await;
            for (household, lookup) in batch.iter().zip(lookups) {
                self.record(household, lookup, &mut stats, &mut progress, &mut run)
                    .await;
                if progress.due(&self.settings) {
                    progress
                        .flush(self.jobs.as_ref(), OutputStats::Geocode(stats.clone()), &self.settings)
                        .await?;
                }
            }
            debug!(
                job_id = %job.id,
                processed = progress.processed,
                total,
                "Geocode batch done"
            );

            if last_page {
                break;
            }
            if !self.settings.batch_delay.is_zero() {
                tokio::time::sleep(self.settings.batch_delay).await;
            }
        }

        if let Some(previous) = progress.settle_total() {
            info!(
                job_id = %job.id,
                previous,
                total = progress.processed,
                "Eligible set changed during the run, total adjusted"
            );
        }
        progress
            .flush(self.jobs.as_ref(), OutputStats::Geocode(stats.clone()), &self.settings)
            .await?;
        self.registry
            .record_usage(&provider_id, run.processed, run.failed)
            .await;
        finish(
            self.jobs.as_ref(),
            job.id,
            &OutputStats::Geocode(stats),
            progress.processed,
        )
        .await
    }

    async fn record(
        &self,
        household: &Household,
        lookup: Option<Lookup>,
        stats: &mut GeocodeStats,
        progress: &mut Checkpoint,
        run: &mut RunCounts,
    ) {
        bump(&mut stats.households_processed);
        run.processed += 1;

        match lookup {
            None => bump(&mut stats.households_skipped),
            Some(Ok(Some(result))) => {
                match self.households.save_coordinates(household.id, &result).await {
                    Ok(()) => bump(&mut stats.households_geocoded),
                    Err(e) => {
                        run.failed += 1;
                        bump(&mut stats.households_failed);
                        bump(&mut stats.error_count);
                        progress.item_error(format!(
                            "Household {}: could not save coordinates: {}",
                            household.id, e
                        ));
                    }
                }
            }
            Some(Ok(None)) => {
                bump(&mut stats.households_failed);
                debug!(household_id = %household.id, "No geocode match");
            }
            Some(Err(message)) => {
                run.failed += 1;
                bump(&mut stats.households_failed);
                bump(&mut stats.error_count);
                progress.item_error(format!("Household {}: {}", household.id, message));
            }
        }
        progress.advance(household.id.to_string());
    }
}

#[derive(Default)]
struct RunCounts {
    processed: u64,
    failed: u64,
}

/// Geocode a page of households, one entry per household. Households with no
/// address are not sent and come back as `None`.
async fn lookup(provider: &dyn GeocodingProvider, batch: &[Household]) -> Vec<Option<Lookup>> {
    let addressable: Vec<usize> = (0..batch.len())
        .filter(|&i| batch[i].has_address())
        .collect();
    let requests: Vec<_> = addressable.iter().map(|&i| batch[i].to_request()).collect();

    let results: Vec<Lookup> = if provider.supports_batch() {
        match provider.batch_geocode(&requests).await {
            Ok(results) => results.into_iter().map(Ok).collect(),
            Err(e) => requests.iter().map(|_| Err(e.to_string())).collect(),
        }
    } else {
        let mut results = Vec::with_capacity(requests.len());
        for request in &requests {
            results.push(provider.geocode(request).await.map_err(|e| e.to_string()));
        }
        results
    };

    let mut lookups: Vec<Option<Lookup>> = vec![None; batch.len()];
    for (index, result) in addressable.into_iter().zip(results) {
        lookups[index] = Some(result);
    }
    lookups
}

#[async_trait]
impl JobProcessor for GeocodeProcessor {
    fn job_type(&self) -> JobType {
        JobType::Geocode
    }

    async fn process(&self, job_id: ResourceId) -> SchedulerResult<JobOutcome> {
        run_claimed(self.jobs.as_ref(), job_id, |job| self.execute(job)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::testing::{interrupted, pending, settings};
    use rollcall_core::job::GeocodeJobData;
    use rollcall_core::{
        ErrorCode, GeocodeRequest, JobStatus, MatchType, PropertyDescriptor, ProviderConfig,
        ProviderError,
    };
    use rollcall_core::HouseholdFilter;
    use rollcall_db::{
        DbResult, MemoryHouseholdRepo, MemoryJobRepo, MemoryProviderConfigRepo,
        ProviderConfigRepo,
    };
    use std::sync::Mutex;
    use rollcall_geocode::ProviderFactory;
    use serde_json::{Map, Value, json};
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Matches every address; can pause a job after a set number of calls.
    struct StubProvider {
        calls: Arc<AtomicU64>,
        pause: Option<(Arc<MemoryJobRepo>, ResourceId, u64)>,
    }

    #[async_trait]
    impl GeocodingProvider for StubProvider {
        fn provider_id(&self) -> &str {
            "stub"
        }

        fn provider_name(&self) -> &str {
            "Stub"
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn geocode(
            &self,
            request: &GeocodeRequest,
        ) -> Result<Option<GeocodeResult>, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((jobs, id, after)) = &self.pause {
                if n == *after {
                    jobs.transition(*id, &[JobStatus::Processing], JobStatus::Paused)
                        .await
                        .unwrap();
                }
            }
            if request.street.contains("Nowhere") {
                return Ok(None);
            }
            if request.street.contains("Broken") {
                return Err(ProviderError::Transport("connection reset".to_string()));
            }
            Ok(Some(GeocodeResult::new(38.0, -122.0, 0.9, MatchType::Exact, "stub")))
        }
    }

    struct StubFactory {
        calls: Arc<AtomicU64>,
        pause: Option<(Arc<MemoryJobRepo>, ResourceId, u64)>,
    }

    impl ProviderFactory for StubFactory {
        fn provider_id(&self) -> &'static str {
            "stub"
        }

        fn provider_name(&self) -> &'static str {
            "Stub"
        }

        fn config_schema(&self) -> Vec<PropertyDescriptor> {
            Vec::new()
        }

        fn build(
            &self,
            _config: &Map<String, Value>,
        ) -> Result<Arc<dyn GeocodingProvider>, ProviderError> {
            Ok(Arc::new(StubProvider {
                calls: Arc::clone(&self.calls),
                pause: self.pause.clone(),
            }))
        }
    }

    /// Records the size of every page handed to the processor.
    struct PagedHouseholds {
        inner: Arc<MemoryHouseholdRepo>,
        pages: Arc<Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl HouseholdRepo for PagedHouseholds {
        async fn count_eligible(
            &self,
            filter: &HouseholdFilter,
            skip_geocoded: bool,
        ) -> DbResult<u64> {
            self.inner.count_eligible(filter, skip_geocoded).await
        }

        async fn fetch_batch(
            &self,
            filter: &HouseholdFilter,
            skip_geocoded: bool,
            after: Option<ResourceId>,
            limit: usize,
        ) -> DbResult<Vec<Household>> {
            let page = self
                .inner
                .fetch_batch(filter, skip_geocoded, after, limit)
                .await?;
            self.pages.lock().unwrap().push(page.len());
            Ok(page)
        }

        async fn save_coordinates(&self, id: ResourceId, result: &GeocodeResult) -> DbResult<()> {
            self.inner.save_coordinates(id, result).await
        }
    }

    struct Fixture {
        jobs: Arc<MemoryJobRepo>,
        households: Arc<MemoryHouseholdRepo>,
        configs: Arc<MemoryProviderConfigRepo>,
        calls: Arc<AtomicU64>,
        pages: Arc<Mutex<Vec<usize>>>,
    }

    impl Fixture {
        async fn new(count: usize) -> Self {
            let households = Arc::new(MemoryHouseholdRepo::new());
            for i in 0..count {
                households.insert(household(&format!("{} Pine St", i + 1))).await;
            }
            Self {
                jobs: Arc::new(MemoryJobRepo::new()),
                households,
                configs: Arc::new(MemoryProviderConfigRepo::new()),
                calls: Arc::new(AtomicU64::new(0)),
                pages: Arc::new(Mutex::new(Vec::new())),
            }
        }

        async fn enable_stub(&self) {
            self.configs
                .upsert(&ProviderConfig::new("stub", json!({})))
                .await
                .unwrap();
        }

        fn processor(&self, pause: Option<(ResourceId, u64)>) -> GeocodeProcessor {
            let mut registry = ProviderRegistry::new(self.configs.clone());
            registry.register(StubFactory {
                calls: Arc::clone(&self.calls),
                pause: pause.map(|(id, after)| (Arc::clone(&self.jobs), id, after)),
            });
            GeocodeProcessor::new(
                self.jobs.clone(),
                Arc::new(PagedHouseholds {
                    inner: self.households.clone(),
                    pages: Arc::clone(&self.pages),
                }),
                Arc::new(registry),
                settings(),
            )
        }

        async fn submit(&self) -> JobRecord {
            pending(&self.jobs, JobPayload::Geocode(GeocodeJobData::default())).await
        }

        fn pages(&self) -> Vec<usize> {
            self.pages.lock().unwrap().clone()
        }
    }

    fn household(street: &str) -> Household {
        Household {
            id: ResourceId::new(),
            address_line: street.to_string(),
            city: "Martinez".to_string(),
            state: "CA".to_string(),
            zip: "94553".to_string(),
            latitude: None,
            longitude: None,
            geocoded_at: None,
            geocode_source: None,
        }
    }

    fn geocode_stats(job: &JobRecord) -> GeocodeStats {
        match &job.output_stats {
            OutputStats::Geocode(stats) => stats.clone(),
            other => panic!("unexpected stats {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_processes_in_batches_to_completion() {
        let fixture = Fixture::new(150).await;
        fixture.enable_stub().await;
        // Already geocoded, so not part of the job.
        let mut done = household("1 Done Ct");
        done.latitude = Some(38.0);
        done.longitude = Some(-122.0);
        fixture.households.insert(done).await;

        let job = pending(
            &fixture.jobs,
            JobPayload::Geocode(GeocodeJobData {
                skip_geocoded: true,
                ..Default::default()
            }),
        )
        .await;

        let outcome = fixture.processor(None).process(job.id).await.unwrap();
        assert_eq!(outcome, JobOutcome::Completed);

        let job = fixture.jobs.get(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.total_items, 150);
        assert_eq!(job.processed_items, 150);
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_some());

        let stats = geocode_stats(&job);
        assert_eq!(stats.households_processed, Some(150));
        assert_eq!(stats.households_geocoded, Some(150));
        assert_eq!(stats.provider.as_deref(), Some("stub"));
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 150);
        assert!(job.error_log.is_empty());
        assert_eq!(fixture.pages(), vec![100, 50]);
    }

    #[tokio::test]
    async fn test_pause_after_first_batch_then_resume() {
        let fixture = Fixture::new(150).await;
        fixture.enable_stub().await;
        let job = fixture.submit().await;

        let outcome = fixture
            .processor(Some((job.id, 100)))
            .process(job.id)
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Paused);

        let paused = fixture.jobs.get(job.id).await.unwrap();
        assert_eq!(paused.status, JobStatus::Paused);
        assert_eq!(paused.processed_items, 100);
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 100);
        let last = paused.error_log.last().unwrap();
        assert_eq!(last.code, Some(ErrorCode::JobPaused));

        // A paused job is not picked up until resumed.
        let processor = fixture.processor(None);
        assert_eq!(processor.process(job.id).await.unwrap(), JobOutcome::Skipped);

        fixture
            .jobs
            .transition(job.id, &[JobStatus::Paused], JobStatus::Processing)
            .await
            .unwrap();
        assert_eq!(processor.process(job.id).await.unwrap(), JobOutcome::Completed);

        let done = fixture.jobs.get(job.id).await.unwrap();
        assert_eq!(done.processed_items, 150);
        assert_eq!(geocode_stats(&done).households_geocoded, Some(150));
        // Nothing was geocoded twice.
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 150);
    }

    #[tokio::test]
    async fn test_resume_from_checkpoint_after_crash() {
        let fixture = Fixture::new(150).await;
        fixture.enable_stub().await;

        let mut all = fixture
            .households
            .fetch_batch(&Default::default(), true, None, 1000)
            .await
            .unwrap();
        all.sort_by_key(|h| h.id);
        let cursor = all[59].id;

        let job = interrupted(
            &fixture.jobs,
            JobPayload::Geocode(GeocodeJobData::default()),
            60,
            150,
            Some(cursor.to_string()),
        )
        .await;

        let outcome = fixture.processor(None).process(job.id).await.unwrap();
        assert_eq!(outcome, JobOutcome::Completed);

        let done = fixture.jobs.get(job.id).await.unwrap();
        assert_eq!(done.processed_items, 150);
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 90);
        for household in &all[..60] {
            assert!(fixture.households.get(household.id).await.unwrap().latitude.is_none());
        }
        for household in &all[60..] {
            assert!(fixture.households.get(household.id).await.unwrap().is_geocoded());
        }
    }

    #[tokio::test]
    async fn test_total_settles_when_eligible_set_shrinks() {
        let fixture = Fixture::new(150).await;
        fixture.enable_stub().await;

        let mut all = fixture
            .households
            .fetch_batch(&Default::default(), true, None, 1000)
            .await
            .unwrap();
        all.sort_by_key(|h| h.id);

        // Ten households were geocoded after the last flush before a crash.
        let result = GeocodeResult::new(38.0, -122.0, 0.9, MatchType::Exact, "stub");
        for household in &all[60..70] {
            fixture
                .households
                .save_coordinates(household.id, &result)
                .await
                .unwrap();
        }
        let job = interrupted(
            &fixture.jobs,
            JobPayload::Geocode(GeocodeJobData::default()),
            60,
            150,
            Some(all[59].id.to_string()),
        )
        .await;

        let outcome = fixture.processor(None).process(job.id).await.unwrap();
        assert_eq!(outcome, JobOutcome::Completed);

        let done = fixture.jobs.get(job.id).await.unwrap();
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 80);
        assert_eq!(done.processed_items, 140);
        assert_eq!(done.total_items, 140);
    }

    #[tokio::test]
    async fn test_no_provider_fails_with_single_fatal_entry() {
        let fixture = Fixture::new(5).await;
        let job = fixture.submit().await;

        let outcome = fixture.processor(None).process(job.id).await.unwrap();
        assert_eq!(outcome, JobOutcome::Failed);

        let failed = fixture.jobs.get(job.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_log.len(), 1);
        assert_eq!(failed.error_log[0].code, Some(ErrorCode::Fatal));
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_item_failures_are_counted_not_fatal() {
        let fixture = Fixture::new(0).await;
        fixture.enable_stub().await;
        fixture.households.insert(household("1 Pine St")).await;
        fixture.households.insert(household("9 Nowhere Rd")).await;
        fixture.households.insert(household("3 Broken Way")).await;
        fixture.households.insert(household("")).await;
        let job = fixture.submit().await;

        let outcome = fixture.processor(None).process(job.id).await.unwrap();
        assert_eq!(outcome, JobOutcome::Completed);

        let done = fixture.jobs.get(job.id).await.unwrap();
        let stats = geocode_stats(&done);
        assert_eq!(done.processed_items, 4);
        assert_eq!(stats.households_geocoded, Some(1));
        assert_eq!(stats.households_failed, Some(2));
        assert_eq!(stats.households_skipped, Some(1));
        assert_eq!(stats.error_count, Some(1));
        assert_eq!(done.error_log.len(), 1);
        assert_eq!(done.error_log[0].code, Some(ErrorCode::ItemFailed));

        let usage = fixture.configs.get("stub").await.unwrap();
        assert_eq!(usage.requests_processed, 4);
        assert_eq!(usage.requests_failed, 1);
    }

    #[tokio::test]
    async fn test_cancelled_job_is_not_run() {
        let fixture = Fixture::new(150).await;
        fixture.enable_stub().await;
        let job = fixture.submit().await;

        let processor = fixture.processor(None);
        fixture.jobs.begin(job.id).await.unwrap();
        fixture
            .jobs
            .transition(job.id, &[JobStatus::Processing], JobStatus::Cancelled)
            .await
            .unwrap();

        assert_eq!(processor.process(job.id).await.unwrap(), JobOutcome::Skipped);
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
        let cancelled = fixture.jobs.get(job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
    }
}
