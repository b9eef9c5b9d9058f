//! Record import from delimited files.
//!
//! The file format itself is the source's business; the processor only sees
//! keyed rows, upserts them through a sink and keeps the counters.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rollcall_core::job::{ImportJobData, ImportStats};
use rollcall_core::{JobPayload, JobRecord, JobType, OutputStats, ResourceId};
use rollcall_db::{JobRepo, UpsertOutcome, VoterRepo};
use serde_json::{Map, Value};
use tracing::info;

use super::{
    BatchSettings, Checkpoint, JobOutcome, JobProcessor, acknowledge_stop, bump, finish,
    payload_mismatch, run_claimed, stop_requested,
};
use crate::{SchedulerError, SchedulerResult};

/// Key column used when a job does not name one.
pub const DEFAULT_KEY_COLUMN: &str = "external_id";

/// One input row.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportRow {
    /// 1-based line number in the source, header excluded.
    pub line: u64,
    pub fields: Map<String, Value>,
    /// Raw size of the row in the source.
    pub bytes: u64,
    /// Set when the row could not be decoded.
    pub error: Option<String>,
}

#[async_trait]
pub trait ImportSource: Send + Sync {
    /// Every row of the input, in source order.
    async fn read(&self, data: &ImportJobData) -> SchedulerResult<Vec<ImportRow>>;
}

#[async_trait]
pub trait ImportSink: Send + Sync {
    async fn upsert(&self, key: &str, fields: &Map<String, Value>) -> SchedulerResult<UpsertOutcome>;
}

/// Reads a delimited text file with a header row. Tab separated unless the
/// job names another delimiter.
pub struct CsvFileSource;

impl CsvFileSource {
    fn read_file(path: &Path, delimiter: u8) -> SchedulerResult<Vec<ImportRow>> {
        let import_error = |e: csv::Error| SchedulerError::Import(format!("{}: {}", path.display(), e));

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_path(path)
            .map_err(import_error)?;
        let headers = reader.headers().map_err(import_error)?.clone();

        let mut rows = Vec::new();
        let mut record = csv::StringRecord::new();
        let mut offset = reader.position().byte();
        let mut line = 0;
        loop {
            line += 1;
            let read = reader.read_record(&mut record);
            let end = reader.position().byte();
            let bytes = end.saturating_sub(offset);
            offset = end;

            match read {
                Ok(false) => break,
                Ok(true) => {
                    let fields = headers
                        .iter()
                        .zip(record.iter())
                        .map(|(name, value)| (name.trim().to_string(), Value::from(value.trim())))
                        .collect();
                    rows.push(ImportRow {
                        line,
                        fields,
                        bytes,
                        error: None,
                    });
                }
                Err(e) if e.is_io_error() => return Err(import_error(e)),
                Err(e) => rows.push(ImportRow {
                    line,
                    fields: Map::new(),
                    bytes,
                    error: Some(e.to_string()),
                }),
            }
        }
        Ok(rows)
    }
}

#[async_trait]
impl ImportSource for CsvFileSource {
    async fn read(&self, data: &ImportJobData) -> SchedulerResult<Vec<ImportRow>> {
        let delimiter = data.delimiter.unwrap_or('\t');
        if !delimiter.is_ascii() {
            return Err(SchedulerError::Import(format!(
                "delimiter {:?} is not a single byte",
                delimiter
            )));
        }
        let path = data.file_path.clone();
        tokio::task::spawn_blocking(move || Self::read_file(Path::new(&path), delimiter as u8))
            .await
            .map_err(|e| SchedulerError::Import(e.to_string()))?
    }
}

/// Upserts rows as voter records.
pub struct VoterSink {
    voters: Arc<dyn VoterRepo>,
}

impl VoterSink {
    pub fn new(voters: Arc<dyn VoterRepo>) -> Self {
        Self { voters }
    }
}

#[async_trait]
impl ImportSink for VoterSink {
    async fn upsert(&self, key: &str, fields: &Map<String, Value>) -> SchedulerResult<UpsertOutcome> {
        Ok(self.voters.upsert(key, fields).await?)
    }
}

pub struct ImportProcessor {
    jobs: Arc<dyn JobRepo>,
    source: Arc<dyn ImportSource>,
    sink: Arc<dyn ImportSink>,
    settings: BatchSettings,
}

impl ImportProcessor {
    pub fn new(
        jobs: Arc<dyn JobRepo>,
        source: Arc<dyn ImportSource>,
        sink: Arc<dyn ImportSink>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            jobs,
            source,
            sink,
            settings,
        }
    }

    async fn execute(&self, job: JobRecord) -> SchedulerResult<JobOutcome> {
        let JobPayload::Import(data) = &job.data.payload else {
            return Err(payload_mismatch(&job));
        };
        job.data.payload.validate()?;

        let rows = self.source.read(data).await?;
        let total = rows.len() as u64;
        let key_column = data.key_column.as_deref().unwrap_or(DEFAULT_KEY_COLUMN);

        let mut stats = match &job.output_stats {
            OutputStats::Import(stats) => stats.clone(),
            _ => ImportStats::default(),
        };
        let mut progress = Checkpoint::resume(&job, total);
        let start = progress.processed as usize;
        progress
            .flush(self.jobs.as_ref(), OutputStats::Import(stats.clone()), &self.settings)
            .await?;

        info!(
            job_id = %job.id,
            file = %data.file_path,
            total,
            resume_from = start,
            "Starting import job"
        );

        for chunk in rows[start.min(rows.len())..].chunks(self.settings.batch_size.max(1)) {
            if let Some(status) = stop_requested(self.jobs.as_ref(), job.id).await? {
                progress
                    .flush(self.jobs.as_ref(), OutputStats::Import(stats.clone()), &self.settings)
                    .await?;
                return acknowledge_stop(self.jobs.as_ref(), job.id, status, progress.processed)
                    .await;
            }

            for row in chunk {
                self.import_row(row, key_column, &mut stats, &mut progress).await;
                if progress.due(&self.settings) {
                    progress
                        .flush(self.jobs.as_ref(), OutputStats::Import(stats.clone()), &self.settings)
                        .await?;
                }
            }

            if !self.settings.batch_delay.is_zero() {
                tokio::time::sleep(self.settings.batch_delay).await;
            }
        }

        progress
            .flush(self.jobs.as_ref(), OutputStats::Import(stats.clone()), &self.settings)
            .await?;
        finish(
            self.jobs.as_ref(),
            job.id,
            &OutputStats::Import(stats),
            progress.processed,
        )
        .await
    }

    async fn import_row(
        &self,
        row: &ImportRow,
        key_column: &str,
        stats: &mut ImportStats,
        progress: &mut Checkpoint,
    ) {
        stats.bytes_processed = Some(stats.bytes_processed.unwrap_or(0) + row.bytes);
        let key = row
            .fields
            .get(key_column)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|k| !k.is_empty());

        match (&row.error, key) {
            (Some(error), _) => {
                bump(&mut stats.records_skipped);
                bump(&mut stats.error_count);
                progress.item_error(format!("Line {}: {}", row.line, error));
            }
            (None, None) => {
                bump(&mut stats.records_skipped);
                bump(&mut stats.error_count);
                progress.item_error(format!("Line {}: missing {}", row.line, key_column));
            }
            (None, Some(key)) => match self.sink.upsert(key, &row.fields).await {
                Ok(UpsertOutcome::Created) => bump(&mut stats.records_created),
                Ok(UpsertOutcome::Updated) => bump(&mut stats.records_updated),
                Ok(UpsertOutcome::Unchanged) => bump(&mut stats.records_skipped),
                Err(e) => {
                    bump(&mut stats.records_skipped);
                    bump(&mut stats.error_count);
                    progress.item_error(format!("Line {}: {}", row.line, e));
                }
            },
        }
        progress.advance(row.line.to_string());
    }
}

#[async_trait]
impl JobProcessor for ImportProcessor {
    fn job_type(&self) -> JobType {
        JobType::Import
    }

    async fn process(&self, job_id: ResourceId) -> SchedulerResult<JobOutcome> {
        run_claimed(self.jobs.as_ref(), job_id, |job| self.execute(job)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::testing::{interrupted, pending, settings};
    use rollcall_core::{ErrorCode, JobStatus};
    use rollcall_db::{MemoryJobRepo, MemoryVoterRepo};
    use std::io::Write;

    /// Fixed rows keyed `v1`, `v2`, ...
    struct StaticSource(Vec<ImportRow>);

    impl StaticSource {
        fn keyed(count: u64) -> Self {
            Self(
                (1..=count)
                    .map(|n| {
                        let mut fields = Map::new();
                        fields.insert("external_id".to_string(), Value::from(format!("v{}", n)));
                        fields.insert("name".to_string(), Value::from(format!("Voter {}", n)));
                        ImportRow {
                            line: n,
                            fields,
                            bytes: 10,
                            error: None,
                        }
                    })
                    .collect(),
            )
        }
    }

    #[async_trait]
    impl ImportSource for StaticSource {
        async fn read(&self, _data: &ImportJobData) -> SchedulerResult<Vec<ImportRow>> {
            Ok(self.0.clone())
        }
    }

    fn payload(path: &str) -> JobPayload {
        JobPayload::Import(ImportJobData {
            file_path: path.to_string(),
            delimiter: None,
            key_column: None,
        })
    }

    fn processor(
        jobs: &Arc<MemoryJobRepo>,
        voters: &Arc<MemoryVoterRepo>,
        source: impl ImportSource + 'static,
    ) -> ImportProcessor {
        ImportProcessor::new(
            jobs.clone(),
            Arc::new(source),
            Arc::new(VoterSink::new(voters.clone())),
            settings(),
        )
    }

    fn import_stats(job: &JobRecord) -> ImportStats {
        match &job.output_stats {
            OutputStats::Import(stats) => stats.clone(),
            other => panic!("unexpected stats {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_import_counts_created_updated_skipped() {
        let jobs = Arc::new(MemoryJobRepo::new());
        let voters = Arc::new(MemoryVoterRepo::new());
        let mut existing = Map::new();
        existing.insert("external_id".to_string(), Value::from("v1"));
        existing.insert("name".to_string(), Value::from("Voter 1"));
        voters.upsert("v1", &existing).await.unwrap();
        voters.upsert("v2", &Map::new()).await.unwrap();

        let mut source = StaticSource::keyed(3);
        source.0.push(ImportRow {
            line: 4,
            fields: Map::new(),
            bytes: 3,
            error: None,
        });
        let job = pending(&jobs, payload("voters.tsv")).await;

        let outcome = processor(&jobs, &voters, source).process(job.id).await.unwrap();
        assert_eq!(outcome, JobOutcome::Completed);

        let done = jobs.get(job.id).await.unwrap();
        let stats = import_stats(&done);
        assert_eq!(done.total_items, 4);
        assert_eq!(done.processed_items, 4);
        assert_eq!(stats.records_created, Some(1));
        assert_eq!(stats.records_updated, Some(1));
        assert_eq!(stats.records_skipped, Some(2));
        assert_eq!(stats.bytes_processed, Some(33));
        assert_eq!(done.error_log.len(), 1);
        assert_eq!(done.error_log[0].code, Some(ErrorCode::ItemFailed));
        assert!(done.error_log[0].message.contains("missing external_id"));
    }

    #[tokio::test]
    async fn test_resume_skips_checkpointed_rows() {
        let jobs = Arc::new(MemoryJobRepo::new());
        let voters = Arc::new(MemoryVoterRepo::new());
        let job = interrupted(&jobs, payload("voters.tsv"), 60, 150, Some("60".to_string())).await;

        let outcome = processor(&jobs, &voters, StaticSource::keyed(150))
            .process(job.id)
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Completed);

        let done = jobs.get(job.id).await.unwrap();
        assert_eq!(done.processed_items, 150);
        assert_eq!(voters.count().await.unwrap(), 90);
        assert!(voters.get("v60").await.is_none());
        assert!(voters.get("v61").await.is_some());
    }

    #[tokio::test]
    async fn test_paused_job_is_not_started() {
        let jobs = Arc::new(MemoryJobRepo::new());
        let voters = Arc::new(MemoryVoterRepo::new());
        let job = pending(&jobs, payload("voters.tsv")).await;
        jobs.transition(job.id, &[JobStatus::Pending], JobStatus::Paused)
            .await
            .unwrap();

        let outcome = processor(&jobs, &voters, StaticSource::keyed(10))
            .process(job.id)
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Skipped);
        assert_eq!(voters.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_file_fails_job() {
        let jobs = Arc::new(MemoryJobRepo::new());
        let voters = Arc::new(MemoryVoterRepo::new());
        let job = pending(&jobs, payload("/nonexistent/rollcall/voters.tsv")).await;

        let outcome = processor(&jobs, &voters, CsvFileSource)
            .process(job.id)
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Failed);

        let failed = jobs.get(job.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_log[0].code, Some(ErrorCode::Fatal));
    }

    #[tokio::test]
    async fn test_csv_source_reads_tab_separated_rows() {
        let path = std::env::temp_dir().join(format!("rollcall-import-{}.tsv", ResourceId::new()));
        {
            let mut file = std::fs::File::create(&path).unwrap();
            write!(file, "external_id\tname\nv1\tAda\nv2\t Grace \n").unwrap();
        }

        let data = ImportJobData {
            file_path: path.display().to_string(),
            delimiter: None,
            key_column: None,
        };
        let rows = CsvFileSource.read(&data).await.unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].line, 1);
        assert_eq!(rows[0].fields["external_id"], Value::from("v1"));
        assert_eq!(rows[1].fields["name"], Value::from("Grace"));
        assert!(rows.iter().all(|r| r.bytes > 0));
    }
}
