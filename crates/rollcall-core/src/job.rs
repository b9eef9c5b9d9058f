//! Job records, the job state machine, and per-family payloads and stats.
//!
//! A job is the durable unit of asynchronous work. Its `data` carries a typed
//! payload keyed by job family, and its `output_stats` are family-specific
//! counters that are only ever shallow-merged, never overwritten wholesale.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::household::HouseholdFilter;
use crate::schedule::ScheduledTask;
use crate::{Error, ResourceId, Result};

/// Maximum number of entries kept in a job's error log.
pub const ERROR_LOG_CAP: usize = 100;

/// Job family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    Import,
    Geocode,
    ScheduledDispatch,
}

impl JobType {
    pub const ALL: [JobType; 3] = [JobType::Import, JobType::Geocode, JobType::ScheduledDispatch];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Import => "import",
            JobType::Geocode => "geocode",
            JobType::ScheduledDispatch => "scheduled-dispatch",
        }
    }

    /// Map a type tag, including historical aliases, to its family.
    pub fn canonicalize(tag: &str) -> Option<JobType> {
        match tag.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "import" | "voter-import" | "file-import" => Some(JobType::Import),
            "geocode" | "geocoding" | "household-geocode" => Some(JobType::Geocode),
            "scheduled" | "scheduled-dispatch" | "scheduled-job" => {
                Some(JobType::ScheduledDispatch)
            }
            _ => None,
        }
    }

    /// Name of the broker queue this family is dispatched on.
    pub fn queue_name(&self) -> &'static str {
        match self {
            JobType::Import => "import",
            JobType::Geocode => "geocode",
            JobType::ScheduledDispatch => "scheduled",
        }
    }

    /// Whether startup recovery reconciles jobs of this family.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, JobType::Import | JobType::Geocode)
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        JobType::canonicalize(s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown job type: {}", s)))
    }
}

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `processing -> pending` is the recovery reset and `pending -> failed`
    /// covers jobs whose payload cannot be dispatched.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Processing | Paused | Cancelled | Failed) => true,
            (Processing, Completed | Failed | Paused | Cancelled | Pending) => true,
            (Paused, Processing | Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(Error::InvalidInput(format!("unknown job status: {}", s))),
        }
    }
}

/// A user control action against a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobAction {
    Pause,
    Resume,
    Cancel,
}

impl JobAction {
    /// Status the action writes.
    pub fn target(&self) -> JobStatus {
        match self {
            JobAction::Pause => JobStatus::Paused,
            JobAction::Resume => JobStatus::Processing,
            JobAction::Cancel => JobStatus::Cancelled,
        }
    }

    /// Statuses the action may be applied from.
    pub fn allowed_from(&self) -> &'static [JobStatus] {
        match self {
            JobAction::Pause => &[JobStatus::Pending, JobStatus::Processing],
            JobAction::Resume => &[JobStatus::Paused],
            JobAction::Cancel => &[JobStatus::Pending, JobStatus::Processing, JobStatus::Paused],
        }
    }

    pub fn check(&self, current: JobStatus) -> Result<()> {
        if self.allowed_from().contains(&current) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: current,
                to: self.target(),
            })
        }
    }
}

/// Input for an import job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportJobData {
    /// Path of the uploaded file to import.
    pub file_path: String,
    /// Field delimiter; tab when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<char>,
    /// Column holding the stable external record key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_column: Option<String>,
}

/// Input for a geocode job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeocodeJobData {
    #[serde(default)]
    pub filters: HouseholdFilter,
    #[serde(default = "default_true")]
    pub skip_geocoded: bool,
    /// Provider requested by the caller; the registry's primary otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// Try a secondary provider when the chosen one errors out.
    #[serde(default)]
    pub allow_fallback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
}

impl Default for GeocodeJobData {
    fn default() -> Self {
        Self {
            filters: HouseholdFilter::default(),
            skip_geocoded: true,
            provider_id: None,
            allow_fallback: false,
            batch_size: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Input for a job spawned by a scheduled trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchJobData {
    pub scheduled_job_id: ResourceId,
    pub task: ScheduledTask,
}

/// Family-specific job input, tagged by job type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum JobPayload {
    Import(ImportJobData),
    Geocode(GeocodeJobData),
    ScheduledDispatch(DispatchJobData),
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::Import(_) => JobType::Import,
            JobPayload::Geocode(_) => JobType::Geocode,
            JobPayload::ScheduledDispatch(_) => JobType::ScheduledDispatch,
        }
    }

    /// Parse a payload submitted under a possibly aliased type tag.
    pub fn from_tagged(tag: &str, body: Value) -> Result<Self> {
        let job_type: JobType = tag.parse()?;
        let mut object = match body {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => {
                return Err(Error::InvalidInput(
                    "job payload must be an object".to_string(),
                ));
            }
        };
        object.insert("type".to_string(), Value::from(job_type.as_str()));
        let payload: JobPayload = serde_json::from_value(Value::Object(object))
            .map_err(|e| Error::InvalidInput(format!("invalid {} payload: {}", job_type, e)))?;
        payload.validate()?;
        Ok(payload)
    }

    /// Check the payload carries enough to dispatch the job.
    pub fn validate(&self) -> Result<()> {
        match self {
            JobPayload::Import(data) => {
                if data.file_path.trim().is_empty() {
                    return Err(Error::InvalidInput("import requires filePath".to_string()));
                }
            }
            JobPayload::Geocode(data) => {
                if data.batch_size == Some(0) {
                    return Err(Error::InvalidInput(
                        "batchSize must be greater than zero".to_string(),
                    ));
                }
            }
            JobPayload::ScheduledDispatch(data) => data.task.validate()?,
        }
        Ok(())
    }
}

/// How a job was recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    UnexpectedShutdown,
}

/// Recovery metadata accumulated on a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryInfo {
    pub mode: RecoveryMode,
    pub recovered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_index: Option<u64>,
}

/// Contents of the `data` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobData {
    pub payload: JobPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryInfo>,
    /// Key of the last item covered by `processed_items`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

impl JobData {
    pub fn new(payload: JobPayload) -> Self {
        Self {
            payload,
            recovery: None,
            cursor: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records_created: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records_updated: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records_skipped: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_processed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_count: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeocodeStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub households_processed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub households_geocoded: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub households_failed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub households_skipped: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_count: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawned_job_id: Option<ResourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records_deleted: Option<u64>,
}

/// Output statistics of a job, typed by family.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutputStats {
    Import(ImportStats),
    Geocode(GeocodeStats),
    Dispatch(DispatchStats),
}

impl OutputStats {
    pub fn empty(job_type: JobType) -> Self {
        match job_type {
            JobType::Import => OutputStats::Import(ImportStats::default()),
            JobType::Geocode => OutputStats::Geocode(GeocodeStats::default()),
            JobType::ScheduledDispatch => OutputStats::Dispatch(DispatchStats::default()),
        }
    }

    /// Parse a stored stats object for the given family.
    pub fn from_value(job_type: JobType, value: Value) -> serde_json::Result<Self> {
        let value = if value.is_null() {
            Value::Object(Map::new())
        } else {
            value
        };
        Ok(match job_type {
            JobType::Import => OutputStats::Import(serde_json::from_value(value)?),
            JobType::Geocode => OutputStats::Geocode(serde_json::from_value(value)?),
            JobType::ScheduledDispatch => OutputStats::Dispatch(serde_json::from_value(value)?),
        })
    }

    pub fn job_type(&self) -> JobType {
        match self {
            OutputStats::Import(_) => JobType::Import,
            OutputStats::Geocode(_) => JobType::Geocode,
            OutputStats::Dispatch(_) => JobType::ScheduledDispatch,
        }
    }

    /// The set fields as a JSON object, ready for a shallow merge.
    pub fn to_patch(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Shallow-merge `patch` into these stats. Fields set in the patch win.
    pub fn merge(&mut self, patch: &OutputStats) -> Result<()> {
        if self.job_type() != patch.job_type() {
            return Err(Error::InvalidInput(format!(
                "cannot merge {} stats into {} stats",
                patch.job_type(),
                self.job_type()
            )));
        }
        let mut merged = self.to_patch();
        merge_shallow(&mut merged, patch.to_patch());
        *self = OutputStats::from_value(self.job_type(), Value::Object(merged))
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(())
    }
}

/// Shallow JSON object merge: top-level keys of `patch` replace those in `target`.
pub fn merge_shallow(target: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, value) in patch {
        target.insert(key, value);
    }
}

/// Code attached to an error log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Fatal,
    ItemFailed,
    JobPaused,
    JobCancelled,
    Recovery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}

impl ErrorLogEntry {
    pub fn new(message: impl Into<String>, code: Option<ErrorCode>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
            code,
        }
    }
}

/// Append entries, keeping only the most recent [`ERROR_LOG_CAP`].
pub fn append_capped(log: &mut Vec<ErrorLogEntry>, entries: impl IntoIterator<Item = ErrorLogEntry>) {
    log.extend(entries);
    if log.len() > ERROR_LOG_CAP {
        let excess = log.len() - ERROR_LOG_CAP;
        log.drain(..excess);
    }
}

/// A job record as stored and as returned by the read surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: ResourceId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub total_items: u64,
    pub processed_items: u64,
    pub output_stats: OutputStats,
    pub error_log: Vec<ErrorLogEntry>,
    pub data: JobData,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Build a fresh pending record for a payload.
    pub fn new(payload: JobPayload, created_by: Option<String>) -> Self {
        let job_type = payload.job_type();
        Self {
            id: ResourceId::new(),
            job_type,
            status: JobStatus::Pending,
            total_items: 0,
            processed_items: 0,
            output_stats: OutputStats::empty(job_type),
            error_log: Vec::new(),
            data: JobData::new(payload),
            created_by,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Item index processing resumes from.
    pub fn resume_index(&self) -> u64 {
        self.data
            .recovery
            .as_ref()
            .and_then(|r| r.checkpoint_index)
            .unwrap_or(0)
            .max(self.processed_items)
    }
}

/// Progress written by a processor flush.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub processed_items: u64,
    pub total_items: Option<u64>,
    pub stats: Option<OutputStats>,
    pub cursor: Option<String>,
    pub errors: Vec<ErrorLogEntry>,
}

/// Clamp processed against total when a total is known.
pub fn clamp_processed(processed: u64, total: u64) -> u64 {
    if total > 0 { processed.min(total) } else { processed }
}
