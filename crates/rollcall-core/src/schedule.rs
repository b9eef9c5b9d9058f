//! Recurring job templates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{GeocodeJobData, JobStatus};
use crate::{Error, ResourceId, Result};

/// Work a scheduled job performs each time it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ScheduledTask {
    /// Submit a geocode job with the given input.
    Geocode(GeocodeJobData),
    /// Delete terminal jobs older than the retention window.
    #[serde(rename_all = "camelCase")]
    RetentionCleanup {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retention_days: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        keep_min: Option<u32>,
    },
}

impl ScheduledTask {
    pub fn label(&self) -> &'static str {
        match self {
            ScheduledTask::Geocode(_) => "geocode",
            ScheduledTask::RetentionCleanup { .. } => "retention-cleanup",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            ScheduledTask::Geocode(data) if data.batch_size == Some(0) => Err(
                Error::InvalidInput("batchSize must be greater than zero".to_string()),
            ),
            ScheduledTask::RetentionCleanup {
                retention_days: Some(0),
                ..
            } => Err(Error::InvalidInput(
                "retentionDays must be greater than zero".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// A recurring template that spawns jobs on a cron schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJob {
    pub id: ResourceId,
    pub name: String,
    pub schedule: String,
    pub enabled: bool,
    pub task: ScheduledTask,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<JobStatus>,
    pub run_count: u64,
    pub created_at: DateTime<Utc>,
}

impl ScheduledJob {
    pub fn new(name: impl Into<String>, schedule: impl Into<String>, task: ScheduledTask) -> Self {
        Self {
            id: ResourceId::new(),
            name: name.into(),
            schedule: schedule.into(),
            enabled: true,
            task,
            last_run_at: None,
            next_run_at: None,
            last_status: None,
            run_count: 0,
            created_at: Utc::now(),
        }
    }
}
