//! System configuration parsing.
//!
//! ```kdl
//! workers {
//!     max 4
//!     import 1
//!     geocode 2
//!     scheduled 1
//! }
//! geocode {
//!     batch-size 100
//!     batch-delay-ms 100
//!     flush-every 50
//! }
//! retention {
//!     days 30
//!     keep-min 100
//! }
//! recovery {
//!     on-startup #true
//! }
//! ```

use std::path::Path;

use kdl::{KdlDocument, KdlNode};
use rollcall_core::JobType;
use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult};

/// Worker pool limits. Persisted in settings and read once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerLimits {
    pub max_workers: usize,
    pub import_workers: usize,
    pub geocode_workers: usize,
    pub scheduled_workers: usize,
}

impl Default for WorkerLimits {
    fn default() -> Self {
        Self {
            max_workers: 4,
            import_workers: 1,
            geocode_workers: 2,
            scheduled_workers: 1,
        }
    }
}

impl WorkerLimits {
    /// Per-type cap for a job family.
    pub fn limit_for(&self, job_type: JobType) -> usize {
        match job_type {
            JobType::Import => self.import_workers,
            JobType::Geocode => self.geocode_workers,
            JobType::ScheduledDispatch => self.scheduled_workers,
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let fields = [
            ("maxWorkers", self.max_workers),
            ("importWorkers", self.import_workers),
            ("geocodeWorkers", self.geocode_workers),
            ("scheduledWorkers", self.scheduled_workers),
        ];
        for (field, value) in fields {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Batching knobs for geocode jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeocodeTuning {
    pub batch_size: usize,
    /// Pause between batches, a crude rate limit on the upstream service.
    pub batch_delay_ms: u64,
    /// Progress is flushed every this many processed items.
    pub flush_every: u64,
    /// Per-flush cap on appended item errors.
    pub errors_per_flush: usize,
}

impl Default for GeocodeTuning {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_delay_ms: 100,
            flush_every: 50,
            errors_per_flush: 10,
        }
    }
}

/// Retention for terminal jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    pub days: u32,
    /// Most recent terminal jobs always kept regardless of age.
    pub keep_min: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            days: 30,
            keep_min: 100,
        }
    }
}

/// Broker consumers started per queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerCounts {
    pub import: usize,
    pub geocode: usize,
    pub scheduled: usize,
}

impl Default for ConsumerCounts {
    fn default() -> Self {
        Self {
            import: 1,
            geocode: 2,
            scheduled: 1,
        }
    }
}

impl ConsumerCounts {
    pub fn for_type(&self, job_type: JobType) -> usize {
        match job_type {
            JobType::Import => self.import,
            JobType::Geocode => self.geocode,
            JobType::ScheduledDispatch => self.scheduled,
        }
    }
}

/// System-wide configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemConfig {
    pub workers: WorkerLimits,
    pub consumers: ConsumerCounts,
    pub geocode: GeocodeTuning,
    pub retention: RetentionPolicy,
    pub recover_on_startup: bool,
}

impl SystemConfig {
    pub fn new() -> Self {
        Self {
            recover_on_startup: true,
            ..Default::default()
        }
    }
}

/// Parse system configuration from KDL text. Missing sections keep defaults.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::new();

    for node in doc.nodes() {
        match node.name().value() {
            "workers" => {
                for child in children(node) {
                    let value = get_usize_arg(child)?;
                    match child.name().value() {
                        "max" => config.workers.max_workers = value,
                        "import" => config.workers.import_workers = value,
                        "geocode" => config.workers.geocode_workers = value,
                        "scheduled" => config.workers.scheduled_workers = value,
                        other => return Err(unknown("workers", other)),
                    }
                }
            }
            "consumers" => {
                for child in children(node) {
                    let value = get_usize_arg(child)?;
                    match child.name().value() {
                        "import" => config.consumers.import = value,
                        "geocode" => config.consumers.geocode = value,
                        "scheduled" => config.consumers.scheduled = value,
                        other => return Err(unknown("consumers", other)),
                    }
                }
            }
            "geocode" => {
                for child in children(node) {
                    match child.name().value() {
                        "batch-size" => config.geocode.batch_size = get_usize_arg(child)?,
                        "batch-delay-ms" => {
                            config.geocode.batch_delay_ms = get_usize_arg(child)? as u64
                        }
                        "flush-every" => config.geocode.flush_every = get_usize_arg(child)? as u64,
                        "errors-per-flush" => {
                            config.geocode.errors_per_flush = get_usize_arg(child)?
                        }
                        other => return Err(unknown("geocode", other)),
                    }
                }
            }
            "retention" => {
                for child in children(node) {
                    let value = get_usize_arg(child)? as u32;
                    match child.name().value() {
                        "days" => config.retention.days = value,
                        "keep-min" => config.retention.keep_min = value,
                        other => return Err(unknown("retention", other)),
                    }
                }
            }
            "recovery" => {
                for child in children(node) {
                    match child.name().value() {
                        "on-startup" => {
                            config.recover_on_startup = get_bool_arg(child).ok_or_else(|| {
                                ConfigError::InvalidValue {
                                    field: "recovery.on-startup".to_string(),
                                    message: "expected a boolean".to_string(),
                                }
                            })?
                        }
                        other => return Err(unknown("recovery", other)),
                    }
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    config.workers.validate()?;
    if config.geocode.batch_size == 0 {
        return Err(ConfigError::InvalidValue {
            field: "geocode.batch-size".to_string(),
            message: "must be at least 1".to_string(),
        });
    }
    if config.geocode.flush_every == 0 {
        return Err(ConfigError::InvalidValue {
            field: "geocode.flush-every".to_string(),
            message: "must be at least 1".to_string(),
        });
    }

    Ok(config)
}

/// Read and parse a configuration file. A missing file yields the defaults.
pub fn load_system_config(path: &Path) -> ConfigResult<SystemConfig> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_system_config(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SystemConfig::new()),
        Err(e) => Err(e.into()),
    }
}

// Helper functions for extracting values from KDL nodes

fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children().into_iter().flat_map(|doc| doc.nodes())
}

fn unknown(section: &str, name: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: format!("{}.{}", section, name),
        message: "unknown setting".to_string(),
    }
}

fn get_usize_arg(node: &KdlNode) -> ConfigResult<usize> {
    let field = node.name().value().to_string();
    let value = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .ok_or_else(|| ConfigError::MissingField(field.clone()))?
        .value()
        .as_integer()
        .ok_or_else(|| ConfigError::InvalidValue {
            field: field.clone(),
            message: "expected an integer".to_string(),
        })?;
    usize::try_from(value).map_err(|_| ConfigError::InvalidValue {
        field,
        message: format!("{} is out of range", value),
    })
}

fn get_bool_arg(node: &KdlNode) -> Option<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let kdl = r#"
            workers {
                max 6
                import 2
                geocode 3
                scheduled 1
            }
            consumers {
                geocode 4
            }
            geocode {
                batch-size 250
                batch-delay-ms 0
                flush-every 25
            }
            retention {
                days 7
                keep-min 10
            }
            recovery {
                on-startup #false
            }
        "#;

        let config = parse_system_config(kdl).unwrap();
        assert_eq!(config.workers.max_workers, 6);
        assert_eq!(config.workers.limit_for(JobType::Geocode), 3);
        assert_eq!(config.consumers.geocode, 4);
        assert_eq!(config.consumers.import, 1);
        assert_eq!(config.geocode.batch_size, 250);
        assert_eq!(config.geocode.batch_delay_ms, 0);
        assert_eq!(config.geocode.flush_every, 25);
        assert_eq!(config.retention.days, 7);
        assert!(!config.recover_on_startup);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_system_config("").unwrap();
        assert_eq!(config.workers, WorkerLimits::default());
        assert_eq!(config.geocode.batch_size, 100);
        assert_eq!(config.geocode.flush_every, 50);
        assert!(config.recover_on_startup);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let result = parse_system_config("workers {\n max 0\n}");
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_unknown_setting_rejected() {
        let result = parse_system_config("workers {\n export 2\n}");
        assert!(result.is_err());
    }

    #[test]
    fn test_non_integer_rejected() {
        let result = parse_system_config("geocode {\n batch-size \"lots\"\n}");
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = load_system_config(Path::new("/nonexistent/rollcall.kdl")).unwrap();
        assert_eq!(config, SystemConfig::new());
    }
}
