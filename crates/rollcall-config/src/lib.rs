//! KDL configuration parsing for the Rollcall job subsystem.
//!
//! This crate handles parsing of the system configuration file
//! (`rollcall.kdl`): worker limits, geocode batching, retention and
//! recovery settings.

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    ConsumerCounts, GeocodeTuning, RetentionPolicy, SystemConfig, WorkerLimits, load_system_config,
    parse_system_config,
};
