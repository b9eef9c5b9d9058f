//! Core domain types and traits for the Rollcall job subsystem.
//!
//! This crate contains:
//! - Resource identifiers and common errors
//! - Job records, the job state machine, payloads and stats
//! - Scheduled job templates
//! - The geocoding provider contract and provider settings descriptors
//! - The household view geocode jobs operate on

pub mod error;
pub mod geocode;
pub mod household;
pub mod id;
pub mod job;
pub mod property;
pub mod schedule;

pub use error::{Error, Result};
pub use geocode::{
    GeocodeRequest, GeocodeResult, GeocodingProvider, MatchType, ProviderConfig, ProviderError,
    ProviderSchema,
};
pub use household::{Household, HouseholdFilter};
pub use id::ResourceId;
pub use job::{
    ErrorCode, ErrorLogEntry, JobAction, JobData, JobPayload, JobRecord, JobStatus, JobType,
    OutputStats, ProgressUpdate,
};
pub use property::{PropertyDescriptor, PropertyKind};
pub use schedule::{ScheduledJob, ScheduledTask};
