//! Repository traits and implementations.

pub mod household;
pub mod job;
pub mod provider;
pub mod scheduled;
pub mod settings;
pub mod voter;

pub use household::{HouseholdRepo, MemoryHouseholdRepo, PgHouseholdRepo};
pub use job::{JobFilter, JobRepo, MemoryJobRepo, PgJobRepo};
pub use provider::{MemoryProviderConfigRepo, PgProviderConfigRepo, ProviderConfigRepo};
pub use scheduled::{MemoryScheduledJobRepo, PgScheduledJobRepo, ScheduledJobRepo};
pub use settings::{MemorySettingsRepo, PgSettingsRepo, SettingsRepo};
pub use voter::{MemoryVoterRepo, PgVoterRepo, UpsertOutcome, VoterRepo};
