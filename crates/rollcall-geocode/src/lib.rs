//! Geocoding providers for Rollcall.
//!
//! The [`ProviderRegistry`] owns the catalog of provider implementations and
//! turns persisted [`rollcall_core::ProviderConfig`] rows into live providers:
//! - Census (batch-capable remote API)
//! - Catalog (local PostGIS table or remote feature-query service)

pub mod catalog;
pub mod census;
pub mod error;
pub mod registry;

pub use catalog::CatalogFactory;
pub use census::CensusFactory;
pub use error::{GeocodeError, RegistryResult};
pub use registry::{FallbackChain, ProviderFactory, ProviderRegistry, ProviderStatus};
