//! Registry error types.

use rollcall_core::ProviderError;
use rollcall_db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("unknown geocoding provider: {0}")]
    UnknownProvider(String),

    #[error("geocoding provider {0} is disabled")]
    Disabled(String),

    #[error("geocoding provider {0} is not available")]
    Unavailable(String),

    #[error("no geocoding provider is enabled")]
    NoProvider,

    #[error("invalid configuration for {provider}: {}", problems.join("; "))]
    InvalidConfig {
        provider: String,
        problems: Vec<String>,
    },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Db(#[from] DbError),
}

pub type RegistryResult<T> = std::result::Result<T, GeocodeError>;
