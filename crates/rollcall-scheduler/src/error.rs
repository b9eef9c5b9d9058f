//! Scheduler error types.

use rollcall_db::DbError;
use rollcall_geocode::GeocodeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression {expression:?}: {message}")]
    InvalidCron { expression: String, message: String },

    #[error("job {job_id} carries a {found} payload")]
    PayloadMismatch { job_id: String, found: String },

    #[error("import source error: {0}")]
    Import(String),

    #[error(transparent)]
    Core(#[from] rollcall_core::Error),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Geocode(#[from] GeocodeError),
}

impl From<sqlx::Error> for SchedulerError {
    fn from(err: sqlx::Error) -> Self {
        SchedulerError::Db(DbError::Database(err))
    }
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
