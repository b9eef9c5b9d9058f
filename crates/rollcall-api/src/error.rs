//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rollcall_geocode::GeocodeError;
use rollcall_scheduler::SchedulerError;
use serde_json::json;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<rollcall_core::Error> for ApiError {
    fn from(err: rollcall_core::Error) -> Self {
        match err {
            rollcall_core::Error::NotFound(msg) => ApiError::NotFound(msg),
            rollcall_core::Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            rollcall_core::Error::Conflict(msg) => ApiError::Conflict(msg),
            rollcall_core::Error::InvalidTransition { .. } => ApiError::Conflict(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<rollcall_db::DbError> for ApiError {
    fn from(err: rollcall_db::DbError) -> Self {
        match err {
            rollcall_db::DbError::NotFound(msg) => ApiError::NotFound(msg),
            rollcall_db::DbError::Duplicate(msg) => ApiError::Conflict(msg),
            rollcall_db::DbError::InvalidTransition { .. } => ApiError::Conflict(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<GeocodeError> for ApiError {
    fn from(err: GeocodeError) -> Self {
        match err {
            GeocodeError::UnknownProvider(_) => ApiError::NotFound(err.to_string()),
            GeocodeError::InvalidConfig { .. } | GeocodeError::Provider(_) => {
                ApiError::BadRequest(err.to_string())
            }
            GeocodeError::Disabled(_) | GeocodeError::Unavailable(_) | GeocodeError::NoProvider => {
                ApiError::Unavailable(err.to_string())
            }
            GeocodeError::Db(e) => e.into(),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Core(e) => e.into(),
            SchedulerError::Db(e) => e.into(),
            SchedulerError::Geocode(e) => e.into(),
            SchedulerError::InvalidCron { .. } | SchedulerError::PayloadMismatch { .. } => {
                ApiError::BadRequest(err.to_string())
            }
            SchedulerError::Import(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<rollcall_config::ConfigError> for ApiError {
    fn from(err: rollcall_config::ConfigError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::JobStatus;

    #[test]
    fn test_invalid_transition_is_conflict() {
        let err: ApiError = SchedulerError::Core(rollcall_core::Error::InvalidTransition {
            from: JobStatus::Completed,
            to: JobStatus::Paused,
        })
        .into();
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_missing_record_is_not_found() {
        let err: ApiError =
            SchedulerError::Db(rollcall_db::DbError::NotFound("job x".to_string())).into();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }
}
