//! Persisted worker settings. Changes apply on the next restart.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use rollcall_config::WorkerLimits;
use tracing::info;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/workers", get(get_worker_limits).put(put_worker_limits))
}

async fn get_worker_limits(State(state): State<AppState>) -> Result<Json<WorkerLimits>, ApiError> {
    let saved = state.settings.worker_limits().await?;
    Ok(Json(saved.unwrap_or(state.runtime.pool().limits())))
}

async fn put_worker_limits(
    State(state): State<AppState>,
    Json(limits): Json<WorkerLimits>,
) -> Result<Json<WorkerLimits>, ApiError> {
    limits.validate()?;
    state.settings.save_worker_limits(&limits).await?;
    info!(
        max_workers = limits.max_workers,
        import_workers = limits.import_workers,
        geocode_workers = limits.geocode_workers,
        scheduled_workers = limits.scheduled_workers,
        "Worker limits saved, restart to apply"
    );
    Ok(Json(limits))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use crate::routes::testing::send;
    use crate::state::testing::memory_state;

    #[tokio::test]
    async fn test_worker_limits_round_trip() {
        let state = memory_state();
        let (status, body) = send(&state, Method::GET, "/api/v1/settings/workers", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["maxWorkers"], 4);

        let limits = json!({
            "maxWorkers": 6,
            "importWorkers": 2,
            "geocodeWorkers": 3,
            "scheduledWorkers": 1
        });
        let (status, _) = send(&state, Method::PUT, "/api/v1/settings/workers", Some(limits.clone())).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(&state, Method::GET, "/api/v1/settings/workers", None).await;
        assert_eq!(body, limits);

        // Saved limits wait for a restart.
        assert_eq!(state.runtime.pool().limits().max_workers, 4);
    }

    #[tokio::test]
    async fn test_zero_limit_is_rejected() {
        let state = memory_state();
        let (status, body) = send(
            &state,
            Method::PUT,
            "/api/v1/settings/workers",
            Some(json!({
                "maxWorkers": 0,
                "importWorkers": 1,
                "geocodeWorkers": 1,
                "scheduledWorkers": 1
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("maxWorkers"));
    }
}
