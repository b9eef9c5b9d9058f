//! Scheduled job templates.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use rollcall_core::{ResourceId, ScheduledJob, ScheduledTask};
use rollcall_scheduler::validate_cron_expression;
use serde::Deserialize;
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_scheduled).post(create_scheduled))
        .route("/{id}", delete(delete_scheduled))
        .route("/{id}/toggle", post(toggle_scheduled))
}

async fn list_scheduled(State(state): State<AppState>) -> Result<Json<Vec<ScheduledJob>>, ApiError> {
    Ok(Json(state.runtime.scheduled().list().await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateScheduledRequest {
    name: String,
    schedule: String,
    task: ScheduledTask,
    #[serde(default = "enabled_by_default")]
    enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

async fn create_scheduled(
    State(state): State<AppState>,
    Json(req): Json<CreateScheduledRequest>,
) -> Result<(StatusCode, Json<ScheduledJob>), ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name is required".to_string()));
    }
    validate_cron_expression(&req.schedule)?;
    req.task.validate()?;

    let mut job = ScheduledJob::new(req.name.trim(), req.schedule.trim(), req.task);
    job.enabled = req.enabled;
    let job = state.runtime.scheduled().create(&job).await?;
    let next = state.runtime.cron().register(&job).await?;

    Ok((
        StatusCode::CREATED,
        Json(ScheduledJob {
            next_run_at: next,
            ..job
        }),
    ))
}

async fn delete_scheduled(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let id = ResourceId::from_uuid(id);
    state.runtime.scheduled().delete(id).await?;
    state.runtime.cron().unregister(id).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn toggle_scheduled(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ScheduledJob>, ApiError> {
    let id = ResourceId::from_uuid(id);
    let scheduled = state.runtime.scheduled();
    let current = scheduled.get(id).await?;
    let job = scheduled.set_enabled(id, !current.enabled).await?;

    let next = state.runtime.cron().register(&job).await?;
    if !job.enabled {
        scheduled.set_next_run(id, None).await?;
    }
    Ok(Json(ScheduledJob {
        next_run_at: next,
        ..job
    }))
}
