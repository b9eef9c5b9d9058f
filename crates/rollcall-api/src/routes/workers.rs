//! Worker pool and queue status.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use rollcall_scheduler::WorkersStatus;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/status", get(workers_status))
}

async fn workers_status(State(state): State<AppState>) -> Result<Json<WorkersStatus>, ApiError> {
    Ok(Json(state.runtime.status().await?))
}
