//! Job submission, inspection and control endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use rollcall_core::{JobAction, JobPayload, JobRecord, JobStatus, JobType, ResourceId};
use rollcall_db::JobFilter;
use rollcall_scheduler::RecoverySummary;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_jobs).post(submit_job))
        .route("/recover", post(recover_jobs))
        .route("/cleanup", post(cleanup_jobs))
        .route("/{id}", get(get_job))
        .route("/{id}/action", post(control_job))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitJobRequest {
    #[serde(rename = "type")]
    job_type: String,
    #[serde(default)]
    payload: Value,
    created_by: Option<String>,
}

/// Turn `{type, payload}` into a typed payload, accepting legacy type tags.
fn parse_payload(job_type: &str, payload: Value) -> Result<JobPayload, ApiError> {
    let job_type = JobType::canonicalize(job_type)
        .ok_or_else(|| ApiError::BadRequest(format!("Unknown job type: {}", job_type)))?;

    let mut fields = match payload {
        Value::Object(fields) => fields,
        Value::Null => Map::new(),
        _ => return Err(ApiError::BadRequest("payload must be an object".to_string())),
    };
    fields.insert("type".to_string(), Value::from(job_type.as_str()));

    serde_json::from_value(Value::Object(fields))
        .map_err(|e| ApiError::BadRequest(format!("Invalid {} payload: {}", job_type, e)))
}

async fn submit_job(
    State(state): State<AppState>,
    Json(req): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<JobRecord>), ApiError> {
    let payload = parse_payload(&req.job_type, req.payload)?;
    let job = state.jobs().submit(payload, req.created_by).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

#[derive(Debug, Deserialize)]
struct ListJobsQuery {
    /// Comma separated.
    status: Option<String>,
    #[serde(rename = "type")]
    job_type: Option<String>,
    limit: Option<i64>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<JobRecord>>, ApiError> {
    let mut filter = JobFilter {
        limit: query.limit,
        ..Default::default()
    };
    if let Some(statuses) = &query.status {
        for status in statuses.split(',').filter(|s| !s.trim().is_empty()) {
            filter.statuses.push(status.trim().parse::<JobStatus>()?);
        }
    }
    if let Some(job_type) = &query.job_type {
        filter.job_types.push(job_type.parse::<JobType>()?);
    }

    Ok(Json(state.jobs().list(&filter).await?))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobRecord>, ApiError> {
    Ok(Json(state.jobs().get(ResourceId::from_uuid(id)).await?))
}

#[derive(Debug, Deserialize)]
struct ActionRequest {
    action: JobAction,
}

async fn control_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ActionRequest>,
) -> Result<Json<JobRecord>, ApiError> {
    let job = state
        .jobs()
        .control(ResourceId::from_uuid(id), req.action)
        .await?;
    Ok(Json(job))
}

async fn recover_jobs(State(state): State<AppState>) -> Result<Json<RecoverySummary>, ApiError> {
    Ok(Json(state.runtime.recovery().recover().await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CleanupRequest {
    retention_days: Option<u32>,
    keep_min: Option<u32>,
}

#[derive(Debug, Serialize)]
struct CleanupResponse {
    deleted: u64,
}

async fn cleanup_jobs(
    State(state): State<AppState>,
    body: Option<Json<CleanupRequest>>,
) -> Result<Json<CleanupResponse>, ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let retention = state.runtime.config().retention;
    let days = req.retention_days.unwrap_or(retention.days);
    if days == 0 {
        return Err(ApiError::BadRequest(
            "retentionDays must be greater than zero".to_string(),
        ));
    }

    let deleted = state
        .jobs()
        .cleanup(days, req.keep_min.unwrap_or(retention.keep_min))
        .await?;
    Ok(Json(CleanupResponse { deleted }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;
    use serde_json::json;

    use crate::routes::testing::send;
    use crate::state::testing::memory_state;

    #[test]
    fn test_parse_payload_accepts_aliases() {
        let payload = parse_payload("household-geocode", json!({ "batchSize": 25 })).unwrap();
        let JobPayload::Geocode(data) = payload else {
            panic!("expected a geocode payload");
        };
        assert_eq!(data.batch_size, Some(25));

        assert!(matches!(
            parse_payload("voter-import", json!({ "filePath": "/tmp/v.tsv" })).unwrap(),
            JobPayload::Import(_)
        ));
        assert!(parse_payload("shred", Value::Null).is_err());
        assert!(parse_payload("import", json!({})).is_err());
    }

    #[tokio::test]
    async fn test_submit_and_fetch_job() {
        let state = memory_state();
        let (status, created) = send(
            &state,
            Method::POST,
            "/api/v1/jobs",
            Some(json!({ "type": "geocode", "payload": {}, "createdBy": "alice" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "pending");
        assert_eq!(created["type"], "geocode");

        let id = created["id"].as_str().unwrap();
        let (status, fetched) = send(&state, Method::GET, &format!("/api/v1/jobs/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["createdBy"], "alice");

        let (status, listed) = send(&state, Method::GET, "/api/v1/jobs?status=pending&type=geocode", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_job_is_404() {
        let state = memory_state();
        let uri = format!("/api/v1/jobs/{}", ResourceId::new());
        let (status, _) = send(&state, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_action_is_409() {
        let state = memory_state();
        let (_, created) = send(
            &state,
            Method::POST,
            "/api/v1/jobs",
            Some(json!({ "type": "geocode" })),
        )
        .await;
        let uri = format!("/api/v1/jobs/{}/action", created["id"].as_str().unwrap());

        let (status, body) = send(&state, Method::POST, &uri, Some(json!({ "action": "resume" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("pending"));

        let (status, paused) = send(&state, Method::POST, &uri, Some(json!({ "action": "pause" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(paused["status"], "paused");

        let (status, _) = send(&state, Method::POST, &uri, Some(json!({ "action": "cancel" }))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&state, Method::POST, &uri, Some(json!({ "action": "resume" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_recover_and_cleanup() {
        let state = memory_state();
        send(&state, Method::POST, "/api/v1/jobs", Some(json!({ "type": "geocode" }))).await;

        let (status, summary) = send(&state, Method::POST, "/api/v1/jobs/recover", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["scanned"], 1);
        assert_eq!(summary["pendingRequeued"], 1);

        let (status, body) = send(&state, Method::POST, "/api/v1/jobs/cleanup", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], 0);

        let (status, _) = send(
            &state,
            Method::POST,
            "/api/v1/jobs/cleanup",
            Some(json!({ "retentionDays": 0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
