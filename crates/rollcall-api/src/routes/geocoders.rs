//! Geocoding provider configuration.

use axum::extract::{Path, State};
use axum::routing::{get, put};
use axum::{Json, Router};
use rollcall_core::{ProviderConfig, ProviderSchema};
use rollcall_geocode::ProviderStatus;
use serde::Deserialize;
use serde_json::Value;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_providers))
        .route("/schemas", get(list_schemas))
        .route("/{provider_id}", put(save_provider))
}

async fn list_providers(State(state): State<AppState>) -> Result<Json<Vec<ProviderStatus>>, ApiError> {
    Ok(Json(state.registry.list().await?))
}

async fn list_schemas(State(state): State<AppState>) -> Json<Vec<ProviderSchema>> {
    Json(state.registry.schemas())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveProviderRequest {
    #[serde(default = "enabled_by_default")]
    is_enabled: bool,
    #[serde(default)]
    is_primary: bool,
    #[serde(default = "default_priority")]
    priority: i32,
    #[serde(default)]
    config: Value,
}

fn enabled_by_default() -> bool {
    true
}

fn default_priority() -> i32 {
    100
}

async fn save_provider(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
    Json(req): Json<SaveProviderRequest>,
) -> Result<Json<ProviderConfig>, ApiError> {
    let config = if req.config.is_null() {
        Value::Object(Default::default())
    } else {
        req.config
    };

    let mut provider = ProviderConfig::new(provider_id, config);
    provider.is_enabled = req.is_enabled;
    provider.is_primary = req.is_primary;
    provider.priority = req.priority;

    let saved = state.registry.save_config(provider).await?;
    tracing::info!(provider = %saved.provider_id, enabled = saved.is_enabled, "Provider configuration saved");
    Ok(Json(saved))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use crate::routes::testing::send;
    use crate::state::testing::memory_state;

    #[tokio::test]
    async fn test_schemas_list_builtin_providers() {
        let state = memory_state();
        let (status, body) = send(&state, Method::GET, "/api/v1/geocoders/schemas", None).await;
        assert_eq!(status, StatusCode::OK);

        let ids: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["providerId"].as_str().unwrap())
            .collect();
        assert!(ids.contains(&"census"));
        assert!(ids.contains(&"catalog"));
    }

    #[tokio::test]
    async fn test_save_then_list_provider() {
        let state = memory_state();
        let (status, saved) = send(
            &state,
            Method::PUT,
            "/api/v1/geocoders/census",
            Some(json!({ "isPrimary": true, "config": { "timeoutSecs": 10 } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(saved["config"]["timeoutSecs"], 10);
        assert_eq!(saved["config"]["benchmark"], "Public_AR_Current");

        let (_, listed) = send(&state, Method::GET, "/api/v1/geocoders", None).await;
        let listed = listed.as_array().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["providerId"], "census");
        assert_eq!(listed[0]["registered"], true);
    }

    #[tokio::test]
    async fn test_invalid_provider_config() {
        let state = memory_state();
        let (status, _) = send(
            &state,
            Method::PUT,
            "/api/v1/geocoders/census",
            Some(json!({ "config": { "timeoutSecs": 0 } })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&state, Method::PUT, "/api/v1/geocoders/nominatim", Some(json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
