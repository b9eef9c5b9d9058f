//! Geocoding capability contract.
//!
//! Providers turn an address into coordinates. The registry in
//! `rollcall-geocode` selects between them; processors only see this trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::property::PropertyDescriptor;

/// An address to look up. `id` ties batch results back to their input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeRequest {
    pub id: String,
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip: String,
}

impl GeocodeRequest {
    /// Single-line form, e.g. `1 Main St, Martinez, CA 94553`.
    pub fn one_line(&self) -> String {
        let state_zip = [self.state.trim(), self.zip.trim()]
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(" ");
        [self.street.trim(), self.city.trim(), state_zip.as_str()]
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    Approximate,
}

/// Result of a single lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeocodeResult {
    pub latitude: f64,
    pub longitude: f64,
    /// Always within `[0, 1]`.
    pub confidence: f64,
    pub match_type: MatchType,
    pub formatted_address: Option<String>,
    /// Id of the provider that produced the result.
    pub source: String,
}

impl GeocodeResult {
    pub fn new(
        latitude: f64,
        longitude: f64,
        confidence: f64,
        match_type: MatchType,
        source: impl Into<String>,
    ) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            latitude,
            longitude,
            confidence,
            match_type,
            formatted_address: None,
            source: source.into(),
        }
    }

    pub fn with_formatted_address(mut self, address: impl Into<String>) -> Self {
        self.formatted_address = Some(address.into());
        self
    }
}

/// Failures a provider can report. A clean "address not found" is `Ok(None)`.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid provider configuration: {0}")]
    Config(String),
}

/// Persisted configuration for one provider instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub provider_id: String,
    pub is_enabled: bool,
    pub is_primary: bool,
    /// Lower sorts first.
    pub priority: i32,
    pub config: serde_json::Value,
    pub requests_processed: u64,
    pub requests_failed: u64,
    pub updated_at: DateTime<Utc>,
}

impl ProviderConfig {
    pub fn new(provider_id: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            provider_id: provider_id.into(),
            is_enabled: true,
            is_primary: false,
            priority: 100,
            config,
            requests_processed: 0,
            requests_failed: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Trait every geocoding provider implements.
#[async_trait]
pub trait GeocodingProvider: Send + Sync {
    /// Stable id that configurations refer to.
    fn provider_id(&self) -> &str;

    /// Human-readable name.
    fn provider_name(&self) -> &str;

    /// Cheap liveness and configuration check; must not hit the network.
    fn is_available(&self) -> bool;

    /// Whether `batch_geocode` is a real bulk call.
    fn supports_batch(&self) -> bool {
        false
    }

    /// Look up one address. `Ok(None)` means no match.
    async fn geocode(
        &self,
        request: &GeocodeRequest,
    ) -> Result<Option<GeocodeResult>, ProviderError>;

    /// Look up many addresses; results are positional.
    async fn batch_geocode(
        &self,
        requests: &[GeocodeRequest],
    ) -> Result<Vec<Option<GeocodeResult>>, ProviderError> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.geocode(request).await?);
        }
        Ok(results)
    }
}

/// Describes a registered provider implementation and its settings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSchema {
    pub provider_id: String,
    pub provider_name: String,
    pub supports_batch: bool,
    pub properties: Vec<PropertyDescriptor>,
}
