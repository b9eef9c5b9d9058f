//! Address catalog provider.
//!
//! Matches requests against a catalog of known addresses, either a local
//! PostGIS table or a remote feature-query service, using configured field
//! mappings.

pub mod geometry;
pub mod predicate;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rollcall_core::{
    GeocodeRequest, GeocodeResult, GeocodingProvider, MatchType, PropertyDescriptor,
    ProviderError,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use sqlx::PgPool;
use tracing::debug;
use url::Url;

use crate::ProviderFactory;
use geometry::Geometry;
use predicate::{FieldMapping, Strictness, local_query, quote_identifier, remote_where};

pub const PROVIDER_ID: &str = "catalog";

const EXACT_CONFIDENCE: f64 = 0.9;
const APPROXIMATE_CONFIDENCE: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogMode {
    Local,
    Remote,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogConfig {
    pub mode: CatalogMode,
    #[serde(default)]
    pub table: Option<String>,
    pub geometry_column: String,
    #[serde(default)]
    pub service_url: Option<String>,
    #[serde(flatten)]
    pub fields: FieldMapping,
    pub match_mode: Strictness,
    pub timeout_secs: f64,
}

pub struct CatalogFactory {
    pool: Option<PgPool>,
}

impl CatalogFactory {
    pub fn new(pool: Option<PgPool>) -> Self {
        Self { pool }
    }
}

impl ProviderFactory for CatalogFactory {
    fn provider_id(&self) -> &'static str {
        PROVIDER_ID
    }

    fn provider_name(&self) -> &'static str {
        "Address Catalog"
    }

    fn config_schema(&self) -> Vec<PropertyDescriptor> {
        vec![
            PropertyDescriptor::select("mode", "Source", &["local", "remote"])
                .with_default("remote"),
            PropertyDescriptor::string("table", "Local table"),
            PropertyDescriptor::string("geometryColumn", "Geometry column").with_default("geom"),
            PropertyDescriptor::string("serviceUrl", "Feature service URL"),
            PropertyDescriptor::string("addressField", "Address field").required(),
            PropertyDescriptor::string("cityField", "City field"),
            PropertyDescriptor::string("stateField", "State field"),
            PropertyDescriptor::string("zipField", "ZIP field"),
            PropertyDescriptor::select("matchMode", "Match strictness", &["exact", "fuzzy"])
                .with_default("exact"),
            PropertyDescriptor::number("timeoutSecs", "Request timeout (seconds)")
                .with_default(15)
                .with_range(1.0, 300.0),
        ]
    }

    fn build(
        &self,
        config: &Map<String, Value>,
    ) -> Result<Arc<dyn GeocodingProvider>, ProviderError> {
        let config: CatalogConfig = serde_json::from_value(Value::Object(config.clone()))
            .map_err(|e| ProviderError::Config(e.to_string()))?;
        Ok(Arc::new(CatalogProvider::new(config, self.pool.clone())?))
    }
}

enum Source {
    Local { pool: PgPool, table: String },
    Remote { client: reqwest::Client, query_url: Url },
}

pub struct CatalogProvider {
    config: CatalogConfig,
    source: Source,
}

impl CatalogProvider {
    /// Validates identifiers and the source up front so a bad configuration
    /// never reaches a query.
    pub fn new(config: CatalogConfig, pool: Option<PgPool>) -> Result<Self, ProviderError> {
        config.fields.validate()?;
        quote_identifier(&config.geometry_column)?;

        let source = match config.mode {
            CatalogMode::Local => {
                let table = config
                    .table
                    .clone()
                    .filter(|t| !t.trim().is_empty())
                    .ok_or_else(|| ProviderError::Config("local mode requires table".to_string()))?;
                quote_identifier(&table)?;
                let pool = pool.ok_or_else(|| {
                    ProviderError::Config("local mode requires a database connection".to_string())
                })?;
                Source::Local { pool, table }
            }
            CatalogMode::Remote => {
                let raw = config
                    .service_url
                    .as_deref()
                    .filter(|u| !u.trim().is_empty())
                    .ok_or_else(|| {
                        ProviderError::Config("remote mode requires serviceUrl".to_string())
                    })?;
                let query_url = Url::parse(&format!("{}/query", raw.trim_end_matches('/')))
                    .map_err(|e| ProviderError::Config(format!("invalid serviceUrl: {}", e)))?;
                let client = reqwest::Client::builder()
                    .timeout(Duration::from_secs_f64(config.timeout_secs.max(1.0)))
                    .build()
                    .map_err(|e| ProviderError::Config(e.to_string()))?;
                Source::Remote { client, query_url }
            }
        };

        Ok(Self { config, source })
    }

    fn classify(&self, is_point: bool) -> (MatchType, f64) {
        if self.config.match_mode == Strictness::Exact && is_point {
            (MatchType::Exact, EXACT_CONFIDENCE)
        } else {
            (MatchType::Approximate, APPROXIMATE_CONFIDENCE)
        }
    }

    async fn lookup_local(
        &self,
        pool: &PgPool,
        table: &str,
        request: &GeocodeRequest,
    ) -> Result<Option<GeocodeResult>, ProviderError> {
        let mut builder = local_query(
            table,
            &self.config.geometry_column,
            &self.config.fields,
            self.config.match_mode,
            request,
        )?;
        let row: Option<(Option<f64>, Option<f64>, Option<String>)> = builder
            .build_query_as()
            .fetch_optional(pool)
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let Some((Some(lat), Some(lon), matched)) = row else {
            return Ok(None);
        };
        // The table stores points; centroids only smooth over stray polygons.
        let (match_type, confidence) = self.classify(true);
        let result = GeocodeResult::new(lat, lon, confidence, match_type, PROVIDER_ID);
        Ok(Some(match matched {
            Some(address) => result.with_formatted_address(address),
            None => result,
        }))
    }

    async fn lookup_remote(
        &self,
        client: &reqwest::Client,
        query_url: &Url,
        request: &GeocodeRequest,
    ) -> Result<Option<GeocodeResult>, ProviderError> {
        let where_clause = remote_where(&self.config.fields, self.config.match_mode, request)?;
        debug!(where_clause = %where_clause, "Querying catalog service");

        let response = client
            .get(query_url.clone())
            .query(&[
                ("where", where_clause.as_str()),
                ("outFields", "*"),
                ("returnGeometry", "true"),
                ("outSR", "4326"),
                ("resultRecordCount", "1"),
                ("f", "json"),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ProviderError::Unavailable(format!(
                "catalog service returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(ProviderError::InvalidResponse(format!(
                "catalog service returned {}",
                status
            )));
        }

        let body: FeatureResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        self.feature_result(body)
    }

    fn feature_result(&self, body: FeatureResponse) -> Result<Option<GeocodeResult>, ProviderError> {
        if let Some(error) = body.error {
            return Err(ProviderError::InvalidResponse(
                error
                    .message
                    .unwrap_or_else(|| "catalog service error".to_string()),
            ));
        }

        let Some(feature) = body.features.into_iter().next() else {
            return Ok(None);
        };
        let Some(geometry) = feature.geometry else {
            return Ok(None);
        };
        let Some((lon, lat)) = geometry.representative_point() else {
            return Ok(None);
        };

        let (match_type, confidence) = self.classify(geometry.is_point());
        let result = GeocodeResult::new(lat, lon, confidence, match_type, PROVIDER_ID);

        let attributes = if feature.attributes.is_empty() {
            feature.properties
        } else {
            feature.attributes
        };
        Ok(Some(
            match attributes
                .get(&self.config.fields.address_field)
                .and_then(Value::as_str)
            {
                Some(address) => result.with_formatted_address(address),
                None => result,
            },
        ))
    }
}

#[derive(Debug, Deserialize)]
struct FeatureResponse {
    #[serde(default)]
    features: Vec<Feature>,
    #[serde(default)]
    error: Option<ServiceError>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    #[serde(default)]
    geometry: Option<Geometry>,
    #[serde(default)]
    attributes: Map<String, Value>,
    /// GeoJSON responses carry attributes here.
    #[serde(default)]
    properties: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ServiceError {
    #[serde(default)]
    message: Option<String>,
}

#[async_trait]
impl GeocodingProvider for CatalogProvider {
    fn provider_id(&self) -> &str {
        PROVIDER_ID
    }

    fn provider_name(&self) -> &str {
        "Address Catalog"
    }

    fn is_available(&self) -> bool {
        match &self.source {
            Source::Local { pool, .. } => !pool.is_closed(),
            Source::Remote { .. } => true,
        }
    }

    async fn geocode(
        &self,
        request: &GeocodeRequest,
    ) -> Result<Option<GeocodeResult>, ProviderError> {
        match &self.source {
            Source::Local { pool, table } => self.lookup_local(pool, table, request).await,
            Source::Remote { client, query_url } => {
                self.lookup_remote(client, query_url, request).await
            }
        }
    }
}
