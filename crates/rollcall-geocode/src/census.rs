//! US Census Bureau geocoder.
//!
//! Single lookups use the one-line address endpoint. Batches are posted as a
//! CSV of `id,street,city,state,zip` rows and come back as CSV keyed by id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use rollcall_core::{
    GeocodeRequest, GeocodeResult, GeocodingProvider, MatchType, PropertyDescriptor,
    ProviderError,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use url::Url;

use crate::ProviderFactory;

pub const PROVIDER_ID: &str = "census";
pub const DEFAULT_BASE_URL: &str = "https://geocoding.geo.census.gov/geocoder";
pub const DEFAULT_BENCHMARK: &str = "Public_AR_Current";

const EXACT_CONFIDENCE: f64 = 0.95;
const APPROXIMATE_CONFIDENCE: f64 = 0.8;

/// Rows per batch upload; the service rejects files far larger than this.
const MAX_BATCH_ROWS: usize = 1000;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CensusConfig {
    pub base_url: String,
    pub benchmark: String,
    pub timeout_secs: f64,
}

impl Default for CensusConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            benchmark: DEFAULT_BENCHMARK.to_string(),
            timeout_secs: 30.0,
        }
    }
}

pub struct CensusFactory;

impl ProviderFactory for CensusFactory {
    fn provider_id(&self) -> &'static str {
        PROVIDER_ID
    }

    fn provider_name(&self) -> &'static str {
        "US Census Geocoder"
    }

    fn supports_batch(&self) -> bool {
        true
    }

    fn config_schema(&self) -> Vec<PropertyDescriptor> {
        vec![
            PropertyDescriptor::string("baseUrl", "Service URL").with_default(DEFAULT_BASE_URL),
            PropertyDescriptor::string("benchmark", "Benchmark").with_default(DEFAULT_BENCHMARK),
            PropertyDescriptor::number("timeoutSecs", "Request timeout (seconds)")
                .with_default(30)
                .with_range(1.0, 300.0),
        ]
    }

    fn build(
        &self,
        config: &Map<String, Value>,
    ) -> Result<Arc<dyn GeocodingProvider>, ProviderError> {
        let config: CensusConfig = serde_json::from_value(Value::Object(config.clone()))
            .map_err(|e| ProviderError::Config(e.to_string()))?;
        Ok(Arc::new(CensusProvider::new(config)?))
    }
}

pub struct CensusProvider {
    client: reqwest::Client,
    config: CensusConfig,
}

impl CensusProvider {
    pub fn new(config: CensusConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(config.timeout_secs.max(1.0)))
            .build()
            .map_err(|e| ProviderError::Config(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Transport(err.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    if status.is_server_error() {
        Err(ProviderError::Unavailable(format!("census returned {}", status)))
    } else {
        Err(ProviderError::InvalidResponse(format!(
            "census returned {}: {}",
            status, text
        )))
    }
}

#[derive(Debug, Deserialize)]
struct OneLineResponse {
    result: OneLineResult,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OneLineResult {
    #[serde(default)]
    address_matches: Vec<AddressMatch>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddressMatch {
    matched_address: Option<String>,
    coordinates: Coordinates,
}

#[derive(Debug, Deserialize)]
struct Coordinates {
    x: f64,
    y: f64,
}

/// A single unambiguous match counts as exact.
fn one_line_result(response: OneLineResponse) -> Option<GeocodeResult> {
    let matches = response.result.address_matches;
    let (match_type, confidence) = if matches.len() == 1 {
        (MatchType::Exact, EXACT_CONFIDENCE)
    } else {
        (MatchType::Approximate, APPROXIMATE_CONFIDENCE)
    };
    let best = matches.into_iter().next()?;
    let result = GeocodeResult::new(
        best.coordinates.y,
        best.coordinates.x,
        confidence,
        match_type,
        PROVIDER_ID,
    );
    Some(match best.matched_address {
        Some(address) => result.with_formatted_address(address),
        None => result,
    })
}

/// Encode requests as the headerless CSV the batch endpoint expects.
pub fn build_batch_csv(requests: &[GeocodeRequest]) -> Result<String, ProviderError> {
    let encode_error = |e: &dyn std::fmt::Display| {
        ProviderError::Transport(format!("could not encode batch: {}", e))
    };

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    for request in requests {
        writer
            .write_record([
                request.id.as_str(),
                request.street.as_str(),
                request.city.as_str(),
                request.state.as_str(),
                request.zip.as_str(),
            ])
            .map_err(|e| encode_error(&e))?;
    }
    let bytes = writer.into_inner().map_err(|e| encode_error(&e))?;
    String::from_utf8(bytes).map_err(|e| encode_error(&e))
}

/// Parse a batch response into matches keyed by request id.
///
/// Columns: id, input address, match status, match type, matched address,
/// "lon,lat", and trailing TIGER fields. Rows that are missing, unmatched or
/// malformed simply produce no entry.
pub fn parse_batch_response(body: &str) -> HashMap<String, GeocodeResult> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());

    let mut matches = HashMap::new();
    for record in reader.records() {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable census batch row");
                continue;
            }
        };

        let Some(id) = record.get(0).map(str::trim) else {
            continue;
        };
        if record.get(2).map(str::trim) != Some("Match") {
            continue;
        }
        let Some((lon, lat)) = record.get(5).and_then(parse_lon_lat) else {
            debug!(id = %id, "Census match without coordinates");
            continue;
        };

        let exact = record
            .get(3)
            .is_some_and(|t| t.trim().eq_ignore_ascii_case("Exact"));
        let (match_type, confidence) = if exact {
            (MatchType::Exact, EXACT_CONFIDENCE)
        } else {
            (MatchType::Approximate, APPROXIMATE_CONFIDENCE)
        };

        let mut result = GeocodeResult::new(lat, lon, confidence, match_type, PROVIDER_ID);
        if let Some(address) = record.get(4).map(str::trim).filter(|a| !a.is_empty()) {
            result = result.with_formatted_address(address);
        }
        matches.insert(id.to_string(), result);
    }
    matches
}

fn parse_lon_lat(value: &str) -> Option<(f64, f64)> {
    let (lon, lat) = value.split_once(',')?;
    Some((lon.trim().parse().ok()?, lat.trim().parse().ok()?))
}

#[async_trait]
impl GeocodingProvider for CensusProvider {
    fn provider_id(&self) -> &str {
        PROVIDER_ID
    }

    fn provider_name(&self) -> &str {
        "US Census Geocoder"
    }

    fn is_available(&self) -> bool {
        Url::parse(&self.config.base_url)
            .map(|u| matches!(u.scheme(), "http" | "https"))
            .unwrap_or(false)
    }

    fn supports_batch(&self) -> bool {
        true
    }

    async fn geocode(
        &self,
        request: &GeocodeRequest,
    ) -> Result<Option<GeocodeResult>, ProviderError> {
        let url = format!(
            "{}?address={}&benchmark={}&format=json",
            self.endpoint("locations/onelineaddress"),
            urlencoding::encode(&request.one_line()),
            urlencoding::encode(&self.config.benchmark),
        );

        let response = self.client.get(&url).send().await.map_err(transport_error)?;
        let response = check_status(response).await?;
        let body: OneLineResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        Ok(one_line_result(body))
    }

    async fn batch_geocode(
        &self,
        requests: &[GeocodeRequest],
    ) -> Result<Vec<Option<GeocodeResult>>, ProviderError> {
        let mut results = Vec::with_capacity(requests.len());

        for chunk in requests.chunks(MAX_BATCH_ROWS) {
            let file = Part::text(build_batch_csv(chunk)?)
                .file_name("addresses.csv")
                .mime_str("text/csv")
                .map_err(|e| ProviderError::Transport(e.to_string()))?;
            let form = Form::new()
                .text("benchmark", self.config.benchmark.clone())
                .part("addressFile", file);

            let response = self
                .client
                .post(self.endpoint("locations/addressbatch"))
                .multipart(form)
                .send()
                .await
                .map_err(transport_error)?;
            let body = check_status(response)
                .await?
                .text()
                .await
                .map_err(transport_error)?;

            let mut matched = parse_batch_response(&body);
            debug!(
                requested = chunk.len(),
                matched = matched.len(),
                "Census batch complete"
            );
            results.extend(chunk.iter().map(|r| matched.remove(&r.id)));
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::property::validate_config;
    use serde_json::json;

    fn request(id: &str, street: &str) -> GeocodeRequest {
        GeocodeRequest {
            id: id.to_string(),
            street: street.to_string(),
            city: "Martinez".to_string(),
            state: "CA".to_string(),
            zip: "94553".to_string(),
        }
    }

    #[test]
    fn test_batch_csv_quotes_commas() {
        let csv = build_batch_csv(&[
            request("1", "651 Pine St"),
            request("2", "1 Main St, Apt 4"),
        ])
        .unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "1,651 Pine St,Martinez,CA,94553");
        assert_eq!(lines[1], "2,\"1 Main St, Apt 4\",Martinez,CA,94553");
    }

    #[test]
    fn test_parse_batch_response() {
        let body = concat!(
            "\"1\",\"651 Pine St, Martinez, CA, 94553\",\"Match\",\"Exact\",",
            "\"651 PINE ST, MARTINEZ, CA, 94553\",\"-122.1341,38.0166\",\"647\",\"L\"\n",
            "\"2\",\"1 Main St, Martinez, CA, 94553\",\"Match\",\"Non_Exact\",",
            "\"1 MAIN ST, MARTINEZ, CA, 94553\",\"-122.13,38.01\",\"12\",\"R\"\n",
            "\"3\",\"Nowhere, CA\",\"No_Match\"\n",
            "\"4\",\"Somewhere\",\"Tie\"\n",
        );

        let matches = parse_batch_response(body);
        assert_eq!(matches.len(), 2);

        let exact = &matches["1"];
        assert_eq!(exact.match_type, MatchType::Exact);
        assert_eq!(exact.confidence, 0.95);
        assert!((exact.latitude - 38.0166).abs() < 1e-9);
        assert!((exact.longitude + 122.1341).abs() < 1e-9);

        let approx = &matches["2"];
        assert_eq!(approx.match_type, MatchType::Approximate);
        assert_eq!(approx.confidence, 0.8);
    }

    #[test]
    fn test_parse_batch_tolerates_garbage() {
        let matches = parse_batch_response("\"9\",\"x\",\"Match\",\"Exact\",\"x\",\"not-a-point\"\n");
        assert!(matches.is_empty());
    }

    #[test]
    fn test_one_line_response() {
        let body: OneLineResponse = serde_json::from_value(json!({
            "result": {
                "addressMatches": [{
                    "matchedAddress": "651 PINE ST, MARTINEZ, CA, 94553",
                    "coordinates": { "x": -122.1341, "y": 38.0166 }
                }]
            }
        }))
        .unwrap();
        let result = one_line_result(body).unwrap();
        assert_eq!(result.match_type, MatchType::Exact);
        assert_eq!(result.source, "census");
        assert_eq!(
            result.formatted_address.as_deref(),
            Some("651 PINE ST, MARTINEZ, CA, 94553")
        );

        let empty: OneLineResponse =
            serde_json::from_value(json!({ "result": { "addressMatches": [] } })).unwrap();
        assert!(one_line_result(empty).is_none());
    }

    #[test]
    fn test_factory_defaults_build_available_provider() {
        let factory = CensusFactory;
        let config = validate_config(&factory.config_schema(), &json!({})).unwrap();
        let provider = factory.build(&config).unwrap();
        assert!(provider.is_available());
        assert!(provider.supports_batch());
    }

    #[test]
    fn test_bad_base_url_is_unavailable() {
        let provider = CensusProvider::new(CensusConfig {
            base_url: "not a url".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert!(!provider.is_available());
    }
}
