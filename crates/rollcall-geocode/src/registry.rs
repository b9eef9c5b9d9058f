//! Provider registry: selection, configuration and fallback.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rollcall_core::property::validate_config;
use rollcall_core::{
    GeocodeRequest, GeocodeResult, GeocodingProvider, ProviderConfig, ProviderError,
    ProviderSchema, PropertyDescriptor,
};
use rollcall_db::ProviderConfigRepo;
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::PgPool;
use tracing::{debug, warn};

use crate::{CatalogFactory, CensusFactory, GeocodeError, RegistryResult};

/// Builds provider instances from their stored configuration.
pub trait ProviderFactory: Send + Sync {
    fn provider_id(&self) -> &'static str;
    fn provider_name(&self) -> &'static str;

    fn supports_batch(&self) -> bool {
        false
    }

    fn config_schema(&self) -> Vec<PropertyDescriptor>;

    /// Build from a config that already passed [`validate_config`].
    fn build(
        &self,
        config: &Map<String, Value>,
    ) -> Result<Arc<dyn GeocodingProvider>, ProviderError>;

    fn schema(&self) -> ProviderSchema {
        ProviderSchema {
            provider_id: self.provider_id().to_string(),
            provider_name: self.provider_name().to_string(),
            supports_batch: self.supports_batch(),
            properties: self.config_schema(),
        }
    }
}

/// A stored provider configuration with its live state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    #[serde(flatten)]
    pub config: ProviderConfig,
    pub provider_name: Option<String>,
    pub registered: bool,
    pub available: bool,
}

pub struct ProviderRegistry {
    factories: BTreeMap<&'static str, Arc<dyn ProviderFactory>>,
    configs: Arc<dyn ProviderConfigRepo>,
}

impl ProviderRegistry {
    pub fn new(configs: Arc<dyn ProviderConfigRepo>) -> Self {
        Self {
            factories: BTreeMap::new(),
            configs,
        }
    }

    /// Registry with the Census and Catalog providers. The catalog's local
    /// table mode needs `pool`.
    pub fn with_builtin(configs: Arc<dyn ProviderConfigRepo>, pool: Option<PgPool>) -> Self {
        let mut registry = Self::new(configs);
        registry.register(CensusFactory);
        registry.register(CatalogFactory::new(pool));
        registry
    }

    pub fn register<F: ProviderFactory + 'static>(&mut self, factory: F) {
        self.factories.insert(factory.provider_id(), Arc::new(factory));
    }

    pub fn schemas(&self) -> Vec<ProviderSchema> {
        self.factories.values().map(|f| f.schema()).collect()
    }

    fn factory(&self, provider_id: &str) -> RegistryResult<&Arc<dyn ProviderFactory>> {
        self.factories
            .get(provider_id)
            .ok_or_else(|| GeocodeError::UnknownProvider(provider_id.to_string()))
    }

    fn resolve_config(
        &self,
        factory: &dyn ProviderFactory,
        config: &Value,
    ) -> RegistryResult<Map<String, Value>> {
        validate_config(&factory.config_schema(), config).map_err(|problems| {
            GeocodeError::InvalidConfig {
                provider: factory.provider_id().to_string(),
                problems,
            }
        })
    }

    /// Validate and persist a provider configuration.
    pub async fn save_config(&self, config: ProviderConfig) -> RegistryResult<ProviderConfig> {
        let factory = self.factory(&config.provider_id)?;
        let resolved = self.resolve_config(factory.as_ref(), &config.config)?;

        let mut config = config;
        config.config = Value::Object(resolved);
        Ok(self.configs.upsert(&config).await?)
    }

    /// Build a live provider from a stored configuration.
    pub fn instantiate(&self, config: &ProviderConfig) -> RegistryResult<Arc<dyn GeocodingProvider>> {
        let factory = self.factory(&config.provider_id)?;
        let resolved = self.resolve_config(factory.as_ref(), &config.config)?;
        Ok(factory.build(&resolved)?)
    }

    /// Every stored configuration with its registration and availability.
    pub async fn list(&self) -> RegistryResult<Vec<ProviderStatus>> {
        let configs = self.configs.list().await?;
        Ok(configs
            .into_iter()
            .map(|config| {
                let factory = self.factories.get(config.provider_id.as_str());
                let available = config.is_enabled
                    && self
                        .instantiate(&config)
                        .map(|p| p.is_available())
                        .unwrap_or(false);
                ProviderStatus {
                    provider_name: factory.map(|f| f.provider_name().to_string()),
                    registered: factory.is_some(),
                    available,
                    config,
                }
            })
            .collect())
    }

    /// Pick the provider for a job.
    ///
    /// An explicit `requested` id must be registered, enabled and available.
    /// Otherwise the first enabled, available provider in (primary, priority)
    /// order wins. With `allow_fallback` the remaining usable providers back
    /// it up, in the same order.
    pub async fn resolve(
        &self,
        requested: Option<&str>,
        allow_fallback: bool,
    ) -> RegistryResult<FallbackChain> {
        let configs = self.configs.list().await?;

        let mut usable: Vec<Arc<dyn GeocodingProvider>> = Vec::new();
        for config in configs.iter().filter(|c| c.is_enabled) {
            match self.instantiate(config) {
                Ok(provider) if provider.is_available() => usable.push(provider),
                Ok(_) => debug!(provider = %config.provider_id, "Provider not available"),
                Err(e) => warn!(provider = %config.provider_id, error = %e, "Skipping provider"),
            }
        }

        let primary = match requested {
            Some(id) => {
                self.factory(id)?;
                let config = configs
                    .iter()
                    .find(|c| c.provider_id == id)
                    .filter(|c| c.is_enabled)
                    .ok_or_else(|| GeocodeError::Disabled(id.to_string()))?;
                let provider = self.instantiate(config)?;
                if !provider.is_available() {
                    return Err(GeocodeError::Unavailable(id.to_string()));
                }
                provider
            }
            None => usable.first().cloned().ok_or(GeocodeError::NoProvider)?,
        };

        let fallbacks = if allow_fallback {
            usable
                .into_iter()
                .filter(|p| p.provider_id() != primary.provider_id())
                .collect()
        } else {
            Vec::new()
        };

        Ok(FallbackChain { primary, fallbacks })
    }

    pub async fn record_usage(&self, provider_id: &str, processed: u64, failed: u64) {
        if let Err(e) = self.configs.record_usage(provider_id, processed, failed).await {
            warn!(provider = %provider_id, error = %e, "Failed to record provider usage");
        }
    }
}

/// A chosen provider plus the ones tried when it errors out.
///
/// Fallbacks run only on `Err`; a clean no-match from the primary is final.
pub struct FallbackChain {
    primary: Arc<dyn GeocodingProvider>,
    fallbacks: Vec<Arc<dyn GeocodingProvider>>,
}

impl FallbackChain {
    pub fn single(provider: Arc<dyn GeocodingProvider>) -> Self {
        Self {
            primary: provider,
            fallbacks: Vec::new(),
        }
    }

    pub fn fallback_ids(&self) -> Vec<&str> {
        self.fallbacks.iter().map(|p| p.provider_id()).collect()
    }
}

#[async_trait]
impl GeocodingProvider for FallbackChain {
    fn provider_id(&self) -> &str {
        self.primary.provider_id()
    }

    fn provider_name(&self) -> &str {
        self.primary.provider_name()
    }

    fn is_available(&self) -> bool {
        self.primary.is_available()
    }

    fn supports_batch(&self) -> bool {
        self.primary.supports_batch()
    }

    async fn geocode(
        &self,
        request: &GeocodeRequest,
    ) -> Result<Option<GeocodeResult>, ProviderError> {
        let mut last_error = match self.primary.geocode(request).await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };
        for fallback in &self.fallbacks {
            warn!(
                provider = %self.primary.provider_id(),
                fallback = %fallback.provider_id(),
                error = %last_error,
                "Geocode failed, trying fallback"
            );
            match fallback.geocode(request).await {
                Ok(result) => return Ok(result),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }

    async fn batch_geocode(
        &self,
        requests: &[GeocodeRequest],
    ) -> Result<Vec<Option<GeocodeResult>>, ProviderError> {
        let mut last_error = match self.primary.batch_geocode(requests).await {
            Ok(results) => return Ok(results),
            Err(e) => e,
        };
        for fallback in &self.fallbacks {
            warn!(
                provider = %self.primary.provider_id(),
                fallback = %fallback.provider_id(),
                error = %last_error,
                "Batch geocode failed, trying fallback"
            );
            match fallback.batch_geocode(requests).await {
                Ok(results) => return Ok(results),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }
}
