use axum::body::Bytes;
use axum::extract::{FromRequest, Json, Request};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use crate::config_parser::{Config, KeyDirectoryKind, StoreBackend};
use crate::error::{Error, ErrorDetails};
use crate::metrics::EnforcementMetrics;
use crate::policy::{PolicyCatalog, PolicyHandle};
use crate::quota::QuotaEnforcer;
use crate::rate_limit::{
    CachedKeyDirectory, KeyDirectory, RateLimiter, RedisKeyDirectory, StaticKeyDirectory,
};
use crate::usage_store::{MemoryUsageStore, RedisUsageStore, StoreGuard, UsageStore};

/// State for the API
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub policies: PolicyHandle,
    pub quota: Arc<QuotaEnforcer>,
    pub rate_limiter: Arc<RateLimiter>,
    pub store: Arc<dyn UsageStore>,
    pub keys: Arc<dyn KeyDirectory>,
    pub metrics: Arc<EnforcementMetrics>,
}
pub type AppState = axum::extract::State<AppStateData>;

impl AppStateData {
    pub async fn new(config: Arc<Config>) -> Result<Self, Error> {
        let redis_url = redis_url(&config);
        let catalog = setup_policy_catalog(&config).await?;
        let store = setup_usage_store(&config, redis_url.as_deref()).await?;
        let keys = setup_key_directory(&config, redis_url.as_deref()).await?;
        Ok(Self::from_parts(config, catalog, store, keys))
    }

    /// Wires the enforcers together around an already-built store and key directory.
    pub fn from_parts(
        config: Arc<Config>,
        catalog: PolicyCatalog,
        store: Arc<dyn UsageStore>,
        keys: Arc<dyn KeyDirectory>,
    ) -> Self {
        for feature_id in &config.enforcement.fail_open_features {
            if !catalog.is_declared(feature_id) {
                tracing::warn!(
                    feature_id = %feature_id,
                    "`enforcement.fail_open_features` names a feature the catalog does not declare"
                );
            }
        }

        if config.gateway.internal_token.is_none() {
            tracing::warn!(
                "`gateway.internal_token` is not set; `/internal` routes accept every caller"
            );
        }

        let policies = PolicyHandle::new(catalog);
        let metrics = Arc::new(EnforcementMetrics::default());
        let guard = StoreGuard::new(
            store.clone(),
            config.store.timeout(),
            config.enforcement.retry,
        );
        let quota = Arc::new(QuotaEnforcer::new(
            policies.clone(),
            guard.clone(),
            config.enforcement.fail_open_features.clone(),
            metrics.clone(),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(
            keys.clone(),
            policies.clone(),
            guard,
            config.b2b.fail_policy,
            metrics.clone(),
        ));

        Self {
            config,
            policies,
            quota,
            rate_limiter,
            store,
            keys,
            metrics,
        }
    }
}

/// `TIERGATE_REDIS_URL` wins over `store.url`.
fn redis_url(config: &Config) -> Option<String> {
    std::env::var("TIERGATE_REDIS_URL")
        .ok()
        .filter(|url| !url.is_empty())
        .or_else(|| config.store.url.clone())
}

pub async fn setup_policy_catalog(config: &Config) -> Result<PolicyCatalog, Error> {
    match &config.policies.path {
        Some(path) => {
            let catalog = PolicyCatalog::from_path(path).await?;
            tracing::info!(path = %path.display(), "Loaded policy catalog");
            Ok(catalog)
        }
        None => {
            tracing::info!("No `policies.path` configured; using the embedded policy catalog");
            PolicyCatalog::embedded_default()
        }
    }
}

pub async fn setup_usage_store(
    config: &Config,
    redis_url: Option<&str>,
) -> Result<Arc<dyn UsageStore>, Error> {
    match config.store.backend {
        StoreBackend::Memory => {
            tracing::info!("Using the in-memory usage store; counters are not shared across gateway instances");
            Ok(Arc::new(MemoryUsageStore::new()))
        }
        StoreBackend::Redis => {
            let url = redis_url.ok_or_else(|| {
                Error::new(ErrorDetails::Config {
                    message: "`store.type = \"redis\"` requires `store.url` or `TIERGATE_REDIS_URL`"
                        .to_string(),
                })
            })?;
            Ok(Arc::new(
                RedisUsageStore::new(url, config.store.key_prefix.clone()).await?,
            ))
        }
    }
}

pub async fn setup_key_directory(
    config: &Config,
    redis_url: Option<&str>,
) -> Result<Arc<dyn KeyDirectory>, Error> {
    let directory: Arc<dyn KeyDirectory> = match config.b2b.key_directory {
        KeyDirectoryKind::Static => {
            let directory = StaticKeyDirectory::from_records(
                config
                    .b2b
                    .keys
                    .iter()
                    .map(|key| (key.key.clone(), key.record())),
            );
            if directory.is_empty() {
                tracing::warn!("No B2B API keys configured; every B2B request will be rejected");
            }
            // Nothing to gain from caching an in-memory map
            return Ok(Arc::new(directory));
        }
        KeyDirectoryKind::Redis => {
            let url = redis_url.ok_or_else(|| {
                Error::new(ErrorDetails::Config {
                    message: "`b2b.key_directory = \"redis\"` requires `store.url` or `TIERGATE_REDIS_URL`"
                        .to_string(),
                })
            })?;
            Arc::new(RedisKeyDirectory::new(url, config.store.key_prefix.clone()).await?)
        }
    };

    if config.b2b.key_cache_ttl_ms == 0 {
        return Ok(directory);
    }
    Ok(Arc::new(CachedKeyDirectory::new(
        directory,
        Duration::from_millis(config.b2b.key_cache_ttl_ms),
    )))
}

/// Custom Axum extractor that validates the JSON body and deserializes it into a custom type
///
/// We don't check the `Content-Type` header. An empty body is read as `{}`, so types whose
/// fields all have defaults make the body optional.
pub struct StructuredJson<T>(pub T);

impl<S, T> FromRequest<S> for StructuredJson<T>
where
    S: Send + Sync,
    T: Send + Sync + DeserializeOwned,
{
    type Rejection = Error;

    #[instrument(skip_all, level = "trace", name = "StructuredJson::from_request")]
    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state).await.map_err(|e| {
            Error::new(ErrorDetails::InvalidRequest {
                message: format!("{} ({})", e, e.status()),
            })
        })?;

        let value = if bytes.iter().all(u8::is_ascii_whitespace) {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            Json::<serde_json::Value>::from_bytes(&bytes)
                .map_err(|e| {
                    Error::new(ErrorDetails::InvalidRequest {
                        message: format!("{} ({})", e, e.status()),
                    })
                })?
                .0
        };

        // Now use `serde_path_to_error::deserialize` to attempt deserialization into `T`
        let deserialized: T = serde_path_to_error::deserialize(&value).map_err(|e| {
            Error::new(ErrorDetails::InvalidRequest {
                message: e.to_string(),
            })
        })?;

        Ok(StructuredJson(deserialized))
    }
}
