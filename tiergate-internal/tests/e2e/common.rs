use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use tiergate_internal::metrics::EnforcementMetrics;
use tiergate_internal::policy::{PolicyCatalog, PolicyHandle};
use tiergate_internal::retries::RetryConfig;
use tiergate_internal::usage_store::{RedisUsageStore, StoreGuard, UsageStore};

pub fn redis_url() -> String {
    std::env::var("TIERGATE_REDIS_URL").expect("TIERGATE_REDIS_URL must be set for e2e tests")
}

/// A prefix no other test run shares.
pub fn unique_prefix() -> String {
    format!("tg-e2e-{}", Uuid::now_v7())
}

pub async fn redis_store(prefix: &str) -> Arc<dyn UsageStore> {
    Arc::new(
        RedisUsageStore::new(&redis_url(), prefix.to_string())
            .await
            .unwrap(),
    )
}

pub async fn redis_connection() -> redis::aio::MultiplexedConnection {
    redis::Client::open(redis_url())
        .unwrap()
        .get_multiplexed_async_connection()
        .await
        .unwrap()
}

pub fn guard(store: Arc<dyn UsageStore>) -> StoreGuard {
    StoreGuard::new(
        store,
        Duration::from_millis(500),
        RetryConfig {
            num_retries: 1,
            max_delay_ms: 10,
        },
    )
}

pub fn policies() -> PolicyHandle {
    PolicyHandle::new(PolicyCatalog::embedded_default().unwrap())
}

pub fn metrics() -> Arc<EnforcementMetrics> {
    Arc::new(EnforcementMetrics::default())
}
