#![cfg(test)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use secrecy::SecretString;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config_parser::Config;
use crate::error::{Error, ErrorDetails};
use crate::gateway_util::AppStateData;
use crate::metrics::EnforcementMetrics;
use crate::policy::{B2bTier, PolicyCatalog, PolicyHandle};
use crate::quota::QuotaEnforcer;
use crate::rate_limit::{ApiKeyRecord, KeyDirectory, KeyStatus, RateLimiter, StaticKeyDirectory};
use crate::retries::RetryConfig;
use crate::usage_store::{
    ConsumeOutcome, ConsumeRequest, CounterRef, FailPolicy, MemoryUsageStore, StoreGuard,
    UsageSnapshot, UsageStore,
};

pub const STARTER_KEY: &str = "tg_live_starter_0001";
pub const SUSPENDED_KEY: &str = "tg_live_suspended_0002";
pub const REVOKED_KEY: &str = "tg_live_revoked_0003";
pub const ENTERPRISE_KEY: &str = "tg_live_enterprise_0004";

pub fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

/// A store that is always down.
#[derive(Default)]
pub struct FailingUsageStore {
    pub calls: AtomicUsize,
}

#[async_trait]
impl UsageStore for FailingUsageStore {
    async fn consume(&self, _request: &ConsumeRequest) -> Result<ConsumeOutcome, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::new(ErrorDetails::StoreUnavailable {
            message: "connection refused".to_string(),
        }))
    }

    async fn snapshot(
        &self,
        _principal_id: &str,
        _counters: &[CounterRef],
        _now: DateTime<Utc>,
    ) -> Result<UsageSnapshot, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::new(ErrorDetails::StoreUnavailable {
            message: "connection refused".to_string(),
        }))
    }

    async fn health(&self) -> Result<(), Error> {
        Err(Error::new(ErrorDetails::StoreUnavailable {
            message: "connection refused".to_string(),
        }))
    }

    fn backend_name(&self) -> &'static str {
        "failing"
    }
}

/// A store that answers correctly, but only after `delay`.
pub struct SlowUsageStore {
    pub calls: AtomicUsize,
    delay: Duration,
    inner: MemoryUsageStore,
}

impl SlowUsageStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
            inner: MemoryUsageStore::new(),
        }
    }
}

#[async_trait]
impl UsageStore for SlowUsageStore {
    async fn consume(&self, request: &ConsumeRequest) -> Result<ConsumeOutcome, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.consume(request).await
    }

    async fn snapshot(
        &self,
        principal_id: &str,
        counters: &[CounterRef],
        now: DateTime<Utc>,
    ) -> Result<UsageSnapshot, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.snapshot(principal_id, counters, now).await
    }

    async fn health(&self) -> Result<(), Error> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "slow"
    }
}

/// A store that applies every charge but replies only after `delay`, for the first
/// `late_replies` calls. Models a reply lost to a client-side timeout.
pub struct LateReplyStore {
    pub calls: AtomicUsize,
    pub inner: MemoryUsageStore,
    delay: Duration,
    late_replies: usize,
}

impl LateReplyStore {
    pub fn new(delay: Duration, late_replies: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            inner: MemoryUsageStore::new(),
            delay,
            late_replies,
        }
    }
}

#[async_trait]
impl UsageStore for LateReplyStore {
    async fn consume(&self, request: &ConsumeRequest) -> Result<ConsumeOutcome, Error> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.inner.consume(request).await;
        if call < self.late_replies {
            tokio::time::sleep(self.delay).await;
        }
        outcome
    }

    async fn snapshot(
        &self,
        principal_id: &str,
        counters: &[CounterRef],
        now: DateTime<Utc>,
    ) -> Result<UsageSnapshot, Error> {
        self.inner.snapshot(principal_id, counters, now).await
    }

    async fn health(&self) -> Result<(), Error> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "late_reply"
    }
}

/// A key directory that never answers within any sane timeout.
pub struct SlowKeyDirectory {
    pub delay: Duration,
}

#[async_trait]
impl KeyDirectory for SlowKeyDirectory {
    async fn lookup(&self, _fingerprint: &str) -> Result<Option<ApiKeyRecord>, Error> {
        tokio::time::sleep(self.delay).await;
        Ok(Some(ApiKeyRecord::new(B2bTier::Starter, KeyStatus::Active, None)))
    }

    async fn health(&self) -> Result<(), Error> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

pub fn fast_guard(store: Arc<dyn UsageStore>) -> StoreGuard {
    StoreGuard::new(
        store,
        Duration::from_millis(50),
        RetryConfig {
            num_retries: 1,
            max_delay_ms: 1,
        },
    )
}

pub fn quota_enforcer(
    store: Arc<dyn UsageStore>,
    fail_open_features: &[&str],
) -> (QuotaEnforcer, Arc<EnforcementMetrics>) {
    let metrics = Arc::new(EnforcementMetrics::default());
    let enforcer = QuotaEnforcer::new(
        PolicyHandle::new(PolicyCatalog::embedded_default().unwrap()),
        fast_guard(store),
        fail_open_features
            .iter()
            .map(|f| f.to_string())
            .collect::<HashSet<_>>(),
        metrics.clone(),
    );
    (enforcer, metrics)
}

pub fn test_key_directory() -> StaticKeyDirectory {
    StaticKeyDirectory::from_records([
        (
            SecretString::from(STARTER_KEY.to_string()),
            ApiKeyRecord::new(B2bTier::Starter, KeyStatus::Active, Some("acme")),
        ),
        (
            SecretString::from(SUSPENDED_KEY.to_string()),
            ApiKeyRecord::new(B2bTier::Growth, KeyStatus::Suspended, None),
        ),
        (
            SecretString::from(REVOKED_KEY.to_string()),
            ApiKeyRecord::new(B2bTier::Starter, KeyStatus::Revoked, None),
        ),
        (
            SecretString::from(ENTERPRISE_KEY.to_string()),
            ApiKeyRecord::new(B2bTier::Enterprise, KeyStatus::Active, None),
        ),
    ])
}

pub fn rate_limiter(
    store: Arc<dyn UsageStore>,
    fail_policy: FailPolicy,
) -> (RateLimiter, Arc<EnforcementMetrics>) {
    let metrics = Arc::new(EnforcementMetrics::default());
    let limiter = RateLimiter::new(
        Arc::new(test_key_directory()),
        PolicyHandle::new(PolicyCatalog::embedded_default().unwrap()),
        fast_guard(store),
        fail_policy,
        metrics.clone(),
    );
    (limiter, metrics)
}

pub fn get_unit_test_app_state_data(store: Arc<dyn UsageStore>) -> AppStateData {
    AppStateData::from_parts(
        Arc::new(Config::default()),
        PolicyCatalog::embedded_default().unwrap(),
        store,
        Arc::new(test_key_directory()),
    )
}
