use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Serialize;
use std::sync::Arc;
use strum::Display;

use crate::error::{Error, ErrorDetails};
use crate::metrics::EnforcementMetrics;
use crate::period::{Period, Window};
use crate::policy::{B2bRateLimits, B2bTier, PolicyHandle};
use crate::quota::DecisionBasis;
use crate::usage_store::{ConsumeRequest, CounterRef, FailPolicy, StoreGuard, WindowCharge};

pub mod key_directory;
pub mod middleware;

pub use key_directory::{
    fingerprint_api_key, ApiKeyRecord, CachedKeyDirectory, KeyDirectory, KeyStatus,
    RedisKeyDirectory, StaticKeyDirectory,
};
pub use middleware::{b2b_rate_limit_middleware, B2bCaller};

/// Counter dimension used for B2B keys inside their usage records.
const REQUESTS_DIMENSION: &str = "requests";

/// Why a key was turned away before any quota was evaluated.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum KeyRejection {
    Unknown,
    Suspended,
    Revoked,
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RateWindow {
    Minute,
    Day,
}

#[derive(Clone, Debug, PartialEq)]
pub struct B2bRateLimitResult {
    pub allowed: bool,
    /// Headroom of the tighter window as seen by this request
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub limit: u64,
    /// The window whose limit `remaining`, `reset_at` and `limit` describe
    pub governing_window: RateWindow,
    pub basis: DecisionBasis,
}

#[derive(Clone, Debug, PartialEq)]
pub enum B2bDecision {
    Rejected(KeyRejection),
    Evaluated(B2bRateLimitResult),
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct B2bUsage {
    pub today: u64,
    pub this_minute: u64,
    pub last_request_at: Option<DateTime<Utc>>,
}

/// An API key as reported back to its owner. Only the fingerprint ever leaves the gateway.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct B2bApiKey {
    pub fingerprint: String,
    pub tier: B2bTier,
    pub status: KeyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub rate_limits: B2bRateLimits,
    pub usage: B2bUsage,
}

struct DualWindow {
    minute: Window,
    day: Window,
    limits: B2bRateLimits,
}

impl DualWindow {
    fn new(limits: B2bRateLimits, now: DateTime<Utc>) -> Self {
        Self {
            minute: Period::Minute.window(now),
            day: Period::Day.window(now),
            limits,
        }
    }

    fn counters(&self) -> [CounterRef; 2] {
        [
            CounterRef::new(&self.minute, REQUESTS_DIMENSION),
            CounterRef::new(&self.day, REQUESTS_DIMENSION),
        ]
    }

    fn charges(&self) -> Vec<WindowCharge> {
        let [minute, day] = self.counters();
        vec![
            WindowCharge {
                counter: minute,
                limit: self.limits.requests_per_minute,
            },
            WindowCharge {
                counter: day,
                limit: self.limits.requests_per_day,
            },
        ]
    }

    fn window(&self, window: RateWindow) -> (&Window, u64) {
        match window {
            RateWindow::Minute => (&self.minute, self.limits.requests_per_minute),
            RateWindow::Day => (&self.day, self.limits.requests_per_day),
        }
    }

    fn result(
        &self,
        allowed: bool,
        remaining: u64,
        governing_window: RateWindow,
        basis: DecisionBasis,
    ) -> B2bRateLimitResult {
        let (window, limit) = self.window(governing_window);
        B2bRateLimitResult {
            allowed,
            remaining,
            reset_at: window.end,
            limit,
            governing_window,
            basis,
        }
    }
}

/// Meters B2B API keys against a per-minute and a per-day fixed window at once.
pub struct RateLimiter {
    keys: Arc<dyn KeyDirectory>,
    policies: PolicyHandle,
    store: StoreGuard,
    fail_policy: FailPolicy,
    metrics: Arc<EnforcementMetrics>,
}

impl RateLimiter {
    pub fn new(
        keys: Arc<dyn KeyDirectory>,
        policies: PolicyHandle,
        store: StoreGuard,
        fail_policy: FailPolicy,
        metrics: Arc<EnforcementMetrics>,
    ) -> Self {
        Self {
            keys,
            policies,
            store,
            fail_policy,
            metrics,
        }
    }

    pub fn fail_policy(&self) -> FailPolicy {
        self.fail_policy
    }

    pub async fn allow(
        &self,
        api_key: &SecretString,
        now: DateTime<Utc>,
    ) -> Result<B2bDecision, Error> {
        self.allow_fingerprint(&fingerprint_api_key(api_key), now)
            .await
    }

    /// Rejects inactive or unknown keys, then charges one request against both windows,
    /// all or nothing.
    ///
    /// Only a key directory failure is returned as an error; store failures go through
    /// the configured fail policy.
    pub async fn allow_fingerprint(
        &self,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<B2bDecision, Error> {
        let record = match self.lookup_key(fingerprint).await? {
            Some(record) => record,
            None => return Ok(self.reject(fingerprint, KeyRejection::Unknown)),
        };
        match record.status {
            KeyStatus::Active => {}
            KeyStatus::Suspended => return Ok(self.reject(fingerprint, KeyRejection::Suspended)),
            KeyStatus::Revoked => return Ok(self.reject(fingerprint, KeyRejection::Revoked)),
        }

        let windows = DualWindow::new(self.policies.load().b2b_limits().limits(record.tier), now);
        let request = ConsumeRequest::new(principal_id(fingerprint), windows.charges(), 1, now);

        let outcome = match self.store.consume(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let result = self.store_failed(fingerprint, &windows, &e);
                return Ok(B2bDecision::Evaluated(result));
            }
        };
        let [minute_before, day_before] = match outcome.counts_before.as_slice() {
            [minute, day] => [*minute, *day],
            _ => [0, 0],
        };
        let minute_headroom = windows.limits.requests_per_minute.saturating_sub(minute_before);
        let day_headroom = windows.limits.requests_per_day.saturating_sub(day_before);
        let remaining = minute_headroom.min(day_headroom);

        if outcome.applied {
            self.metrics.record_allowed();
            let governing = if day_headroom < minute_headroom {
                RateWindow::Day
            } else {
                RateWindow::Minute
            };
            Ok(B2bDecision::Evaluated(windows.result(
                true,
                remaining,
                governing,
                DecisionBasis::Counted,
            )))
        } else {
            self.metrics.record_denied();
            // The day window outlasts the minute window, so once it is exhausted it is the
            // one that decides when the key may call again
            let governing = if day_headroom == 0 {
                RateWindow::Day
            } else {
                RateWindow::Minute
            };
            tracing::debug!(
                key_fingerprint = fingerprint,
                tier = %record.tier,
                window = %governing,
                minute_count = minute_before,
                day_count = day_before,
                "Rate limit exceeded"
            );
            Ok(B2bDecision::Evaluated(windows.result(
                false,
                remaining,
                governing,
                DecisionBasis::Counted,
            )))
        }
    }

    /// The owner-facing view of a key, with current usage. Does not consume anything.
    pub async fn key_usage(
        &self,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<B2bApiKey>, Error> {
        let Some(record) = self.lookup_key(fingerprint).await? else {
            return Ok(None);
        };
        let rate_limits = self.policies.load().b2b_limits().limits(record.tier);
        let windows = DualWindow::new(rate_limits, now);
        let snapshot = self
            .store
            .snapshot(&principal_id(fingerprint), &windows.counters(), now)
            .await?;
        let (this_minute, today) = match snapshot.counts.as_slice() {
            [minute, day] => (*minute, *day),
            _ => (0, 0),
        };
        Ok(Some(B2bApiKey {
            fingerprint: fingerprint.to_string(),
            tier: record.tier,
            status: record.status,
            label: record.label,
            rate_limits,
            usage: B2bUsage {
                today,
                this_minute,
                last_request_at: snapshot.last_consumed_at,
            },
        }))
    }

    /// Bounded by the store timeout, so a stalled directory cannot hold a request forever.
    async fn lookup_key(&self, fingerprint: &str) -> Result<Option<ApiKeyRecord>, Error> {
        let limit = self.store.timeout();
        match tokio::time::timeout(limit, self.keys.lookup(fingerprint)).await {
            Ok(result) => result,
            Err(_) => Err(Error::new(ErrorDetails::KeyDirectoryUnavailable {
                message: format!("lookup timed out after {}ms", limit.as_millis()),
            })),
        }
    }

    fn reject(&self, fingerprint: &str, rejection: KeyRejection) -> B2bDecision {
        self.metrics.record_key_rejected();
        tracing::info!(
            key_fingerprint = fingerprint,
            reason = %rejection,
            "Rejected API key"
        );
        B2bDecision::Rejected(rejection)
    }

    fn store_failed(
        &self,
        fingerprint: &str,
        windows: &DualWindow,
        error: &Error,
    ) -> B2bRateLimitResult {
        self.metrics.record_store_failure();
        tracing::error!(
            key_fingerprint = fingerprint,
            fail_policy = %self.fail_policy,
            "Usage store unavailable after retries: {error}"
        );
        let basis = match self.fail_policy {
            FailPolicy::Open => {
                self.metrics.record_fail_open_allow();
                DecisionBasis::StoreFailOpen
            }
            FailPolicy::Closed => DecisionBasis::StoreFailClosed,
        };
        windows.result(
            self.fail_policy == FailPolicy::Open,
            0,
            RateWindow::Minute,
            basis,
        )
    }
}

fn principal_id(fingerprint: &str) -> String {
    format!("b2b:{fingerprint}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyCatalog;
    use crate::testing::{
        at, fast_guard, rate_limiter, FailingUsageStore, SlowKeyDirectory, ENTERPRISE_KEY,
        REVOKED_KEY, STARTER_KEY, SUSPENDED_KEY,
    };
    use crate::usage_store::{MemoryUsageStore, UsageStore};
    use std::time::Duration;
    use tracing_test::traced_test;

    fn key(raw: &str) -> SecretString {
        SecretString::from(raw)
    }

    fn evaluated(decision: B2bDecision) -> B2bRateLimitResult {
        match decision {
            B2bDecision::Evaluated(result) => result,
            B2bDecision::Rejected(rejection) => panic!("unexpected rejection: {rejection}"),
        }
    }

    /// Pushes the counters for `api_key` up to the given counts without going through the limiter.
    async fn seed(
        store: &MemoryUsageStore,
        api_key: &str,
        now: DateTime<Utc>,
        minute: u64,
        day: u64,
    ) {
        let principal = principal_id(&fingerprint_api_key(&key(api_key)));
        let unbounded = DualWindow::new(
            B2bRateLimits {
                requests_per_minute: u64::MAX,
                requests_per_day: u64::MAX,
            },
            now,
        );
        let [_, day_counter] = unbounded.counters();
        let batches = [
            (
                vec![WindowCharge {
                    counter: day_counter,
                    limit: u64::MAX,
                }],
                day - minute,
            ),
            (unbounded.charges(), minute),
        ];
        for (charges, cost) in batches {
            if cost == 0 {
                continue;
            }
            store
                .consume(&ConsumeRequest::new(principal.clone(), charges, cost, now))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_dual_window_minute_denies_while_day_has_headroom() {
        let store = Arc::new(MemoryUsageStore::new());
        let now = at(2026, 3, 14, 15, 30, 10);
        seed(&store, STARTER_KEY, now, 29, 998).await;
        let (limiter, metrics) = rate_limiter(store.clone(), FailPolicy::Closed);

        let first = evaluated(limiter.allow(&key(STARTER_KEY), now).await.unwrap());
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);
        assert_eq!(first.governing_window, RateWindow::Minute);
        assert_eq!(first.limit, 30);
        assert_eq!(first.reset_at, at(2026, 3, 14, 15, 31, 0));

        let second = evaluated(limiter.allow(&key(STARTER_KEY), now).await.unwrap());
        assert!(!second.allowed);
        assert_eq!(second.remaining, 0);
        assert_eq!(second.governing_window, RateWindow::Minute);
        assert_eq!(second.reset_at, at(2026, 3, 14, 15, 31, 0));

        // The denied request must not have eaten into the day window
        let usage = limiter
            .key_usage(&fingerprint_api_key(&key(STARTER_KEY)), now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(usage.usage.this_minute, 30);
        assert_eq!(usage.usage.today, 999);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.allowed, 1);
        assert_eq!(snapshot.denied, 1);
    }

    #[tokio::test]
    async fn test_exhausted_day_window_governs() {
        let store = Arc::new(MemoryUsageStore::new());
        let now = at(2026, 3, 14, 15, 30, 10);
        seed(&store, STARTER_KEY, now, 0, 1_000).await;
        let (limiter, _) = rate_limiter(store, FailPolicy::Closed);

        let result = evaluated(limiter.allow(&key(STARTER_KEY), now).await.unwrap());
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
        assert_eq!(result.governing_window, RateWindow::Day);
        assert_eq!(result.limit, 1_000);
        assert_eq!(result.reset_at, at(2026, 3, 15, 0, 0, 0));

        // A fresh minute does not help
        let later = evaluated(
            limiter
                .allow(&key(STARTER_KEY), at(2026, 3, 14, 15, 31, 0))
                .await
                .unwrap(),
        );
        assert!(!later.allowed);

        let tomorrow = evaluated(
            limiter
                .allow(&key(STARTER_KEY), at(2026, 3, 15, 0, 0, 0))
                .await
                .unwrap(),
        );
        assert!(tomorrow.allowed);
        assert_eq!(tomorrow.remaining, 30);
    }

    #[tokio::test]
    async fn test_minute_window_rolls_over() {
        let store = Arc::new(MemoryUsageStore::new());
        let (limiter, _) = rate_limiter(store, FailPolicy::Closed);
        let now = at(2026, 3, 14, 15, 30, 59);

        for _ in 0..30 {
            assert!(evaluated(limiter.allow(&key(STARTER_KEY), now).await.unwrap()).allowed);
        }
        assert!(!evaluated(limiter.allow(&key(STARTER_KEY), now).await.unwrap()).allowed);

        let next_minute = evaluated(
            limiter
                .allow(&key(STARTER_KEY), at(2026, 3, 14, 15, 31, 0))
                .await
                .unwrap(),
        );
        assert!(next_minute.allowed);
        assert_eq!(next_minute.remaining, 30);
    }

    #[tokio::test]
    async fn test_enterprise_limits() {
        let (limiter, _) = rate_limiter(Arc::new(MemoryUsageStore::new()), FailPolicy::Closed);
        let result = evaluated(
            limiter
                .allow(&key(ENTERPRISE_KEY), at(2026, 3, 14, 15, 30, 0))
                .await
                .unwrap(),
        );
        assert!(result.allowed);
        assert_eq!(result.limit, 600);
        assert_eq!(result.remaining, 600);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_inactive_and_unknown_keys_are_rejected_before_quota() {
        let failing = Arc::new(FailingUsageStore::default());
        let (limiter, metrics) = rate_limiter(failing.clone(), FailPolicy::Open);
        let now = at(2026, 3, 14, 15, 30, 0);

        assert_eq!(
            limiter.allow(&key(SUSPENDED_KEY), now).await.unwrap(),
            B2bDecision::Rejected(KeyRejection::Suspended)
        );
        assert_eq!(
            limiter.allow(&key(REVOKED_KEY), now).await.unwrap(),
            B2bDecision::Rejected(KeyRejection::Revoked)
        );
        assert_eq!(
            limiter.allow(&key("tg_live_forged"), now).await.unwrap(),
            B2bDecision::Rejected(KeyRejection::Unknown)
        );

        assert_eq!(
            failing.calls.load(std::sync::atomic::Ordering::SeqCst),
            0
        );
        assert_eq!(metrics.snapshot().key_rejected, 3);
        assert!(logs_contain("Rejected API key"));
        assert!(!logs_contain(SUSPENDED_KEY));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_store_failure_applies_fail_policy() {
        let now = at(2026, 3, 14, 15, 30, 0);

        let (closed, _) = rate_limiter(Arc::new(FailingUsageStore::default()), FailPolicy::Closed);
        let result = evaluated(closed.allow(&key(STARTER_KEY), now).await.unwrap());
        assert!(!result.allowed);
        assert_eq!(result.basis, DecisionBasis::StoreFailClosed);

        let (open, metrics) =
            rate_limiter(Arc::new(FailingUsageStore::default()), FailPolicy::Open);
        assert_eq!(open.fail_policy(), FailPolicy::Open);
        let result = evaluated(open.allow(&key(STARTER_KEY), now).await.unwrap());
        assert!(result.allowed);
        assert_eq!(result.basis, DecisionBasis::StoreFailOpen);
        assert_eq!(result.remaining, 0);
        assert_eq!(metrics.snapshot().fail_open_allows, 1);
        assert!(logs_contain("Usage store unavailable after retries"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_respect_minute_limit() {
        let (limiter, _) = rate_limiter(Arc::new(MemoryUsageStore::new()), FailPolicy::Closed);
        let limiter = Arc::new(limiter);
        let now = at(2026, 3, 14, 15, 30, 0);

        let tasks: Vec<_> = (0..80)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    evaluated(limiter.allow(&key(STARTER_KEY), now).await.unwrap()).allowed
                })
            })
            .collect();
        let mut allowed = 0;
        for task in tasks {
            if task.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 30);
    }

    #[tokio::test]
    async fn test_key_usage_reports_limits_and_counts() {
        let store = Arc::new(MemoryUsageStore::new());
        let (limiter, _) = rate_limiter(store, FailPolicy::Closed);
        let now = at(2026, 3, 14, 15, 30, 0);
        let fingerprint = fingerprint_api_key(&key(STARTER_KEY));

        for _ in 0..3 {
            limiter.allow(&key(STARTER_KEY), now).await.unwrap();
        }
        let usage = limiter.key_usage(&fingerprint, now).await.unwrap().unwrap();
        assert_eq!(usage.tier, B2bTier::Starter);
        assert_eq!(usage.status, KeyStatus::Active);
        assert_eq!(usage.label.as_deref(), Some("acme"));
        assert_eq!(usage.rate_limits.requests_per_minute, 30);
        assert_eq!(
            usage.usage,
            B2bUsage {
                today: 3,
                this_minute: 3,
                last_request_at: Some(now),
            }
        );

        // Next minute, same day
        let usage = limiter
            .key_usage(&fingerprint, at(2026, 3, 14, 15, 31, 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(usage.usage.this_minute, 0);
        assert_eq!(usage.usage.today, 3);

        assert_eq!(limiter.key_usage("not-a-key", now).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stalled_key_directory_is_bounded_by_store_timeout() {
        let store = Arc::new(MemoryUsageStore::new());
        let limiter = RateLimiter::new(
            Arc::new(SlowKeyDirectory {
                delay: Duration::from_secs(30),
            }),
            PolicyHandle::new(PolicyCatalog::embedded_default().unwrap()),
            fast_guard(store.clone()),
            FailPolicy::Open,
            Arc::new(EnforcementMetrics::default()),
        );
        let now = at(2026, 3, 14, 12, 0, 0);

        let started = tokio::time::Instant::now();
        let err = limiter.allow(&key(STARTER_KEY), now).await.unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::KeyDirectoryUnavailable { .. }
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(store.principal_count(), 0);

        let fingerprint = fingerprint_api_key(&key(STARTER_KEY));
        assert!(limiter.key_usage(&fingerprint, now).await.is_err());
    }
}
