use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tokio::time::timeout;

use crate::error::{Error, ErrorDetails};
use crate::retries::RetryConfig;
use crate::usage_store::{ConsumeOutcome, ConsumeRequest, CounterRef, UsageSnapshot, UsageStore};

/// What an enforcer does once the store has failed and retries are exhausted.
#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailPolicy {
    /// Allow the request; quota integrity is not preserved while the store is down
    Open,
    /// Deny the request
    #[default]
    Closed,
}

/// Wraps a `UsageStore` so that no call blocks longer than `timeout` per attempt,
/// and retryable failures are retried with jittered exponential backoff.
#[derive(Clone)]
pub struct StoreGuard {
    store: Arc<dyn UsageStore>,
    timeout: Duration,
    retry: RetryConfig,
}

impl StoreGuard {
    pub fn new(store: Arc<dyn UsageStore>, timeout: Duration, retry: RetryConfig) -> Self {
        Self {
            store,
            timeout,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<dyn UsageStore> {
        &self.store
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// A timed-out attempt may still land on the store, so every retry resubmits the same
    /// `request_id` and gets the first outcome back instead of a second charge.
    pub async fn consume(&self, request: &ConsumeRequest) -> Result<ConsumeOutcome, Error> {
        self.retry
            .retry(|| self.attempt("consume", self.store.consume(request)))
            .await
    }

    pub async fn snapshot(
        &self,
        principal_id: &str,
        counters: &[CounterRef],
        now: DateTime<Utc>,
    ) -> Result<UsageSnapshot, Error> {
        self.retry
            .retry(|| self.attempt("snapshot", self.store.snapshot(principal_id, counters, now)))
            .await
    }

    async fn attempt<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        match timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::new(ErrorDetails::StoreTimeout {
                operation: operation.to_string(),
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            })),
        }
    }
}
