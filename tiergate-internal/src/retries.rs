use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use std::{future::Future, time::Duration};

use crate::error::Error;

/*
 * Retry policy for usage store calls.
 * Only errors where `Error::is_retryable` holds (store timeouts and connection failures)
 * are retried; everything else is returned on the first attempt.
 *
 * The implementation is based on the backon crate.
 * Callers should go through `RetryConfig::retry` rather than using backon directly.
 */

#[derive(Debug, Deserialize, Copy, Clone, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_num_retries")]
    pub num_retries: usize,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl std::fmt::Display for RetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let json = serde_json::to_string_pretty(self).map_err(|_| std::fmt::Error)?;
        write!(f, "{json}")
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            num_retries: default_num_retries(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_num_retries() -> usize {
    2
}

// Enforcement sits on the request path, so backoff stays in the tens of milliseconds
fn default_max_delay_ms() -> u64 {
    40
}

impl RetryConfig {
    pub fn retry<R, F: Future<Output = Result<R, Error>>>(
        &self,
        func: impl FnMut() -> F,
    ) -> impl Future<Output = Result<R, Error>> {
        let backoff = self.get_backoff();
        func.retry(backoff).when(Error::is_retryable)
    }

    fn get_backoff(&self) -> backon::ExponentialBuilder {
        ExponentialBuilder::default()
            .with_jitter()
            .with_min_delay(Duration::from_millis(5))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_max_times(self.num_retries)
    }
}
