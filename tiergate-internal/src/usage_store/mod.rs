use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Error;
use crate::period::Window;

pub mod guard;
pub mod memory;
pub mod redis_store;

pub use guard::{FailPolicy, StoreGuard};
pub use memory::MemoryUsageStore;
pub use redis_store::RedisUsageStore;

/// How long a store remembers the outcome of a `request_id`.
const REPLAY_TTL_MS: i64 = 60_000;
/// How long `last_consumed_at` outlives the principal's last charge.
const LAST_CONSUMED_RETENTION_MS: i64 = 2 * 86_400_000;

/// Addresses one counter: `(principal, period_key)` selects the usage record,
/// `dimension` the count inside it (a feature id, or `requests` for B2B keys).
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct CounterRef {
    pub period_key: String,
    pub dimension: String,
    /// Instant the window closes. The record is dead from then on, deleted or not.
    pub expires_at: DateTime<Utc>,
}

impl CounterRef {
    pub fn new(window: &Window, dimension: impl Into<String>) -> Self {
        Self {
            period_key: window.key.clone(),
            dimension: dimension.into(),
            expires_at: window.end,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct WindowCharge {
    pub counter: CounterRef,
    pub limit: u64,
}

/// A conditional increment across one or more windows.
///
/// Applied only if every charge fits (`count + cost <= limit`); otherwise nothing changes.
/// Resubmitting the same `request_id` returns the first outcome without charging again.
#[derive(Clone, Debug, PartialEq)]
pub struct ConsumeRequest {
    pub request_id: Uuid,
    pub principal_id: String,
    pub charges: Vec<WindowCharge>,
    pub cost: u64,
    pub now: DateTime<Utc>,
}

impl ConsumeRequest {
    pub fn new(
        principal_id: impl Into<String>,
        charges: Vec<WindowCharge>,
        cost: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id: Uuid::now_v7(),
            principal_id: principal_id.into(),
            charges,
            cost,
            now,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConsumeOutcome {
    pub applied: bool,
    /// Count of each charged window before this request, in `charges` order
    pub counts_before: Vec<u64>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UsageSnapshot {
    /// Current count of each requested counter, zero for expired or absent records
    pub counts: Vec<u64>,
    pub last_consumed_at: Option<DateTime<Utc>>,
}

/// Persistence backend for per-principal, per-period counters.
///
/// Implementations must make `consume` atomic per principal: two concurrent requests may
/// never both observe headroom that only one of them fits into. `consume` must also be
/// idempotent per `request_id` for at least `REPLAY_TTL_MS`, since `StoreGuard` resubmits
/// a request whose reply did not arrive in time.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn consume(&self, request: &ConsumeRequest) -> Result<ConsumeOutcome, Error>;

    async fn snapshot(
        &self,
        principal_id: &str,
        counters: &[CounterRef],
        now: DateTime<Utc>,
    ) -> Result<UsageSnapshot, Error>;

    async fn health(&self) -> Result<(), Error>;

    fn backend_name(&self) -> &'static str;
}
