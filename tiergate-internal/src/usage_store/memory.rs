use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::Error;
use crate::usage_store::{
    ConsumeOutcome, ConsumeRequest, CounterRef, UsageSnapshot, UsageStore,
    LAST_CONSUMED_RETENTION_MS, REPLAY_TTL_MS,
};

/// Idle ledgers are swept at most this often.
const SWEEP_INTERVAL_MS: i64 = 60_000;

/// Counts for one `(principal, period_key)`.
#[derive(Debug)]
struct UsageRecord {
    expires_at: DateTime<Utc>,
    counts: HashMap<String, u64>,
}

#[derive(Debug)]
struct Replay {
    outcome: ConsumeOutcome,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PrincipalLedger {
    records: HashMap<String, UsageRecord>,
    replays: HashMap<Uuid, Replay>,
    last_consumed_at: Option<DateTime<Utc>>,
}

impl PrincipalLedger {
    fn prune(&mut self, now: DateTime<Utc>) {
        self.records.retain(|_, record| record.expires_at > now);
        self.replays.retain(|_, replay| replay.expires_at > now);
        if self.last_consumed_at.is_some_and(|at| {
            now - at >= TimeDelta::milliseconds(LAST_CONSUMED_RETENTION_MS)
        }) {
            self.last_consumed_at = None;
        }
    }

    /// Nothing left that a read could observe.
    fn is_idle(&self) -> bool {
        self.records.is_empty() && self.replays.is_empty() && self.last_consumed_at.is_none()
    }

    /// Reads treat a record whose window has closed as empty.
    fn count(&self, counter: &CounterRef, now: DateTime<Utc>) -> u64 {
        self.records
            .get(&counter.period_key)
            .filter(|record| record.expires_at > now)
            .and_then(|record| record.counts.get(&counter.dimension))
            .copied()
            .unwrap_or(0)
    }

    fn increment(&mut self, counter: &CounterRef, cost: u64) {
        let record = self
            .records
            .entry(counter.period_key.clone())
            .or_insert_with(|| UsageRecord {
                expires_at: counter.expires_at,
                counts: HashMap::new(),
            });
        let count = record.counts.entry(counter.dimension.clone()).or_insert(0);
        *count = count.saturating_add(cost);
    }

    fn apply(&mut self, request: &ConsumeRequest) -> ConsumeOutcome {
        if let Some(replay) = self.replays.get(&request.request_id) {
            return replay.outcome.clone();
        }

        let counts_before: Vec<u64> = request
            .charges
            .iter()
            .map(|charge| self.count(&charge.counter, request.now))
            .collect();
        let applied = request
            .charges
            .iter()
            .zip(&counts_before)
            .all(|(charge, before)| before.saturating_add(request.cost) <= charge.limit);

        if applied {
            for charge in &request.charges {
                self.increment(&charge.counter, request.cost);
            }
            self.last_consumed_at = Some(request.now);
        }

        let outcome = ConsumeOutcome {
            applied,
            counts_before,
        };
        self.replays.insert(
            request.request_id,
            Replay {
                outcome: outcome.clone(),
                expires_at: request.now + TimeDelta::milliseconds(REPLAY_TTL_MS),
            },
        );
        outcome
    }
}

/// In-process store for single-node deployments and tests.
///
/// Each principal has its own ledger behind its own lock, so principals never contend
/// with each other; requests for the same principal are serialized. Ledgers with nothing
/// left to read are dropped by a sweep that piggybacks on `consume`.
#[derive(Debug, Default)]
pub struct MemoryUsageStore {
    ledgers: DashMap<String, Arc<Mutex<PrincipalLedger>>>,
    last_sweep_ms: AtomicI64,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ledger(&self, principal_id: &str) -> Arc<Mutex<PrincipalLedger>> {
        // Clone the `Arc` out so the shard lock is released before we await the ledger lock
        self.ledgers
            .entry(principal_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    pub fn principal_count(&self) -> usize {
        self.ledgers.len()
    }

    fn maybe_sweep(&self, now: DateTime<Utc>) {
        let now_ms = now.timestamp_millis();
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if now_ms - last < SWEEP_INTERVAL_MS {
            return;
        }
        // Only one caller sweeps per interval
        if self
            .last_sweep_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.sweep_idle(now);
        }
    }

    /// Drops ledgers nobody holds and nothing can read any more.
    fn sweep_idle(&self, now: DateTime<Utc>) {
        let before = self.ledgers.len();
        // A caller that cloned the `Arc` out of the map holds a second reference, and cloning
        // needs the shard lock `retain` is holding, so a ledger in use is never dropped
        self.ledgers.retain(|_, ledger| {
            if Arc::strong_count(ledger) > 1 {
                return true;
            }
            match ledger.try_lock() {
                Ok(mut ledger) => {
                    ledger.prune(now);
                    !ledger.is_idle()
                }
                Err(_) => true,
            }
        });
        let dropped = before.saturating_sub(self.ledgers.len());
        if dropped > 0 {
            tracing::debug!(dropped, "Swept idle usage ledgers");
        }
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn consume(&self, request: &ConsumeRequest) -> Result<ConsumeOutcome, Error> {
        let outcome = {
            let ledger = self.ledger(&request.principal_id);
            let mut ledger = ledger.lock().await;
            ledger.prune(request.now);
            ledger.apply(request)
        };
        self.maybe_sweep(request.now);
        Ok(outcome)
    }

    async fn snapshot(
        &self,
        principal_id: &str,
        counters: &[CounterRef],
        now: DateTime<Utc>,
    ) -> Result<UsageSnapshot, Error> {
        let Some(ledger) = self
            .ledgers
            .get(principal_id)
            .map(|entry| entry.value().clone())
        else {
            return Ok(UsageSnapshot {
                counts: vec![0; counters.len()],
                last_consumed_at: None,
            });
        };
        let ledger = ledger.lock().await;
        Ok(UsageSnapshot {
            counts: counters.iter().map(|c| ledger.count(c, now)).collect(),
            last_consumed_at: ledger.last_consumed_at,
        })
    }

    async fn health(&self) -> Result<(), Error> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
