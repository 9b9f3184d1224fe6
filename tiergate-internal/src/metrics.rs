use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for enforcement decisions, shared by the quota enforcer and the B2B rate limiter.
#[derive(Debug, Default)]
pub struct EnforcementMetrics {
    pub allowed: AtomicU64,
    pub denied: AtomicU64,
    pub unmetered: AtomicU64,
    pub no_access: AtomicU64,
    pub key_rejected: AtomicU64,
    pub store_failures: AtomicU64,
    pub fail_open_allows: AtomicU64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub allowed: u64,
    pub denied: u64,
    pub unmetered: u64,
    pub no_access: u64,
    pub key_rejected: u64,
    pub store_failures: u64,
    pub fail_open_allows: u64,
}

impl EnforcementMetrics {
    pub fn record_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_denied(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unmetered(&self) {
        self.unmetered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_no_access(&self) {
        self.no_access.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_key_rejected(&self) {
        self.key_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fail_open_allow(&self) {
        self.fail_open_allows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            unmetered: self.unmetered.load(Ordering::Relaxed),
            no_access: self.no_access.load(Ordering::Relaxed),
            key_rejected: self.key_rejected.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            fail_open_allows: self.fail_open_allows.load(Ordering::Relaxed),
        }
    }
}
