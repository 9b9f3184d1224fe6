use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;

use crate::error::{Error, ErrorDetails};
use crate::metrics::EnforcementMetrics;
use crate::period::Window;
use crate::policy::{resolve, AccessLevel, FeatureAccessEntry, Limit, PolicyHandle, Tier};
use crate::usage_store::{ConsumeRequest, CounterRef, FailPolicy, StoreGuard, WindowCharge};


/// The entity being gated, as vouched for by the authentication collaborator.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Principal {
    pub id: String,
    pub tier: Tier,
}

impl Principal {
    pub fn new(id: impl Into<String>, tier: Tier) -> Self {
        Self {
            id: id.into(),
            tier,
        }
    }

    /// Builds a principal from an unvalidated tier claim; see `Tier::parse_lenient`.
    pub fn from_claims(id: impl Into<String>, raw_tier: &str) -> Self {
        Self::new(id, Tier::parse_lenient(raw_tier))
    }
}

/// Why a decision came out the way it did.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DecisionBasis {
    /// Checked against a counter in the store
    Counted,
    /// Allowed without touching the store
    Unmetered,
    /// The tier has no access to the feature
    NoAccess,
    /// The store failed and the fail-open policy allowed the request
    StoreFailOpen,
    /// The store failed and the fail-closed policy denied the request
    StoreFailClosed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Remaining {
    Unbounded,
    Count(u64),
}

impl Remaining {
    /// `-1` stands for unbounded, matching the catalog's limit sentinel.
    pub fn to_raw(self) -> i64 {
        match self {
            Remaining::Unbounded => -1,
            Remaining::Count(count) => i64::try_from(count).unwrap_or(i64::MAX),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct UsageCheckResult {
    pub feature_id: String,
    pub allowed: bool,
    pub remaining: Remaining,
    pub reset_in: Option<Duration>,
    pub reset_at: Option<DateTime<Utc>>,
    pub limit: Option<Limit>,
    pub access: AccessLevel,
    pub blurred: bool,
    pub basis: DecisionBasis,
}

impl UsageCheckResult {
    fn new(entry: &FeatureAccessEntry, basis: DecisionBasis) -> Self {
        Self {
            feature_id: entry.feature_id.clone(),
            allowed: false,
            remaining: Remaining::Count(0),
            reset_in: None,
            reset_at: None,
            limit: entry.limit,
            access: entry.access,
            blurred: entry.blurred,
            basis,
        }
    }

    fn no_access(entry: &FeatureAccessEntry) -> Self {
        Self::new(entry, DecisionBasis::NoAccess)
    }

    fn unmetered(entry: &FeatureAccessEntry) -> Self {
        Self {
            allowed: true,
            remaining: Remaining::Unbounded,
            ..Self::new(entry, DecisionBasis::Unmetered)
        }
    }

    fn counted(
        entry: &FeatureAccessEntry,
        allowed: bool,
        remaining: u64,
        window: &Window,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            allowed,
            remaining: Remaining::Count(remaining),
            reset_in: Some(window.reset_in(now)),
            reset_at: Some(window.end),
            ..Self::new(entry, DecisionBasis::Counted)
        }
    }
}

/// How a resolved entry is enforced.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Enforcement {
    Deny,
    Unmetered,
    Metered { limit: u64 },
}

impl Enforcement {
    fn for_entry(entry: &FeatureAccessEntry) -> Self {
        match (entry.access, entry.limit) {
            (AccessLevel::None, _) => Enforcement::Deny,
            (_, Some(Limit::Unlimited)) => Enforcement::Unmetered,
            (_, Some(Limit::Count(limit))) => Enforcement::Metered { limit },
            (AccessLevel::Full | AccessLevel::Preview, None) => Enforcement::Unmetered,
            // Rejected at catalog load; deny rather than guess
            (AccessLevel::Limited, None) => Enforcement::Deny,
        }
    }
}

/// Consumer-tier gate: resolves a feature for the principal's tier and, for metered
/// features, atomically charges the principal's counter for the active window.
pub struct QuotaEnforcer {
    policies: PolicyHandle,
    store: StoreGuard,
    fail_open_features: HashSet<String>,
    metrics: Arc<EnforcementMetrics>,
}

impl QuotaEnforcer {
    pub fn new(
        policies: PolicyHandle,
        store: StoreGuard,
        fail_open_features: HashSet<String>,
        metrics: Arc<EnforcementMetrics>,
    ) -> Self {
        Self {
            policies,
            store,
            fail_open_features,
            metrics,
        }
    }

    pub fn fail_policy(&self, feature_id: &str) -> FailPolicy {
        if self.fail_open_features.contains(feature_id) {
            FailPolicy::Open
        } else {
            FailPolicy::Closed
        }
    }

    fn resolve(&self, principal: &Principal, feature_id: &str) -> FeatureAccessEntry {
        let catalog = self.policies.load();
        if !catalog.is_declared(feature_id) {
            tracing::debug!(
                feature_id,
                tier = %principal.tier,
                "Unknown feature; resolving to no access"
            );
        }
        resolve(&catalog, principal.tier, feature_id)
    }

    /// Charges `cost` units of `feature_id` to `principal` if the active window has room.
    ///
    /// Quota exhaustion is a normal `allowed = false` result. A store failure is resolved
    /// through the feature's fail policy rather than returned, so the only error is an
    /// invalid `cost`.
    pub async fn check_and_consume(
        &self,
        principal: &Principal,
        feature_id: &str,
        cost: u64,
        now: DateTime<Utc>,
    ) -> Result<UsageCheckResult, Error> {
        if cost == 0 {
            return Err(Error::new(ErrorDetails::InvalidRequest {
                message: "cost must be at least 1".to_string(),
            }));
        }

        let entry = self.resolve(principal, feature_id);
        let limit = match Enforcement::for_entry(&entry) {
            Enforcement::Deny => {
                self.metrics.record_no_access();
                return Ok(UsageCheckResult::no_access(&entry));
            }
            Enforcement::Unmetered => {
                self.metrics.record_unmetered();
                return Ok(UsageCheckResult::unmetered(&entry));
            }
            Enforcement::Metered { limit } => limit,
        };

        let window = entry.period().window(now);
        let request = ConsumeRequest::new(
            principal.id.as_str(),
            vec![WindowCharge {
                counter: CounterRef::new(&window, feature_id),
                limit,
            }],
            cost,
            now,
        );

        let outcome = match self.store.consume(&request).await {
            Ok(outcome) => outcome,
            Err(e) => return Ok(self.store_failed(principal, &entry, &window, now, &e)),
        };
        let before = outcome.counts_before.first().copied().unwrap_or(0);

        if outcome.applied {
            self.metrics.record_allowed();
            let remaining = limit.saturating_sub(before.saturating_add(cost));
            Ok(UsageCheckResult::counted(&entry, true, remaining, &window, now))
        } else {
            self.metrics.record_denied();
            tracing::debug!(
                principal_id = %principal.id,
                feature_id,
                period_key = %window.key,
                count = before,
                limit,
                "Quota exceeded"
            );
            let remaining = limit.saturating_sub(before);
            Ok(UsageCheckResult::counted(&entry, false, remaining, &window, now))
        }
    }

    /// Reports whether a single unit of `feature_id` would currently be allowed, without
    /// charging anything. Store failures are returned as errors.
    pub async fn usage_status(
        &self,
        principal: &Principal,
        feature_id: &str,
        now: DateTime<Utc>,
    ) -> Result<UsageCheckResult, Error> {
        let entry = self.resolve(principal, feature_id);
        let limit = match Enforcement::for_entry(&entry) {
            Enforcement::Deny => return Ok(UsageCheckResult::no_access(&entry)),
            Enforcement::Unmetered => return Ok(UsageCheckResult::unmetered(&entry)),
            Enforcement::Metered { limit } => limit,
        };

        let window = entry.period().window(now);
        let snapshot = self
            .store
            .snapshot(&principal.id, &[CounterRef::new(&window, feature_id)], now)
            .await?;
        let count = snapshot.counts.first().copied().unwrap_or(0);
        Ok(UsageCheckResult::counted(
            &entry,
            count < limit,
            limit.saturating_sub(count),
            &window,
            now,
        ))
    }

    fn store_failed(
        &self,
        principal: &Principal,
        entry: &FeatureAccessEntry,
        window: &Window,
        now: DateTime<Utc>,
        error: &Error,
    ) -> UsageCheckResult {
        self.metrics.record_store_failure();
        let policy = self.fail_policy(&entry.feature_id);
        tracing::error!(
            principal_id = %principal.id,
            feature_id = %entry.feature_id,
            fail_policy = %policy,
            "Usage store unavailable after retries: {error}"
        );
        let basis = match policy {
            FailPolicy::Open => {
                self.metrics.record_fail_open_allow();
                DecisionBasis::StoreFailOpen
            }
            FailPolicy::Closed => DecisionBasis::StoreFailClosed,
        };
        UsageCheckResult {
            allowed: policy == FailPolicy::Open,
            remaining: Remaining::Count(0),
            reset_in: Some(window.reset_in(now)),
            reset_at: Some(window.end),
            ..UsageCheckResult::new(entry, basis)
        }
    }
}
