use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Plan attached to a third-party API key.
#[derive(
    AsRefStr,
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum B2bTier {
    Starter,
    Growth,
    Enterprise,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct B2bRateLimits {
    pub requests_per_minute: u64,
    pub requests_per_day: u64,
}

/// Static B2B tier to rate-limit mapping.
#[derive(Clone, Debug, PartialEq)]
pub struct B2bLimitTable {
    starter: B2bRateLimits,
    growth: B2bRateLimits,
    enterprise: B2bRateLimits,
}

impl Default for B2bLimitTable {
    fn default() -> Self {
        Self {
            starter: B2bRateLimits {
                requests_per_minute: 30,
                requests_per_day: 1_000,
            },
            growth: B2bRateLimits {
                requests_per_minute: 120,
                requests_per_day: 10_000,
            },
            enterprise: B2bRateLimits {
                requests_per_minute: 600,
                requests_per_day: 100_000,
            },
        }
    }
}

impl B2bLimitTable {
    pub fn limits(&self, tier: B2bTier) -> B2bRateLimits {
        match tier {
            B2bTier::Starter => self.starter,
            B2bTier::Growth => self.growth,
            B2bTier::Enterprise => self.enterprise,
        }
    }
}

/// Optional `[b2b.<tier>]` overrides in a catalog file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UninitializedB2bLimitTable {
    starter: Option<UninitializedB2bRateLimits>,
    growth: Option<UninitializedB2bRateLimits>,
    enterprise: Option<UninitializedB2bRateLimits>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UninitializedB2bRateLimits {
    requests_per_minute: Option<u64>,
    requests_per_day: Option<u64>,
}

impl UninitializedB2bLimitTable {
    pub fn load(self) -> Result<B2bLimitTable, String> {
        let defaults = B2bLimitTable::default();
        Ok(B2bLimitTable {
            starter: merge(B2bTier::Starter, defaults.starter, self.starter)?,
            growth: merge(B2bTier::Growth, defaults.growth, self.growth)?,
            enterprise: merge(B2bTier::Enterprise, defaults.enterprise, self.enterprise)?,
        })
    }
}

fn merge(
    tier: B2bTier,
    default: B2bRateLimits,
    overrides: Option<UninitializedB2bRateLimits>,
) -> Result<B2bRateLimits, String> {
    let Some(overrides) = overrides else {
        return Ok(default);
    };
    let limits = B2bRateLimits {
        requests_per_minute: overrides
            .requests_per_minute
            .unwrap_or(default.requests_per_minute),
        requests_per_day: overrides
            .requests_per_day
            .unwrap_or(default.requests_per_day),
    };
    if limits.requests_per_minute == 0 || limits.requests_per_day == 0 {
        return Err(format!("`b2b.{tier}` limits must be greater than zero"));
    }
    if limits.requests_per_minute > limits.requests_per_day {
        return Err(format!(
            "`b2b.{tier}.requests_per_minute` ({}) exceeds `requests_per_day` ({})",
            limits.requests_per_minute, limits.requests_per_day
        ));
    }
    Ok(limits)
}
