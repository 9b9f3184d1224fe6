use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use strum::IntoEnumIterator;

use crate::error::{Error, ErrorDetails};
use crate::period::Period;
use crate::policy::b2b::{B2bLimitTable, UninitializedB2bLimitTable};
use crate::policy::tier::{AccessLevel, Limit, Tier};

const DEFAULT_CATALOG: &str = include_str!("../../policies/default.toml");

/// One tier's entitlement for one feature.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureAccessEntry {
    pub feature_id: String,
    pub access: AccessLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<Limit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_ms: Option<u64>,
    /// UI hint only. Carried through to callers, never acted on here.
    pub blurred: bool,
}

impl FeatureAccessEntry {
    /// The entry returned for anything the catalog does not grant.
    pub fn none(feature_id: &str) -> Self {
        Self {
            feature_id: feature_id.to_string(),
            access: AccessLevel::None,
            limit: None,
            period_ms: None,
            blurred: false,
        }
    }

    pub fn period(&self) -> Period {
        Period::from_period_ms(self.period_ms)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Price {
    pub monthly: f64,
    pub yearly: f64,
    pub currency: String,
}

/// Named numeric caps for a tier, e.g. `comparisons_per_day = 3` or `watchlist_size = -1`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct UsageLimits(BTreeMap<String, Limit>);

impl UsageLimits {
    pub fn get(&self, dimension: &str) -> Option<Limit> {
        self.0.get(dimension).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Limit)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TierPolicy {
    pub id: Tier,
    pub name: String,
    pub price: Option<Price>,
    pub limits: UsageLimits,
    features: Vec<FeatureAccessEntry>,
    index: HashMap<String, usize>,
}

impl TierPolicy {
    pub fn entry(&self, feature_id: &str) -> Option<&FeatureAccessEntry> {
        self.index.get(feature_id).and_then(|i| self.features.get(*i))
    }

    /// Entries in the order the catalog declares them.
    pub fn features(&self) -> &[FeatureAccessEntry] {
        &self.features
    }
}

/// Validated, immutable tier/feature table.
#[derive(Clone, Debug, PartialEq)]
pub struct PolicyCatalog {
    tiers: BTreeMap<Tier, TierPolicy>,
    declared: BTreeSet<String>,
    b2b: B2bLimitTable,
}

impl PolicyCatalog {
    pub fn tier_policy(&self, tier: Tier) -> Option<&TierPolicy> {
        self.tiers.get(&tier)
    }

    /// Whether any tier mentions `feature_id`.
    pub fn is_declared(&self, feature_id: &str) -> bool {
        self.declared.contains(feature_id)
    }

    pub fn declared_features(&self) -> impl Iterator<Item = &str> {
        self.declared.iter().map(String::as_str)
    }

    pub fn b2b_limits(&self) -> &B2bLimitTable {
        &self.b2b
    }

    /// The catalog compiled into the binary, used when no `[policies] path` is configured.
    pub fn embedded_default() -> Result<Self, Error> {
        Self::from_toml_str(DEFAULT_CATALOG)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, Error> {
        let table: toml::Table = contents.parse().map_err(|e| {
            Error::new(ErrorDetails::PolicyCatalog {
                message: format!("Failed to parse catalog TOML: {e}"),
            })
        })?;
        UninitializedPolicyCatalog::try_from(table)?.load()
    }

    pub async fn from_path(path: &Path) -> Result<Self, Error> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::new(ErrorDetails::PolicyCatalog {
                message: format!("Failed to read catalog file `{}`: {e}", path.display()),
            })
        })?;
        Self::from_toml_str(&contents)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UninitializedPolicyCatalog {
    tiers: BTreeMap<String, UninitializedTierPolicy>,
    #[serde(default)]
    b2b: UninitializedB2bLimitTable,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UninitializedTierPolicy {
    name: String,
    #[serde(default)]
    price: Option<Price>,
    #[serde(default)]
    limits: BTreeMap<String, Limit>,
    #[serde(default)]
    features: Vec<UninitializedFeatureAccessEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UninitializedFeatureAccessEntry {
    feature_id: String,
    access: AccessLevel,
    #[serde(default)]
    limit: Option<Limit>,
    /// Name of an entry in the tier's `limits` table to take the cap from.
    #[serde(default)]
    usage_limit: Option<String>,
    #[serde(default)]
    period_ms: Option<u64>,
    #[serde(default)]
    blurred: bool,
}

/// Deserialize a TOML table into `UninitializedPolicyCatalog`
impl TryFrom<toml::Table> for UninitializedPolicyCatalog {
    type Error = Error;

    fn try_from(table: toml::Table) -> Result<Self, Self::Error> {
        match serde_path_to_error::deserialize(table) {
            Ok(catalog) => Ok(catalog),
            Err(e) => {
                let path = e.path().clone();
                Err(Error::new(ErrorDetails::PolicyCatalog {
                    // Extract the underlying message from the toml error, as
                    // the path-tracking from the toml crate will be incorrect
                    message: format!("{}: {}", path, e.into_inner().message()),
                }))
            }
        }
    }
}

impl UninitializedPolicyCatalog {
    pub fn load(self) -> Result<PolicyCatalog, Error> {
        let invalid = |message: String| Error::new(ErrorDetails::PolicyCatalog { message });

        let mut tiers = BTreeMap::new();
        let mut declared = BTreeSet::new();
        for (name, raw) in self.tiers {
            let tier: Tier = name
                .parse()
                .map_err(|_| invalid(format!("`tiers.{name}` is not a known tier")))?;
            let policy = raw.load(tier).map_err(invalid)?;
            declared.extend(policy.features.iter().map(|f| f.feature_id.clone()));
            tiers.insert(tier, policy);
        }

        if let Some(missing) = Tier::iter().find(|tier| !tiers.contains_key(tier)) {
            return Err(invalid(format!("tier `{missing}` is missing from the catalog")));
        }

        let b2b = self.b2b.load().map_err(invalid)?;

        Ok(PolicyCatalog {
            tiers,
            declared,
            b2b,
        })
    }
}

impl UninitializedTierPolicy {
    fn load(self, tier: Tier) -> Result<TierPolicy, String> {
        let limits = UsageLimits(self.limits);
        let mut features = Vec::with_capacity(self.features.len());
        let mut index = HashMap::with_capacity(self.features.len());

        for raw in self.features {
            let location = format!("tiers.{tier}.features.{}", raw.feature_id);
            if raw.feature_id.trim().is_empty() {
                return Err(format!("`tiers.{tier}.features` has an empty `feature_id`"));
            }
            if index.contains_key(&raw.feature_id) {
                return Err(format!("`{location}` is declared more than once"));
            }

            let limit = match (raw.limit, raw.usage_limit) {
                (Some(_), Some(_)) => {
                    return Err(format!(
                        "`{location}` sets both `limit` and `usage_limit`; pick one"
                    ))
                }
                (Some(limit), None) => Some(limit),
                (None, Some(dimension)) => Some(limits.get(&dimension).ok_or_else(|| {
                    format!("`{location}.usage_limit` refers to unknown limit `{dimension}`")
                })?),
                (None, None) => None,
            };

            if raw.period_ms == Some(0) {
                return Err(format!("`{location}.period_ms` must be greater than zero"));
            }
            if raw.access == AccessLevel::Limited && limit.is_none() {
                return Err(format!("`{location}` has `access = \"limited\"` but no limit"));
            }
            if raw.access == AccessLevel::None && limit.is_some() {
                tracing::warn!("`{location}` has `access = \"none\"`; its limit is ignored");
            }

            index.insert(raw.feature_id.clone(), features.len());
            features.push(FeatureAccessEntry {
                feature_id: raw.feature_id,
                access: raw.access,
                limit,
                period_ms: raw.period_ms,
                blurred: raw.blurred,
            });
        }

        Ok(TierPolicy {
            id: tier,
            name: self.name,
            price: self.price,
            limits,
            features,
            index,
        })
    }
}
