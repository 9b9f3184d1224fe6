use crate::policy::catalog::{FeatureAccessEntry, PolicyCatalog};
use crate::policy::tier::Tier;

/// Looks up what `tier` may do with `feature_id`.
///
/// Total and side-effect free: a feature the tier has no entry for (including one the
/// catalog has never heard of) resolves to `access = none`.
pub fn resolve(catalog: &PolicyCatalog, tier: Tier, feature_id: &str) -> FeatureAccessEntry {
    catalog
        .tier_policy(tier)
        .and_then(|policy| policy.entry(feature_id))
        .cloned()
        .unwrap_or_else(|| FeatureAccessEntry::none(feature_id))
}

/// Resolves every feature declared anywhere in the catalog, in feature-id order.
pub fn resolve_all(catalog: &PolicyCatalog, tier: Tier) -> Vec<FeatureAccessEntry> {
    catalog
        .declared_features()
        .map(|feature_id| resolve(catalog, tier, feature_id))
        .collect()
}
