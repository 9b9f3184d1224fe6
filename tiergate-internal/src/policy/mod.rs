pub mod b2b;
pub mod catalog;
pub mod handle;
pub mod resolver;
pub mod tier;

pub use b2b::{B2bLimitTable, B2bRateLimits, B2bTier};
pub use catalog::{FeatureAccessEntry, PolicyCatalog, Price, TierPolicy, UsageLimits};
pub use handle::PolicyHandle;
pub use resolver::{resolve, resolve_all};
pub use tier::{AccessLevel, Limit, Tier};
