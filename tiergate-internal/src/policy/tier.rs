use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Consumer subscription tier.
///
/// Variant order is capability order, so the derived `Ord` gives `Free < Pro < Elite`.
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
pub enum Tier {
    Free,
    Pro,
    Elite,
}

impl Tier {
    /// The most restrictive tier. Anything we cannot classify lands here.
    pub const LOWEST: Tier = Tier::Free;

    /// Parses a tier string handed to us by the authentication collaborator.
    ///
    /// Unknown or malformed values are never an error: they are logged and treated as
    /// `Tier::LOWEST`, so a bad claim can only ever reduce access.
    pub fn parse_lenient(raw: &str) -> Tier {
        match raw.trim().to_ascii_lowercase().parse::<Tier>() {
            Ok(tier) => tier,
            Err(_) => {
                tracing::warn!(
                    tier = raw,
                    "Unrecognized tier; treating principal as `{}`",
                    Tier::LOWEST
                );
                Tier::LOWEST
            }
        }
    }
}

/// How much of a feature a tier gets.
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AccessLevel {
    Full,
    Limited,
    Preview,
    None,
}

/// A numeric cap on a metered dimension.
///
/// On the wire and in catalog files this is an integer where `-1` means `Unlimited`.
/// `Unlimited` is never compared against a count and never charges a counter.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Limit {
    Unlimited,
    Count(u64),
}

impl Limit {
    const UNLIMITED_SENTINEL: i64 = -1;

    pub fn is_unlimited(self) -> bool {
        matches!(self, Limit::Unlimited)
    }

    pub fn count(self) -> Option<u64> {
        match self {
            Limit::Unlimited => None,
            Limit::Count(count) => Some(count),
        }
    }

    pub fn from_raw(raw: i64) -> Result<Limit, String> {
        match raw {
            Self::UNLIMITED_SENTINEL => Ok(Limit::Unlimited),
            n if n >= 0 => Ok(Limit::Count(n.unsigned_abs())),
            n => Err(format!(
                "limit must be a non-negative count or -1 for unlimited, got {n}"
            )),
        }
    }

    pub fn to_raw(self) -> i64 {
        match self {
            Limit::Unlimited => Self::UNLIMITED_SENTINEL,
            Limit::Count(count) => i64::try_from(count).unwrap_or(i64::MAX),
        }
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Limit::Unlimited => write!(f, "unlimited"),
            Limit::Count(count) => write!(f, "{count}"),
        }
    }
}

impl Serialize for Limit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.to_raw())
    }
}

impl<'de> Deserialize<'de> for Limit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = i64::deserialize(deserializer)?;
        Limit::from_raw(raw).map_err(D::Error::custom)
    }
}
