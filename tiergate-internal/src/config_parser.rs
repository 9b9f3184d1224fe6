use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strum::Display;

use crate::error::{Error, ErrorDetails};
use crate::policy::B2bTier;
use crate::rate_limit::{ApiKeyRecord, KeyStatus};
use crate::retries::RetryConfig;
use crate::usage_store::FailPolicy;

/// Gateway configuration, read from `--config-file`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub enforcement: EnforcementConfig,
    #[serde(default)]
    pub b2b: B2bConfig,
    #[serde(default)]
    pub policies: PoliciesConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    pub bind_address: Option<SocketAddr>,
    #[serde(default)]
    pub debug: bool,
    /// Required in `x-tiergate-internal-token` on `/internal` routes when set
    pub internal_token: Option<SecretString>,
}

impl GatewayConfig {
    pub fn bind_address(&self) -> SocketAddr {
        self.bind_address
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)))
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(rename = "type", default)]
    pub backend: StoreBackend,
    /// Overridden by `TIERGATE_REDIS_URL` when set
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Upper bound on a single store call, retries not included
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_key_prefix() -> String {
    "tg".to_string()
}

fn default_store_timeout_ms() -> u64 {
    50
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnforcementConfig {
    /// Features allowed through while the store is down. Everything else fails closed.
    #[serde(default)]
    pub fail_open_features: HashSet<String>,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum KeyDirectoryKind {
    /// `[[b2b.keys]]` from this file
    #[default]
    Static,
    /// Records provisioned into Redis, using the store's connection settings
    Redis,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct B2bConfig {
    #[serde(default)]
    pub fail_policy: FailPolicy,
    /// `0` disables the key cache
    #[serde(default = "default_key_cache_ttl_ms")]
    pub key_cache_ttl_ms: u64,
    #[serde(default)]
    pub key_directory: KeyDirectoryKind,
    #[serde(default)]
    pub keys: Vec<B2bKeyConfig>,
}

impl Default for B2bConfig {
    fn default() -> Self {
        Self {
            fail_policy: FailPolicy::default(),
            key_cache_ttl_ms: default_key_cache_ttl_ms(),
            key_directory: KeyDirectoryKind::default(),
            keys: Vec::new(),
        }
    }
}

fn default_key_cache_ttl_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct B2bKeyConfig {
    pub key: SecretString,
    pub tier: B2bTier,
    #[serde(default = "default_key_status")]
    pub status: KeyStatus,
    #[serde(default)]
    pub label: Option<String>,
}

fn default_key_status() -> KeyStatus {
    KeyStatus::Active
}

impl B2bKeyConfig {
    pub fn record(&self) -> ApiKeyRecord {
        ApiKeyRecord::new(self.tier, self.status, self.label.as_deref())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoliciesConfig {
    /// Catalog file; the embedded default catalog is used when unset
    pub path: Option<PathBuf>,
}

/// Deserialize a TOML table into `Config`
impl TryFrom<toml::Table> for Config {
    type Error = Error;

    fn try_from(table: toml::Table) -> Result<Self, Self::Error> {
        match serde_path_to_error::deserialize(table) {
            Ok(config) => Ok(config),
            Err(e) => {
                let path = e.path().clone();
                Err(Error::new(ErrorDetails::Config {
                    // Extract the underlying message from the toml error, as
                    // the path-tracking from the toml crate will be incorrect
                    message: format!("{}: {}", path, e.into_inner().message()),
                }))
            }
        }
    }
}

impl Config {
    pub async fn load_from_path(path: &Path) -> Result<Config, Error> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file `{}`: {e}", path.display()),
            })
        })?;
        let table: toml::Table = contents.parse().map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config file `{}`: {e}", path.display()),
            })
        })?;
        let mut config = Config::try_from(table)?;

        // A relative catalog path is relative to the config file, not the working directory
        if let (Some(policies_path), Some(base)) = (&config.policies.path, path.parent()) {
            if policies_path.is_relative() {
                config.policies.path = Some(base.join(policies_path));
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        let invalid = |message: String| Err(Error::new(ErrorDetails::Config { message }));

        if self.store.timeout_ms == 0 {
            return invalid("`store.timeout_ms` must be greater than zero".to_string());
        }
        if self
            .gateway
            .internal_token
            .as_ref()
            .is_some_and(|token| token.expose_secret().trim().is_empty())
        {
            return invalid("`gateway.internal_token` must not be empty".to_string());
        }
        if self.store.key_prefix.is_empty() {
            return invalid("`store.key_prefix` must not be empty".to_string());
        }
        if self.b2b.key_directory == KeyDirectoryKind::Redis && !self.b2b.keys.is_empty() {
            return invalid(
                "`b2b.keys` cannot be used with `b2b.key_directory = \"redis\"`".to_string(),
            );
        }

        let mut seen = HashSet::new();
        for (index, key) in self.b2b.keys.iter().enumerate() {
            let raw = key.key.expose_secret();
            if raw.trim().is_empty() {
                return invalid(format!("`b2b.keys[{index}].key` must not be empty"));
            }
            if !seen.insert(raw) {
                return invalid(format!("`b2b.keys[{index}].key` is declared more than once"));
            }
        }

        Ok(())
    }
}
