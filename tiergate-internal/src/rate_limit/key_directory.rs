use async_trait::async_trait;
use moka::future::Cache;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;

use crate::error::{Error, ErrorDetails};
use crate::policy::B2bTier;

#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Suspended,
    Revoked,
}

/// What the key-management collaborator knows about a key.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ApiKeyRecord {
    pub tier: B2bTier,
    pub status: KeyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl ApiKeyRecord {
    pub fn new(tier: B2bTier, status: KeyStatus, label: Option<&str>) -> Self {
        Self {
            tier,
            status,
            label: label.map(str::to_string),
        }
    }
}

/// Hash an API key with SHA256 and a `tiergate-` prefix.
///
/// Keys are only ever stored, logged and counted under this fingerprint.
pub fn fingerprint_api_key(api_key: &SecretString) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"tiergate-");
    hasher.update(api_key.expose_secret().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[async_trait]
pub trait KeyDirectory: Send + Sync {
    /// `Ok(None)` means the key is unknown; `Err` means we could not find out.
    async fn lookup(&self, fingerprint: &str) -> Result<Option<ApiKeyRecord>, Error>;

    async fn health(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Keys declared in the gateway config.
#[derive(Debug, Default)]
pub struct StaticKeyDirectory {
    records: HashMap<String, ApiKeyRecord>,
}

impl StaticKeyDirectory {
    pub fn from_records(records: impl IntoIterator<Item = (SecretString, ApiKeyRecord)>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|(key, record)| (fingerprint_api_key(&key), record))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl KeyDirectory for StaticKeyDirectory {
    async fn lookup(&self, fingerprint: &str) -> Result<Option<ApiKeyRecord>, Error> {
        Ok(self.records.get(fingerprint).cloned())
    }
}

/// Reads `{prefix}:b2b_key:{fingerprint}` JSON records written by the provisioning flow.
pub struct RedisKeyDirectory {
    connection: MultiplexedConnection,
    key_prefix: String,
}

impl RedisKeyDirectory {
    pub async fn new(url: &str, key_prefix: String) -> Result<Self, Error> {
        let client = redis::Client::open(url).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to create Redis client: {e}"),
            })
        })?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::KeyDirectoryUnavailable {
                    message: format!("Failed to get Redis connection: {e}"),
                })
            })?;
        Ok(Self {
            connection,
            key_prefix,
        })
    }

    fn record_key(&self, fingerprint: &str) -> String {
        let prefix = &self.key_prefix;
        format!("{prefix}:b2b_key:{fingerprint}")
    }
}

#[async_trait]
impl KeyDirectory for RedisKeyDirectory {
    async fn lookup(&self, fingerprint: &str) -> Result<Option<ApiKeyRecord>, Error> {
        let mut connection = self.connection.clone();
        let raw: Option<String> = connection
            .get(self.record_key(fingerprint))
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::KeyDirectoryUnavailable {
                    message: format!("Redis `GET` failed: {e}"),
                })
            })?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        serde_json::from_str(&raw).map(Some).map_err(|e| {
            Error::new(ErrorDetails::Serialization {
                message: format!("Malformed API key record for `{fingerprint}`: {e}"),
            })
        })
    }

    async fn health(&self) -> Result<(), Error> {
        let mut connection = self.connection.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut connection)
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::KeyDirectoryUnavailable {
                    message: format!("Redis `PING` failed: {e}"),
                })
            })?;
        Ok(())
    }
}

/// Caches lookups from an inner directory for `ttl`, unknown keys included, so a flood of
/// bad keys does not reach the backing directory. Errors are never cached.
pub struct CachedKeyDirectory {
    inner: Arc<dyn KeyDirectory>,
    cache: Cache<String, Option<ApiKeyRecord>>,
}

impl CachedKeyDirectory {
    pub fn new(inner: Arc<dyn KeyDirectory>, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(ttl)
            .build();
        Self { inner, cache }
    }
}

#[async_trait]
impl KeyDirectory for CachedKeyDirectory {
    async fn lookup(&self, fingerprint: &str) -> Result<Option<ApiKeyRecord>, Error> {
        if let Some(cached) = self.cache.get(fingerprint).await {
            return Ok(cached);
        }
        let record = self.inner.lookup(fingerprint).await?;
        self.cache
            .insert(fingerprint.to_string(), record.clone())
            .await;
        Ok(record)
    }

    async fn health(&self) -> Result<(), Error> {
        self.inner.health().await
    }
}
