use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::Script;
use uuid::Uuid;

use crate::error::{Error, ErrorDetails};
use crate::usage_store::{
    ConsumeOutcome, ConsumeRequest, CounterRef, UsageSnapshot, UsageStore,
    LAST_CONSUMED_RETENTION_MS, REPLAY_TTL_MS,
};

/// Keep dead windows around briefly so a late reader still gets a consistent answer.
const EXPIRY_GRACE_MS: i64 = 60_000;
const LAST_CONSUMED_FIELD: &str = "last_consumed_ms";

/// Checks every window, then increments all of them or none. The reply is stored under
/// the request's replay key, and a resubmitted request gets that stored reply back.
///
/// KEYS: one usage hash per charged window, the principal's meta hash, then the replay key.
/// ARGV: cost, now_ms, meta_ttl_ms, replay_ttl_ms, then `(field, limit, expire_at_ms)` per
/// window.
/// Returns `{applied, count_before_1, ..., count_before_n}`.
const CONSUME_SCRIPT: &str = r#"
local replay = redis.call('GET', KEYS[#KEYS])
if replay then
    return cjson.decode(replay)
end

local cost = tonumber(ARGV[1])
local windows = #KEYS - 2
local result = {1}

for i = 1, windows do
    local base = 4 + (i - 1) * 3
    local current = tonumber(redis.call('HGET', KEYS[i], ARGV[base + 1]) or '0')
    local limit = tonumber(ARGV[base + 2])
    result[i + 1] = current
    if current + cost > limit then
        result[1] = 0
    end
end

if result[1] == 1 then
    for i = 1, windows do
        local base = 4 + (i - 1) * 3
        redis.call('HINCRBY', KEYS[i], ARGV[base + 1], cost)
        redis.call('PEXPIREAT', KEYS[i], ARGV[base + 3])
    end
    redis.call('HSET', KEYS[windows + 1], 'last_consumed_ms', ARGV[2])
    redis.call('PEXPIRE', KEYS[windows + 1], ARGV[3])
end

redis.call('SET', KEYS[#KEYS], cjson.encode(result), 'PX', ARGV[4])
return result
"#;

/// Shared store for multi-node deployments.
///
/// All keys for a principal share the `{principal}` hash tag, so the script only ever
/// touches a single cluster slot.
pub struct RedisUsageStore {
    connection: MultiplexedConnection,
    key_prefix: String,
    consume_script: Script,
}

impl RedisUsageStore {
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
                Error::new(ErrorDetails::StoreUnavailable {
                    message: format!("Failed to get Redis connection: {e}"),
                })
            })?;
        tracing::info!(key_prefix = %key_prefix, "Connected to Redis usage store");
        Ok(Self {
            connection,
            key_prefix,
            consume_script: Script::new(CONSUME_SCRIPT),
        })
    }

    fn usage_key(&self, principal_id: &str, period_key: &str) -> String {
        let prefix = &self.key_prefix;
        format!("{prefix}:usage:{{{principal_id}}}:{period_key}")
    }

    fn meta_key(&self, principal_id: &str) -> String {
        let prefix = &self.key_prefix;
        format!("{prefix}:meta:{{{principal_id}}}")
    }

    fn replay_key(&self, principal_id: &str, request_id: &Uuid) -> String {
        let prefix = &self.key_prefix;
        format!("{prefix}:replay:{{{principal_id}}}:{request_id}")
    }
}

// Timeouts are imposed by `StoreGuard`, so every Redis error surfaces as unavailability
fn store_error(operation: &str, e: redis::RedisError) -> Error {
    Error::new(ErrorDetails::StoreUnavailable {
        message: format!("Redis `{operation}` failed: {e}"),
    })
}

fn to_count(raw: Option<i64>) -> u64 {
    raw.and_then(|n| u64::try_from(n).ok()).unwrap_or(0)
}

#[async_trait]
impl UsageStore for RedisUsageStore {
    async fn consume(&self, request: &ConsumeRequest) -> Result<ConsumeOutcome, Error> {
        let mut invocation = self.consume_script.prepare_invoke();
        for charge in &request.charges {
            invocation.key(self.usage_key(&request.principal_id, &charge.counter.period_key));
        }
        invocation.key(self.meta_key(&request.principal_id));
        invocation.key(self.replay_key(&request.principal_id, &request.request_id));
        invocation
            .arg(request.cost)
            .arg(request.now.timestamp_millis())
            .arg(LAST_CONSUMED_RETENTION_MS)
            .arg(REPLAY_TTL_MS);
        for charge in &request.charges {
            invocation
                .arg(&charge.counter.dimension)
                .arg(charge.limit)
                .arg(charge.counter.expires_at.timestamp_millis() + EXPIRY_GRACE_MS);
        }

        let mut connection = self.connection.clone();
        let reply: Vec<i64> = invocation
            .invoke_async(&mut connection)
            .await
            .map_err(|e| store_error("consume", e))?;

        let Some((applied, counts)) = reply.split_first() else {
            return Err(Error::new(ErrorDetails::InternalError {
                message: "Empty reply from usage consume script".to_string(),
            }));
        };
        if counts.len() != request.charges.len() {
            return Err(Error::new(ErrorDetails::InternalError {
                message: format!(
                    "Usage consume script returned {} counts for {} windows",
                    counts.len(),
                    request.charges.len()
                ),
            }));
        }

        Ok(ConsumeOutcome {
            applied: *applied == 1,
            counts_before: counts.iter().map(|c| to_count(Some(*c))).collect(),
        })
    }

    async fn snapshot(
        &self,
        principal_id: &str,
        counters: &[CounterRef],
        now: DateTime<Utc>,
    ) -> Result<UsageSnapshot, Error> {
        let mut pipe = redis::pipe();
        for counter in counters {
            pipe.hget(
                self.usage_key(principal_id, &counter.period_key),
                &counter.dimension,
            );
        }
        pipe.hget(self.meta_key(principal_id), LAST_CONSUMED_FIELD);

        let mut connection = self.connection.clone();
        let mut values: Vec<Option<i64>> = pipe
            .query_async(&mut connection)
            .await
            .map_err(|e| store_error("snapshot", e))?;

        let last_consumed_at = values
            .pop()
            .flatten()
            .and_then(DateTime::from_timestamp_millis);
        let counts = counters
            .iter()
            .zip(values)
            // Keys linger for a grace period after their window closes
            .map(|(counter, value)| {
                if counter.expires_at > now {
                    to_count(value)
                } else {
                    0
                }
            })
            .collect();

        Ok(UsageSnapshot {
            counts,
            last_consumed_at,
        })
    }

    async fn health(&self) -> Result<(), Error> {
        let mut connection = self.connection.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut connection)
            .await
            .map_err(|e| store_error("ping", e))?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
