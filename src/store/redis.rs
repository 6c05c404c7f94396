//! Redis-backed store.
//!
//! Each [`Transaction`] maps to one Lua script. Redis runs a script to
//! completion before serving any other command, which gives the isolation
//! the quota strategies rely on without `WATCH`/`MULTI` round-trips.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{RedisError, Script};
use tracing::{info, trace};

use super::transaction::Transaction;
use super::AtomicStore;
use crate::error::QuotaError;

/// INCR, then arm the TTL only on the first request of a window.
const INCREMENT_WINDOW_LUA: &str = r#"
local count = redis.call("INCR", KEYS[1])
if count == 1 then
    redis.call("EXPIRE", KEYS[1], tonumber(ARGV[1]))
end
return count
"#;

/// Prune, record, count, refresh TTL.
///
/// ARGV[2] arrives as an exclusive bound ("(<cutoff>") so entries scored
/// exactly at the cutoff survive.
const SLIDING_LOG_LUA: &str = r#"
redis.call("ZREMRANGEBYSCORE", KEYS[1], "-inf", ARGV[2])
redis.call("ZADD", KEYS[1], ARGV[1], ARGV[3])
local count = redis.call("ZCARD", KEYS[1])
redis.call("EXPIRE", KEYS[1], tonumber(ARGV[4]))
return count
"#;

/// Store that runs quota transactions on a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
    increment_window: Script,
    sliding_log: Script,
}

impl RedisStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`) and verify the
    /// server answers.
    pub async fn connect(url: &str) -> Result<Self, QuotaError> {
        let client = redis::Client::open(url)
            .map_err(|err| QuotaError::StoreUnavailable(format!("redis client: {err}")))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| QuotaError::StoreUnavailable(format!("redis connect: {err}")))?;

        let store = Self {
            manager,
            increment_window: Script::new(INCREMENT_WINDOW_LUA),
            sliding_log: Script::new(SLIDING_LOG_LUA),
        };
        store.ping().await?;

        info!(url = %url, "Connected to Redis");
        Ok(store)
    }
}

#[async_trait]
impl AtomicStore for RedisStore {
    async fn execute(&self, transaction: &Transaction) -> Result<i64, QuotaError> {
        let mut conn = self.manager.clone();

        let result: Result<i64, RedisError> = match transaction {
            Transaction::IncrementWindow { key, ttl_secs } => {
                self.increment_window
                    .key(key.as_str())
                    .arg(*ttl_secs)
                    .invoke_async(&mut conn)
                    .await
            }
            Transaction::SlidingLog {
                key,
                now_ms,
                window_ms,
                member,
                ttl_secs,
            } => {
                let cutoff = format!("({}", now_ms.saturating_sub(*window_ms));
                self.sliding_log
                    .key(key.as_str())
                    .arg(*now_ms)
                    .arg(cutoff)
                    .arg(member.as_str())
                    .arg(*ttl_secs)
                    .invoke_async(&mut conn)
                    .await
            }
        };

        let count = result.map_err(classify)?;
        trace!(key = %transaction.key(), count, "Executed redis transaction");
        Ok(count)
    }

    async fn ping(&self) -> Result<(), QuotaError> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(classify)
    }
}

/// Connection-level failures mean the script never ran; anything else means
/// Redis ran it and it errored.
fn classify(err: RedisError) -> QuotaError {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        QuotaError::StoreUnavailable(err.to_string())
    } else {
        QuotaError::TransactionFailed(err.to_string())
    }
}
