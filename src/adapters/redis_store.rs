//! Redis Key-Value Store
//!
//! Implements the `KeyValueStore` port on top of a multiplexed
//! `redis::aio::ConnectionManager`, which reconnects on its own and is cheap
//! to clone per call.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, info};

use crate::domain::ports::KeyValueStore;
use crate::error::{Error, Result};

/// Compare-and-delete script: KEYS[1] = key, ARGV[1] = expected value.
/// Returns 1 when the value matched and was deleted, 0 otherwise.
pub const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
end
return 0
"#;

/// Redis-backed key-value store
#[derive(Clone)]
pub struct RedisKeyValueStore {
    connection: ConnectionManager,
    compare_and_delete: Script,
}

impl RedisKeyValueStore {
    /// Connect to the Redis server at `url` (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Config(format!("Invalid Redis URL {}: {}", url, e)))?;
        let connection = ConnectionManager::new(client).await?;
        info!(url = %url, "Connected to Redis");
        Ok(Self::with_connection(connection))
    }

    /// Wrap an existing connection manager.
    pub fn with_connection(connection: ConnectionManager) -> Self {
        Self {
            connection,
            compare_and_delete: Script::new(COMPARE_AND_DELETE_SCRIPT),
        }
    }
}

impl std::fmt::Debug for RedisKeyValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKeyValueStore").finish_non_exhaustive()
    }
}

/// Redis TTLs are whole seconds; round sub-second TTLs up so a key never
/// becomes persistent by accident.
fn ttl_seconds(ttl: Duration) -> u64 {
    let secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 || secs == 0 {
        secs + 1
    } else {
        secs
    }
}

#[async_trait]
impl KeyValueStore for RedisKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection.clone();
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl_seconds(ttl)).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection.clone();
        let value: i64 = conn.incr(key, 1i64).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let removed: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        debug!(key = %key, removed, "Compare-and-delete");
        Ok(removed == 1)
    }
}
