//! The Lease Store contract and its Redis implementation.
//!
//! The lease store is the fast, ephemeral truth for "is this available
//! right now": atomic counters, TTL-bearing hold records, and the short
//! mutual-exclusion leases the lock manager builds on. The contract is
//! load-bearing — every mutation the coordinator performs against shared
//! state goes through one of these operations.
//!
//! Conditional transactions ("mutate only if this key still exists") run
//! server-side as Lua scripts so a hold released normally between a scan
//! and the reclaim is a safe no-op.

use crate::error::LeaseError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

/// TTL-capable key/value contract required by the reservation core.
///
/// Implementations must make `incr_by`/`decr_by` atomic per key and
/// `reclaim_hold`/`release_lock` atomic check-then-mutate operations;
/// those two points are the only true mutual exclusion in the system.
#[async_trait]
pub trait LeaseStore: Clone + Send + Sync + 'static {
    /// Store a JSON-encoded record, with a lease TTL when given.
    async fn put_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), LeaseError>;

    /// Read back a JSON-encoded record. `None` when absent or lapsed.
    async fn get_json<T: DeserializeOwned + Send>(
        &self,
        key: &str,
    ) -> Result<Option<T>, LeaseError>;

    /// Read a record's raw payload, for use as the `expected` argument of
    /// [`LeaseStore::reclaim_hold`].
    async fn get_raw(&self, key: &str) -> Result<Option<String>, LeaseError>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, LeaseError>;

    /// Whether a key currently exists.
    async fn exists(&self, key: &str) -> Result<bool, LeaseError>;

    /// Strip a key's TTL, making it permanent. Returns whether a TTL was
    /// removed (false when the key is absent or already permanent).
    async fn persist(&self, key: &str) -> Result<bool, LeaseError>;

    /// Overwrite a counter with an absolute value (counter seeding).
    async fn set_counter(&self, key: &str, value: i64) -> Result<(), LeaseError>;

    /// Read a counter. `None` when it was never seeded.
    async fn get_counter(&self, key: &str) -> Result<Option<i64>, LeaseError>;

    /// Atomically increment a counter, returning the new value.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, LeaseError>;

    /// Atomically decrement a counter, returning the new value.
    ///
    /// A missing counter decrements from zero — an unseeded ticket reads
    /// as sold out rather than being auto-created.
    async fn decr_by(&self, key: &str, delta: i64) -> Result<i64, LeaseError>;

    /// Take a mutual-exclusion lease: set `key = token` only if the key is
    /// absent, with an auto-expiring TTL. Returns whether the lease was won.
    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LeaseError>;

    /// Release a mutual-exclusion lease, but only if it still carries this
    /// caller's token. A lease that expired and was re-acquired by someone
    /// else is left alone.
    async fn release_lock(&self, key: &str, token: &str) -> Result<bool, LeaseError>;

    /// Conditionally reclaim a hold: if `hold_key` still holds exactly
    /// `expected` *and still carries a TTL*, restore `quantity` to
    /// `counter_key` (skipped when zero) and delete the hold, atomically.
    /// Returns whether anything was reclaimed.
    ///
    /// The payload comparison makes a hold that was released and re-taken
    /// between the caller's read and this call a safe no-op; the TTL guard
    /// does the same for a hold finalized into a permanent booking.
    async fn reclaim_hold(
        &self,
        hold_key: &str,
        expected: &str,
        counter_key: &str,
        quantity: i64,
    ) -> Result<bool, LeaseError>;

    /// Enumerate live keys matching a glob pattern.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, LeaseError>;
}

/// Compare-and-delete for lock release: delete only while the key still
/// holds the caller's token.
const RELEASE_LOCK_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
";

/// Conditional hold reclaim. No-ops when the key is gone, when its payload
/// is no longer the one the caller read (released and re-taken), or when
/// its TTL was stripped (finalized into a permanent booking).
const RECLAIM_HOLD_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if current == false or current ~= ARGV[2] then
    return 0
end
if redis.call('PTTL', KEYS[1]) == -1 then
    return 0
end
local qty = tonumber(ARGV[1])
if qty > 0 then
    redis.call('INCRBY', KEYS[2], qty)
end
redis.call('DEL', KEYS[1])
return 1
";

/// Redis-backed lease store.
///
/// Uses a `ConnectionManager` for pooling and reconnection; all conditional
/// mutations run as Lua scripts so they are atomic on the server.
#[derive(Clone)]
pub struct RedisLeaseStore {
    conn: ConnectionManager,
}

impl RedisLeaseStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Backend`] if the URL is invalid or the
    /// connection cannot be established.
    pub async fn connect(redis_url: &str) -> Result<Self, LeaseError> {
        let client = Client::open(redis_url)
            .map_err(|e| LeaseError::Backend(format!("failed to create Redis client: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| LeaseError::Backend(format!("failed to connect to Redis: {e}")))?;
        Ok(Self { conn })
    }

    /// Wrap an existing connection manager.
    #[must_use]
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

/// Redis rejects PX values below one millisecond.
#[allow(clippy::cast_possible_truncation)]
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn put_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), LeaseError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(value)
            .map_err(|e| LeaseError::Backend(format!("failed to encode lease entry: {e}")))?;

        match ttl {
            Some(ttl) => {
                let _: () = redis::cmd("SET")
                    .arg(key)
                    .arg(payload)
                    .arg("PX")
                    .arg(ttl_millis(ttl))
                    .query_async(&mut conn)
                    .await?;
            }
            None => {
                let _: () = conn.set(key, payload).await?;
            }
        }
        Ok(())
    }

    async fn get_json<T: DeserializeOwned + Send>(
        &self,
        key: &str,
    ) -> Result<Option<T>, LeaseError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            Some(json) => {
                let value = serde_json::from_str(&json).map_err(|source| LeaseError::Decode {
                    key: key.to_string(),
                    source,
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn get_raw(&self, key: &str) -> Result<Option<String>, LeaseError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        Ok(raw)
    }

    async fn delete(&self, key: &str) -> Result<bool, LeaseError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, LeaseError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn persist(&self, key: &str) -> Result<bool, LeaseError> {
        let mut conn = self.conn.clone();
        let persisted: bool = conn.persist(key).await?;
        Ok(persisted)
    }

    async fn set_counter(&self, key: &str, value: i64) -> Result<(), LeaseError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn get_counter(&self, key: &str) -> Result<Option<i64>, LeaseError> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = conn.get(key).await?;
        Ok(value)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, LeaseError> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(key, delta).await?;
        Ok(value)
    }

    async fn decr_by(&self, key: &str, delta: i64) -> Result<i64, LeaseError> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.decr(key, delta).await?;
        Ok(value)
    }

    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LeaseError> {
        let mut conn = self.conn.clone();
        let acquired: bool = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(acquired)
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool, LeaseError> {
        let mut conn = self.conn.clone();
        let released: i64 = Script::new(RELEASE_LOCK_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(released > 0)
    }

    async fn reclaim_hold(
        &self,
        hold_key: &str,
        expected: &str,
        counter_key: &str,
        quantity: i64,
    ) -> Result<bool, LeaseError> {
        let mut conn = self.conn.clone();
        let reclaimed: i64 = Script::new(RECLAIM_HOLD_SCRIPT)
            .key(hold_key)
            .key(counter_key)
            .arg(quantity)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(reclaimed > 0)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, LeaseError> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }
}
