//! Redis lock provider
//!
//! A lock is a self-expiring token: `SET key token NX PX ttl`. Only the holder
//! of the token can release it (compare-and-delete script). Redis has no
//! blocking primitive for this, so [`LockManager::lock`] polls at
//! `lock.retry_interval_ms`.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::{BusError, BusResult};
use crate::lock::{HeldLock, LockHandle, LockId, LockManager};

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Token-based lock manager over Redis
#[derive(Clone)]
pub struct RedisLockManager {
    connection_manager: ConnectionManager,
    key_prefix: String,
    ttl: Duration,
    retry_interval: Duration,
}

impl std::fmt::Debug for RedisLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLockManager")
            .field("key_prefix", &self.key_prefix)
            .field("ttl", &self.ttl)
            .field("retry_interval", &self.retry_interval)
            .finish()
    }
}

impl RedisLockManager {
    pub fn new(connection_manager: ConnectionManager, config: &LockConfig) -> Self {
        Self {
            connection_manager,
            key_prefix: config.redis_key_prefix.clone(),
            ttl: config.redis_lock_ttl(),
            retry_interval: config.retry_interval(),
        }
    }

    fn lock_key(&self, id: LockId) -> String {
        format!("{}{}", self.key_prefix, id.value())
    }
}

struct RedisHeldLock {
    id: LockId,
    connection_manager: ConnectionManager,
    key: String,
    token: String,
}

#[async_trait]
impl HeldLock for RedisHeldLock {
    async fn release(self: Box<Self>) -> BusResult<()> {
        let mut conn = self.connection_manager.clone();
        let removed: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| BusError::lock(self.id.key(), "unlock", e))?;

        if removed == 0 {
            return Err(BusError::lock(
                self.id.key(),
                "unlock",
                "token expired or taken over before release",
            ));
        }
        debug!(lock_id = %self.id, "Lock released (redis)");
        Ok(())
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn lock(&self, id: LockId) -> BusResult<LockHandle> {
        loop {
            if let Some(handle) = self.try_lock(id).await? {
                return Ok(handle);
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    async fn try_lock(&self, id: LockId) -> BusResult<Option<LockHandle>> {
        let mut conn = self.connection_manager.clone();
        let key = self.lock_key(id);
        let token = Uuid::new_v4().to_string();

        let reply: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::lock(id.key(), "try_lock", e))?;

        if reply.is_none() {
            return Ok(None);
        }

        debug!(lock_id = %id, "Lock acquired (redis)");
        Ok(Some(LockHandle::new(
            id,
            Box::new(RedisHeldLock {
                id,
                connection_manager: self.connection_manager.clone(),
                key,
                token,
            }),
        )))
    }

    async fn held_count(&self) -> BusResult<u64> {
        let mut conn = self.connection_manager.clone();
        let glob = format!("{}*", self.key_prefix);
        let mut count: u64 = 0;
        let mut cursor: u64 = 0;

        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&glob)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| BusError::lock(0, "held_count", e))?;

            count += keys.len() as u64;
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        Ok(count)
    }

    fn provider_name(&self) -> &'static str {
        "redis"
    }
}
