//! # Backend Bundle
//!
//! A [`Bus`](crate::bus::Bus) needs three collaborators from the same
//! deployment: a pub/sub transport, a cache store and a lock manager.
//! [`BusBackend`] wires them up for each supported backend.

use std::sync::Arc;
use tracing::info;

use crate::bus::providers::InMemoryPubSub;
use crate::bus::PubSubBackend;
use crate::cache::providers::InMemoryCacheStore;
use crate::cache::Cache;
use crate::config::BusConfig;
use crate::error::{BusError, BusResult};
use crate::lock::providers::InMemoryLockManager;
use crate::lock::LockManager;

/// Transport, cache and locks for one bus
#[derive(Clone)]
pub struct BusBackend {
    pub pubsub: Arc<dyn PubSubBackend>,
    pub cache: Cache,
    pub locks: Arc<dyn LockManager>,
}

impl std::fmt::Debug for BusBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusBackend")
            .field("pubsub", &self.pubsub.provider_name())
            .field("cache", &self.cache.provider_name())
            .field("locks", &self.locks.provider_name())
            .finish()
    }
}

impl BusBackend {
    pub fn new(
        pubsub: Arc<dyn PubSubBackend>,
        cache: Cache,
        locks: Arc<dyn LockManager>,
    ) -> Self {
        Self {
            pubsub,
            cache,
            locks,
        }
    }

    /// Everything in this process; clones share the same hub, cache and locks
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryPubSub::new()),
            Cache::new(InMemoryCacheStore::new()),
            Arc::new(InMemoryLockManager::new()),
        )
    }

    /// PostgreSQL for all three; creates the cache table if missing
    #[cfg(feature = "postgres")]
    pub async fn postgres(pool: sqlx::PgPool) -> BusResult<Self> {
        use crate::bus::providers::PgPubSub;
        use crate::cache::providers::PgCacheStore;
        use crate::lock::providers::PgLockManager;
        use crate::lock::LockId;

        let locks = PgLockManager::new(pool.clone());
        let mut migration_lock = locks.lock(LockId::SCHEMA_MIGRATION).await?;

        // The host application may keep its own migrations in the same history table
        let mut migrator = sqlx::migrate!("./migrations");
        migrator.set_ignore_missing(true);
        let migrated = migrator
            .run(&pool)
            .await
            .map_err(|e| BusError::connection("migrate", e));
        migration_lock.unlock().await;
        migrated?;

        info!("PostgreSQL bus backend ready");
        Ok(Self::new(
            Arc::new(PgPubSub::new(pool.clone())),
            Cache::new(PgCacheStore::new(pool)),
            Arc::new(locks),
        ))
    }

    /// Redis for all three
    #[cfg(feature = "redis")]
    pub async fn redis(url: &str, config: &BusConfig) -> BusResult<Self> {
        use crate::bus::providers::RedisPubSub;
        use crate::cache::providers::RedisCacheStore;
        use crate::lock::providers::RedisLockManager;

        let pubsub = RedisPubSub::connect(url).await?;
        let connection_manager = pubsub.connection_manager().clone();

        info!("Redis bus backend ready");
        Ok(Self::new(
            Arc::new(pubsub),
            Cache::new(RedisCacheStore::new(
                connection_manager.clone(),
                config.cache.redis_key_prefix.clone(),
            )),
            Arc::new(RedisLockManager::new(connection_manager, &config.lock)),
        ))
    }

    /// Build the backend named by the configuration URLs: PostgreSQL when
    /// `database_url` is set, else Redis when `redis_url` is set
    pub async fn from_config(config: &BusConfig) -> BusResult<Self> {
        #[cfg(feature = "postgres")]
        if let Some(url) = &config.database_url {
            let pool = sqlx::PgPool::connect(url)
                .await
                .map_err(|e| BusError::connection("postgres connect", e))?;
            return Self::postgres(pool).await;
        }

        #[cfg(feature = "redis")]
        if let Some(url) = &config.redis_url {
            return Self::redis(url, config).await;
        }

        Err(BusError::configuration(
            "neither database_url nor redis_url is configured for an enabled backend",
        ))
    }
}
