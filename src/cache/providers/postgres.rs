//! PostgreSQL cache provider
//!
//! One table, `tasker_bus_cache`, created by the crate migrations. Expiry is
//! enforced three ways: every read filters on `expire_at > now()`, `set` with a
//! TTL schedules a one-shot delete on a tokio task, and [`CacheStore::sweep_expired`]
//! (driven by [`crate::cache::CacheSweeper`]) clears whatever the timers missed,
//! e.g. after a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::pattern;
use crate::cache::traits::CacheStore;
use crate::cache::CacheEntry;
use crate::error::{BusError, BusResult};

const LIVE: &str = "(expire_at IS NULL OR expire_at > now())";

/// PostgreSQL-backed cache store
#[derive(Debug, Clone)]
pub struct PgCacheStore {
    pool: PgPool,
}

impl PgCacheStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Fast-path removal at expiry, independent of the periodic sweep
    fn schedule_expiry(&self, key: &str, ttl: Duration) {
        let pool = self.pool.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            // A later `set` may have extended the entry; only delete what is due
            let result = sqlx::query(
                "DELETE FROM tasker_bus_cache WHERE key = $1 AND expire_at IS NOT NULL AND expire_at <= now()",
            )
            .bind(&key)
            .execute(&pool)
            .await;
            if let Err(e) = result {
                warn!(key = %key, error = %e, "Scheduled cache expiry failed; sweep will retry");
            }
        });
    }
}

#[async_trait]
impl CacheStore for PgCacheStore {
    async fn set(&self, key: &str, document: &str, ttl: Option<Duration>) -> BusResult<()> {
        let ttl_ms = ttl.map(|ttl| ttl.as_millis() as i64);

        sqlx::query(
            r#"
            INSERT INTO tasker_bus_cache (key, value, expire_at, updated_at)
            VALUES ($1, $2::jsonb, now() + ($3::bigint * interval '1 millisecond'), now())
            ON CONFLICT (key) DO UPDATE
               SET value = EXCLUDED.value,
                   expire_at = EXCLUDED.expire_at,
                   updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(key)
        .bind(document)
        .bind(ttl_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| BusError::cache("set", key, e))?;

        if let Some(ttl) = ttl {
            self.schedule_expiry(key, ttl);
        }

        debug!(key = key, ttl_ms = ttl_ms, "Cache SET (postgres)");
        Ok(())
    }

    async fn get(&self, key: &str) -> BusResult<Option<String>> {
        sqlx::query_scalar::<_, String>(&format!(
            "SELECT value::text FROM tasker_bus_cache WHERE key = $1 AND {LIVE}"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BusError::cache("get", key, e))
    }

    async fn has(&self, key: &str) -> BusResult<bool> {
        sqlx::query_scalar::<_, bool>(&format!(
            "SELECT EXISTS (SELECT 1 FROM tasker_bus_cache WHERE key = $1 AND {LIVE})"
        ))
        .bind(key)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| BusError::cache("has", key, e))
    }

    async fn pop(&self, key: &str) -> BusResult<Option<String>> {
        let row = sqlx::query(&format!(
            "DELETE FROM tasker_bus_cache WHERE key = $1 RETURNING value::text AS value, {LIVE} AS live"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BusError::cache("pop", key, e))?;

        match row {
            Some(row) => {
                let live: bool = row.try_get("live").map_err(|e| BusError::decode(key, e))?;
                let value: String = row.try_get("value").map_err(|e| BusError::decode(key, e))?;
                Ok(live.then_some(value))
            }
            None => Ok(None),
        }
    }

    async fn get_like(&self, pattern: &str) -> BusResult<Vec<String>> {
        sqlx::query_scalar::<_, String>(&format!(
            "SELECT value::text FROM tasker_bus_cache WHERE key LIKE $1 ESCAPE '\\' AND {LIVE} ORDER BY key"
        ))
        .bind(pattern::to_sql_like(pattern))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BusError::cache("get_like", pattern, e))
    }

    async fn pop_like(&self, pattern: &str) -> BusResult<Vec<String>> {
        let rows = sqlx::query(&format!(
            "DELETE FROM tasker_bus_cache WHERE key LIKE $1 ESCAPE '\\' RETURNING key, value::text AS value, {LIVE} AS live"
        ))
        .bind(pattern::to_sql_like(pattern))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BusError::cache("pop_like", pattern, e))?;

        let mut popped = Vec::with_capacity(rows.len());
        for row in rows {
            let live: bool = row.try_get("live").map_err(|e| BusError::decode(pattern, e))?;
            if live {
                let key: String = row.try_get("key").map_err(|e| BusError::decode(pattern, e))?;
                let value: String = row
                    .try_get("value")
                    .map_err(|e| BusError::decode(pattern, e))?;
                popped.push((key, value));
            }
        }
        popped.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(popped.into_iter().map(|(_, value)| value).collect())
    }

    async fn delete(&self, key: &str) -> BusResult<bool> {
        let result = sqlx::query("DELETE FROM tasker_bus_cache WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| BusError::cache("delete", key, e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn entry(&self, key: &str) -> BusResult<Option<CacheEntry>> {
        let row = sqlx::query(&format!(
            "SELECT key, value::text AS value, expire_at, updated_at FROM tasker_bus_cache WHERE key = $1 AND {LIVE}"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BusError::cache("entry", key, e))?;

        row.map(|row| -> Result<CacheEntry, sqlx::Error> {
            Ok(CacheEntry {
                key: row.try_get("key")?,
                value: row.try_get("value")?,
                expire_at: row.try_get::<Option<DateTime<Utc>>, _>("expire_at")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
        .map_err(|e| BusError::decode(key, e))
    }

    async fn sweep_expired(&self) -> BusResult<u64> {
        let result = sqlx::query(
            "DELETE FROM tasker_bus_cache WHERE expire_at IS NOT NULL AND expire_at <= now()",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| BusError::cache("sweep_expired", "*", e))?;

        let removed = result.rows_affected();
        if removed > 0 {
            debug!(removed = removed, "Swept expired cache entries (postgres)");
        }
        Ok(removed)
    }

    async fn health_check(&self) -> BusResult<bool> {
        let one: i32 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| BusError::connection("cache health_check", e))?;
        Ok(one == 1)
    }

    fn provider_name(&self) -> &'static str {
        "postgres"
    }
}
