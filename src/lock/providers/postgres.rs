//! PostgreSQL advisory lock provider
//!
//! Locks are transaction-scoped (`pg_advisory_xact_lock`). Acquiring opens a
//! transaction on a pooled connection and the [`LockHandle`] owns it; unlocking
//! commits. If the holder crashes, its session ends and PostgreSQL drops the lock.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use crate::error::{BusError, BusResult};
use crate::lock::{HeldLock, LockHandle, LockId, LockManager, LOCK_KEY_BASE};

/// Advisory lock manager over a PostgreSQL pool
#[derive(Debug, Clone)]
pub struct PgLockManager {
    pool: PgPool,
}

impl PgLockManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn begin(&self, id: LockId, operation: &str) -> BusResult<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| BusError::lock(id.key(), operation, e))
    }
}

struct PgHeldLock {
    id: LockId,
    transaction: Transaction<'static, Postgres>,
}

#[async_trait]
impl HeldLock for PgHeldLock {
    async fn release(self: Box<Self>) -> BusResult<()> {
        let id = self.id;
        self.transaction
            .commit()
            .await
            .map_err(|e| BusError::lock(id.key(), "unlock", e))?;
        debug!(lock_id = %id, "Advisory lock released (postgres)");
        Ok(())
    }
}

#[async_trait]
impl LockManager for PgLockManager {
    async fn lock(&self, id: LockId) -> BusResult<LockHandle> {
        let mut transaction = self.begin(id, "lock").await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(id.key())
            .execute(&mut *transaction)
            .await
            .map_err(|e| BusError::lock(id.key(), "lock", e))?;

        debug!(lock_id = %id, "Advisory lock acquired (postgres)");
        Ok(LockHandle::new(id, Box::new(PgHeldLock { id, transaction })))
    }

    async fn try_lock(&self, id: LockId) -> BusResult<Option<LockHandle>> {
        let mut transaction = self.begin(id, "try_lock").await?;

        let acquired = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_xact_lock($1)")
            .bind(id.key())
            .fetch_one(&mut *transaction)
            .await
            .map_err(|e| BusError::lock(id.key(), "try_lock", e))?;

        if !acquired {
            transaction
                .rollback()
                .await
                .map_err(|e| BusError::lock(id.key(), "try_lock", e))?;
            return Ok(None);
        }

        debug!(lock_id = %id, "Advisory lock acquired without waiting (postgres)");
        Ok(Some(LockHandle::new(
            id,
            Box::new(PgHeldLock { id, transaction }),
        )))
    }

    async fn held_count(&self) -> BusResult<u64> {
        // A bigint advisory key is split into classid (high 32 bits) and objid (low 32 bits)
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT count(*)
              FROM pg_locks
             WHERE locktype = 'advisory'
               AND granted
               AND objsubid = 1
               AND database = (SELECT oid FROM pg_database WHERE datname = current_database())
               AND classid::bigint = $1
            "#,
        )
        .bind(LOCK_KEY_BASE >> 32)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| BusError::lock(LOCK_KEY_BASE, "held_count", e))?;

        Ok(count.max(0) as u64)
    }

    fn provider_name(&self) -> &'static str {
        "postgres"
    }
}
