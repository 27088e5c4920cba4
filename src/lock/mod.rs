//! # Lock Manager
//!
//! Cross-process advisory locks identified by small integers.
//!
//! Lock ids come from a fixed, pre-enumerated namespace: applications declare
//! every lock purpose as a named constant rather than hashing strings, so two
//! purposes can never collide. Application ids run from
//! [`LockId::MIN_APPLICATION`] up to (excluding) [`LockId::RESERVED_MIN`];
//! the ids above belong to this crate. The key sent to a backend is
//! `LOCK_KEY_BASE + id`.
//!
//! ```rust
//! use tasker_bus::lock::LockId;
//!
//! const NIGHTLY_REPORT: LockId = LockId::new(1);
//! const INVOICE_EXPORT: LockId = LockId::new(2);
//!
//! assert_ne!(NIGHTLY_REPORT.key(), INVOICE_EXPORT.key());
//! assert!(LockId::CACHE_SWEEP.is_reserved());
//! assert!(LockId::try_new(LockId::RESERVED_MIN).is_err());
//! ```
//!
//! An application id outside the range does not compile as a constant:
//!
//! ```compile_fail
//! use tasker_bus::lock::LockId;
//!
//! const CLASHES_WITH_SWEEP: LockId = LockId::new(LockId::RESERVED_MIN);
//! ```
//!
//! ## Handle ownership
//!
//! A [`LockHandle`] is the only path to release. Dropping a handle without
//! calling [`LockHandle::unlock`] leaks the lock until the backend reclaims it:
//!
//! - **PostgreSQL**: the handle owns the transaction holding
//!   `pg_advisory_xact_lock`; the transaction is rolled back when the pooled
//!   connection is returned, which releases the lock.
//! - **Redis**: the token stays until its TTL (`lock.redis_lock_ttl_seconds`) lapses.
//! - **In-memory**: released immediately on drop.

pub mod providers;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use crate::error::{BusError, BusResult};

/// Base of every key this crate sends to a backend ("TBUS" in the high 32 bits)
pub const LOCK_KEY_BASE: i64 = 0x5442_5553_i64 << 32;

/// Identifier of a lock purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockId(u32);

impl LockId {
    /// Smallest id an application may use
    pub const MIN_APPLICATION: u32 = 1;

    /// First id reserved for this crate's own locks
    pub const RESERVED_MIN: u32 = 0xFFFF_FF00;

    /// Held by whichever process runs the cache expiry sweep
    pub const CACHE_SWEEP: LockId = LockId(Self::RESERVED_MIN);

    /// Serializes schema migrations of the PostgreSQL backend
    pub const SCHEMA_MIGRATION: LockId = LockId(Self::RESERVED_MIN + 1);

    /// Application lock id
    ///
    /// # Panics
    ///
    /// When `id` is outside `MIN_APPLICATION..RESERVED_MIN`. In a `const`
    /// item this is a compile error; use [`LockId::try_new`] for ids that
    /// are only known at runtime.
    pub const fn new(id: u32) -> Self {
        assert!(
            Self::is_application_range(id),
            "lock id outside the application range"
        );
        Self(id)
    }

    /// Application lock id, rejecting ids outside `MIN_APPLICATION..RESERVED_MIN`
    pub fn try_new(id: u32) -> BusResult<Self> {
        if Self::is_application_range(id) {
            Ok(Self(id))
        } else {
            Err(BusError::lock(
                LOCK_KEY_BASE + id as i64,
                "new",
                format!(
                    "id {id} is outside the application range {}..{}",
                    Self::MIN_APPLICATION,
                    Self::RESERVED_MIN
                ),
            ))
        }
    }

    const fn is_application_range(id: u32) -> bool {
        id >= Self::MIN_APPLICATION && id < Self::RESERVED_MIN
    }

    pub const fn value(&self) -> u32 {
        self.0
    }

    /// Numeric key sent to the backend
    pub const fn key(&self) -> i64 {
        LOCK_KEY_BASE + self.0 as i64
    }

    pub const fn is_reserved(&self) -> bool {
        self.0 >= Self::RESERVED_MIN
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backend-specific state of an acquired lock
#[async_trait]
pub trait HeldLock: Send {
    /// Release the lock; consumes the backend state
    async fn release(self: Box<Self>) -> BusResult<()>;
}

/// An acquired lock
pub struct LockHandle {
    id: LockId,
    held: Option<Box<dyn HeldLock>>,
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("id", &self.id)
            .field("held", &self.held.is_some())
            .finish()
    }
}

impl LockHandle {
    pub fn new(id: LockId, held: Box<dyn HeldLock>) -> Self {
        Self {
            id,
            held: Some(held),
        }
    }

    pub fn id(&self) -> LockId {
        self.id
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// Release the lock. Returns false if it was already released or the
    /// backend refused; never errors, so releasing twice is safe.
    pub async fn unlock(&mut self) -> bool {
        let Some(held) = self.held.take() else {
            return false;
        };
        match held.release().await {
            Ok(()) => true,
            Err(e) => {
                warn!(lock_id = %self.id, error = %e, "Failed to release lock");
                false
            }
        }
    }
}

/// Acquire and release advisory locks
#[async_trait]
pub trait LockManager: Send + Sync + 'static {
    /// Block until the lock is acquired
    async fn lock(&self, id: LockId) -> BusResult<LockHandle>;

    /// Acquire without waiting; `None` when another holder has it
    async fn try_lock(&self, id: LockId) -> BusResult<Option<LockHandle>>;

    /// Release through the handle; false for a released handle or mismatched id
    async fn unlock(&self, handle: &mut LockHandle, id: LockId) -> bool {
        if handle.id() != id {
            warn!(
                handle_id = %handle.id(),
                requested_id = %id,
                "Refusing to unlock with a handle for another lock"
            );
            return false;
        }
        handle.unlock().await
    }

    /// Number of locks in this crate's namespace currently held in the backend
    async fn held_count(&self) -> BusResult<u64>;

    fn provider_name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_keys_share_namespace() {
        assert_eq!(LockId::new(1).key(), LOCK_KEY_BASE + 1);
        assert_eq!(LockId::new(1).key() >> 32, LOCK_KEY_BASE >> 32);
        assert_eq!(LockId::CACHE_SWEEP.key() >> 32, LOCK_KEY_BASE >> 32);
        assert_eq!(LockId::new(1).key() & 0xFFFF_FFFF, 1);
    }

    #[test]
    fn test_reserved_ids() {
        assert!(!LockId::new(1).is_reserved());
        assert!(LockId::CACHE_SWEEP.is_reserved());
        assert!(LockId::SCHEMA_MIGRATION.is_reserved());
        assert_ne!(LockId::CACHE_SWEEP, LockId::SCHEMA_MIGRATION);
        assert_eq!(LockId::new(7).to_string(), "7");
    }

    #[test]
    fn test_application_range_is_enforced() {
        assert_eq!(
            LockId::try_new(LockId::MIN_APPLICATION).unwrap(),
            LockId::new(1)
        );
        assert_eq!(
            LockId::try_new(LockId::RESERVED_MIN - 1).unwrap().value(),
            LockId::RESERVED_MIN - 1
        );

        assert!(LockId::try_new(0).is_err());
        assert!(LockId::try_new(LockId::RESERVED_MIN).is_err());
        let err = LockId::try_new(LockId::SCHEMA_MIGRATION.value()).unwrap_err();
        assert!(matches!(err, BusError::Lock { .. }));
    }

    #[test]
    #[should_panic(expected = "application range")]
    fn test_new_rejects_reserved_id() {
        let _ = LockId::new(LockId::CACHE_SWEEP.value());
    }
}
