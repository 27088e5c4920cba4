//! In-memory lock provider
//!
//! One async mutex per lock id. Mutual exclusion holds only inside the
//! current process.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::BusResult;
use crate::lock::{HeldLock, LockHandle, LockId, LockManager};

/// Process-local lock manager
#[derive(Debug, Default)]
pub struct InMemoryLockManager {
    locks: DashMap<LockId, Arc<Mutex<()>>>,
    held: Arc<AtomicU64>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex(&self, id: LockId) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(id).or_default().value())
    }

    fn handle(&self, id: LockId, guard: OwnedMutexGuard<()>) -> LockHandle {
        self.held.fetch_add(1, Ordering::SeqCst);
        LockHandle::new(
            id,
            Box::new(InMemoryHeldLock {
                _guard: guard,
                held: Arc::clone(&self.held),
            }),
        )
    }
}

struct InMemoryHeldLock {
    _guard: OwnedMutexGuard<()>,
    held: Arc<AtomicU64>,
}

impl Drop for InMemoryHeldLock {
    fn drop(&mut self) {
        self.held.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl HeldLock for InMemoryHeldLock {
    async fn release(self: Box<Self>) -> BusResult<()> {
        drop(self);
        Ok(())
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn lock(&self, id: LockId) -> BusResult<LockHandle> {
        let guard = self.mutex(id).lock_owned().await;
        Ok(self.handle(id, guard))
    }

    async fn try_lock(&self, id: LockId) -> BusResult<Option<LockHandle>> {
        Ok(self
            .mutex(id)
            .try_lock_owned()
            .ok()
            .map(|guard| self.handle(id, guard)))
    }

    async fn held_count(&self) -> BusResult<u64> {
        Ok(self.held.load(Ordering::SeqCst))
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}
