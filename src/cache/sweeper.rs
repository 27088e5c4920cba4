//! Background expiry sweep
//!
//! Periodically removes expired cache entries. When a lock manager is given,
//! each cycle first takes [`LockId::CACHE_SWEEP`] without waiting, so only one
//! process in a deployment sweeps at a time.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Cache;
use crate::lock::{LockId, LockManager};

/// Spawns and describes the periodic sweep task
#[derive(Debug)]
pub struct CacheSweeper;

impl CacheSweeper {
    /// Spawn the sweep loop; it ends when `shutdown` flips to true or its sender is dropped
    pub fn spawn(
        cache: Cache,
        locks: Option<Arc<dyn LockManager>>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                provider = cache.provider_name(),
                interval_ms = interval.as_millis() as u64,
                "Cache sweeper started"
            );

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        Self::sweep_cycle(&cache, locks.as_deref()).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Cache sweeper stopped");
        })
    }

    /// Run one sweep; returns the number of entries removed
    pub async fn sweep_cycle(cache: &Cache, locks: Option<&dyn LockManager>) -> u64 {
        let mut handle = match locks {
            Some(locks) => match locks.try_lock(LockId::CACHE_SWEEP).await {
                Ok(Some(handle)) => Some(handle),
                Ok(None) => {
                    debug!("Another process holds the sweep lock; skipping cycle");
                    return 0;
                }
                Err(e) => {
                    warn!(error = %e, "Could not take the sweep lock; skipping cycle");
                    return 0;
                }
            },
            None => None,
        };

        let removed = match cache.sweep_expired().await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(error = %e, "Cache sweep failed");
                0
            }
        };

        if let Some(handle) = handle.as_mut() {
            handle.unlock().await;
        }
        removed
    }
}
