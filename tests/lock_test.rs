//! # Lock Manager Tests
//!
//! Blocking and non-blocking acquisition, release semantics and the held
//! count, against the in-memory provider.

use std::sync::Arc;
use std::time::Duration;
use tasker_bus::lock::providers::InMemoryLockManager;
use tasker_bus::lock::{LockId, LockManager};

const REPORT_LOCK: LockId = LockId::new(1);
const EXPORT_LOCK: LockId = LockId::new(2);

#[tokio::test]
async fn test_blocking_and_try_lock_counts() {
    let locks = InMemoryLockManager::new();

    let mut first = locks.lock(REPORT_LOCK).await.unwrap();
    let mut second = locks.try_lock(EXPORT_LOCK).await.unwrap().expect("lock 2 is free");
    assert_eq!(locks.held_count().await.unwrap(), 2);

    assert!(locks.unlock(&mut first, REPORT_LOCK).await);
    assert!(second.unlock().await);
    assert_eq!(locks.held_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_try_lock_on_held_id_returns_none() {
    let locks = InMemoryLockManager::new();
    let mut held = locks.lock(REPORT_LOCK).await.unwrap();

    let started = tokio::time::Instant::now();
    assert!(locks.try_lock(REPORT_LOCK).await.unwrap().is_none());
    assert!(started.elapsed() < Duration::from_millis(100));

    held.unlock().await;
    let mut again = locks.try_lock(REPORT_LOCK).await.unwrap().expect("released");
    again.unlock().await;
    let mut blocking = locks.lock(REPORT_LOCK).await.unwrap();
    assert!(blocking.unlock().await);
}

#[tokio::test]
async fn test_lock_blocks_until_unlock() {
    let locks = Arc::new(InMemoryLockManager::new());
    let mut held = locks.lock(REPORT_LOCK).await.unwrap();

    let waiter = {
        let locks = Arc::clone(&locks);
        tokio::spawn(async move {
            let mut handle = locks.lock(REPORT_LOCK).await.unwrap();
            handle.unlock().await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    held.unlock().await;
    let released = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter acquires after unlock")
        .unwrap();
    assert!(released);
}

#[tokio::test]
async fn test_unlock_is_idempotent_and_checks_id() {
    let locks = InMemoryLockManager::new();
    let mut handle = locks.lock(REPORT_LOCK).await.unwrap();

    assert!(!locks.unlock(&mut handle, EXPORT_LOCK).await);
    assert!(handle.is_held());

    assert!(handle.unlock().await);
    assert!(!handle.unlock().await);
    assert!(!locks.unlock(&mut handle, REPORT_LOCK).await);
    assert!(!handle.is_held());
}

#[tokio::test]
async fn test_dropped_handle_releases_in_memory_lock() {
    let locks = InMemoryLockManager::new();
    {
        let _handle = locks.lock(REPORT_LOCK).await.unwrap();
        assert_eq!(locks.held_count().await.unwrap(), 1);
    }
    assert_eq!(locks.held_count().await.unwrap(), 0);
    assert!(locks.try_lock(REPORT_LOCK).await.unwrap().is_some());
}
