//! # PostgreSQL Backend Tests
//!
//! Cache table, advisory locks and LISTEN/NOTIFY against a live database.
//!
//! Enable with: --features test-services (requires DATABASE_URL)

#![cfg(feature = "test-services")]

use serde_json::json;
use std::time::Duration;
use tasker_bus::cache::providers::PgCacheStore;
use tasker_bus::config::{BusConfig, CacheConfig};
use tasker_bus::lock::providers::PgLockManager;
use tasker_bus::{Bus, BusBackend, Cache, Envelope, LockId, LockManager, Outcome};
use tokio::sync::mpsc;

fn pg_config() -> BusConfig {
    BusConfig {
        cache: CacheConfig {
            sweep_interval_seconds: 0,
            ..CacheConfig::default()
        },
        ..BusConfig::default()
    }
}

#[sqlx::test(migrations = "./migrations")]
async fn test_pg_cache_round_trip_and_expiry(pool: sqlx::PgPool) -> sqlx::Result<()> {
    let cache = Cache::new(PgCacheStore::new(pool));

    cache.set("doc", &json!({"a": 1}), None).await.unwrap();
    assert_eq!(
        cache.get::<serde_json::Value>("doc").await.unwrap(),
        Some(json!({"a": 1}))
    );
    assert_eq!(cache.pop::<serde_json::Value>("doc").await.unwrap(), Some(json!({"a": 1})));
    assert!(!cache.has("doc").await.unwrap());

    cache
        .set("short", &"lived", Some(Duration::from_millis(100)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(cache.get::<String>("short").await.unwrap(), None);
    assert!(!cache.has("short").await.unwrap());
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_pg_cache_like_queries(pool: sqlx::PgPool) -> sqlx::Result<()> {
    let cache = Cache::new(PgCacheStore::new(pool));
    for (key, value) in [("job:1", 1), ("job:2", 2), ("job_x", 3), ("other", 4)] {
        cache.set(key, &value, None).await.unwrap();
    }

    let jobs: Vec<i32> = cache.get_like("job:*").await.unwrap();
    assert_eq!(jobs, vec![1, 2]);

    // `_` is literal, not a SQL wildcard
    let literal: Vec<i32> = cache.get_like("job_?").await.unwrap();
    assert_eq!(literal, vec![3]);

    let popped: Vec<i32> = cache.pop_like("job*").await.unwrap();
    assert_eq!(popped.len(), 3);
    assert!(cache.has("other").await.unwrap());
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_pg_advisory_lock_counts(pool: sqlx::PgPool) -> sqlx::Result<()> {
    let locks = PgLockManager::new(pool);

    let mut first = locks.lock(LockId::new(1)).await.unwrap();
    let mut second = locks.try_lock(LockId::new(2)).await.unwrap().unwrap();
    assert_eq!(locks.held_count().await.unwrap(), 2);

    assert!(locks.try_lock(LockId::new(1)).await.unwrap().is_none());

    assert!(first.unlock().await);
    assert!(second.unlock().await);
    assert_eq!(locks.held_count().await.unwrap(), 0);
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_pg_bus_ping_pong_and_overflow(pool: sqlx::PgPool) -> sqlx::Result<()> {
    let backend = BusBackend::postgres(pool).await.unwrap();
    let requester = Bus::connect(backend.clone(), pg_config()).await.unwrap();
    let responder = Bus::connect(backend, pg_config()).await.unwrap();
    assert_eq!(requester.overflow_threshold(), Some(8000));

    let chan = responder.subscribe("test_chan2").await.unwrap();
    chan.handle("ping", |msg: Envelope| async move {
        Outcome::Reply(msg.reply("pong").with_data("test", json!("received")))
    });

    let reply = requester
        .publish_wait("test_chan2", Envelope::new("ping"), Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(reply.data["test"], json!("received"));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let bulk = responder.subscribe("bulk").await.unwrap();
    bulk.handle("bulk", move |msg: Envelope| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(msg);
            Outcome::NoReply
        }
    });

    let payload = "y".repeat(20_000);
    requester
        .publish("bulk", Envelope::new("bulk").with_data("payload", json!(payload.clone())))
        .await
        .unwrap();
    let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("overflowed notification delivered")
        .unwrap();
    assert_eq!(received.data["payload"], json!(payload));

    requester.close().await;
    responder.close().await;
    Ok(())
}
