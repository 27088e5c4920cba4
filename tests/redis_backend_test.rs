//! # Redis Backend Tests
//!
//! Cache, token locks, pub/sub and keep-alive against a live Redis server. Each test
//! skips when the server is not reachable.
//!
//! Enable with: --features test-services (uses REDIS_URL, default localhost)

#![cfg(feature = "test-services")]

use serde_json::json;
use std::time::Duration;
use tasker_bus::bus::providers::RedisPubSub;
use tasker_bus::bus::ChannelReceiver;
use tasker_bus::config::{BusConfig, CacheConfig, LockConfig};
use tasker_bus::{Bus, BusBackend, Envelope, LockId, LockManager, Outcome, PubSubBackend};
use tracing::warn;
use uuid::Uuid;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

/// Unique key prefixes so concurrent runs never share state
fn isolated_config() -> BusConfig {
    let run = Uuid::new_v4().simple().to_string();
    BusConfig {
        cache: CacheConfig {
            sweep_interval_seconds: 0,
            redis_key_prefix: format!("tasker_bus_test:{run}:cache:"),
        },
        lock: LockConfig {
            redis_key_prefix: format!("tasker_bus_test:{run}:lock:"),
            ..LockConfig::default()
        },
        ..BusConfig::default()
    }
}

async fn backend(config: &BusConfig) -> Option<BusBackend> {
    match BusBackend::redis(&redis_url(), config).await {
        Ok(backend) => Some(backend),
        Err(e) => {
            warn!("Skipping Redis test (not available): {}", e);
            None
        }
    }
}

#[tokio::test]
async fn test_redis_cache_operations() {
    let config = isolated_config();
    let Some(backend) = backend(&config).await else {
        return;
    };
    let cache = backend.cache;

    cache.set("a:1", &1, None).await.unwrap();
    cache.set("a:2", &2, None).await.unwrap();
    cache.set("b:1", &3, None).await.unwrap();

    let values: Vec<i32> = cache.get_like("a:*").await.unwrap();
    assert_eq!(values, vec![1, 2]);
    assert_eq!(cache.pop::<i32>("b:1").await.unwrap(), Some(3));
    assert!(!cache.has("b:1").await.unwrap());

    cache
        .set("short", &"lived", Some(Duration::from_millis(100)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(cache.get::<String>("short").await.unwrap(), None);

    let popped: Vec<i32> = cache.pop_like("a:*").await.unwrap();
    assert_eq!(popped.len(), 2);
}

#[tokio::test]
async fn test_redis_lock_counts() {
    let config = isolated_config();
    let Some(backend) = backend(&config).await else {
        return;
    };
    let locks = backend.locks;

    let mut first = locks.lock(LockId::new(1)).await.unwrap();
    let mut second = locks.try_lock(LockId::new(2)).await.unwrap().unwrap();
    assert_eq!(locks.held_count().await.unwrap(), 2);
    assert!(locks.try_lock(LockId::new(2)).await.unwrap().is_none());

    assert!(first.unlock().await);
    assert!(second.unlock().await);
    assert_eq!(locks.held_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_redis_bus_ping_pong() {
    let config = isolated_config();
    let Some(backend) = backend(&config).await else {
        return;
    };
    let requester = Bus::connect(backend.clone(), config.clone()).await.unwrap();
    let responder = Bus::connect(backend, config).await.unwrap();
    assert_eq!(requester.overflow_threshold(), None);

    let channel = format!("test_chan2_{}", Uuid::new_v4().simple());
    let chan = responder.subscribe(&channel).await.unwrap();
    chan.handle("ping", |msg: Envelope| async move {
        Outcome::Reply(msg.reply("pong").with_data("test", json!("received")))
    });

    let reply = requester
        .publish_wait(&channel, Envelope::new("ping"), Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(reply.message_type, "pong");
    assert_eq!(reply.data["test"], json!("received"));

    requester.close().await;
    responder.close().await;
}

#[tokio::test]
async fn test_redis_ping_on_subscribed_connection() {
    let pubsub = match RedisPubSub::connect(&redis_url()).await {
        Ok(pubsub) => pubsub,
        Err(e) => {
            warn!("Skipping Redis test (not available): {}", e);
            return;
        }
    };
    let channel = format!("keepalive_{}", Uuid::new_v4().simple());
    let mut receiver = pubsub.listen(&channel).await.unwrap();

    receiver.ping().await.unwrap();

    // The ping reply must not surface as a channel message
    pubsub.notify(&channel, "after-ping").await.unwrap();
    let payload = tokio::time::timeout(Duration::from_secs(2), receiver.recv())
        .await
        .expect("message delivered after ping")
        .unwrap();
    assert_eq!(payload.as_deref(), Some("after-ping"));

    receiver.reconnect().await.unwrap();
    receiver.ping().await.unwrap();
}
