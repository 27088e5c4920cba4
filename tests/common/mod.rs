//! Shared helpers for bus integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tasker_bus::bus::providers::InMemoryPubSub;
use tasker_bus::cache::providers::InMemoryCacheStore;
use tasker_bus::config::{BusConfig, CacheConfig, KeepaliveConfig};
use tasker_bus::lock::providers::InMemoryLockManager;
use tasker_bus::{Bus, BusBackend, Cache};

/// Fast probes and reconnects, no background sweep
pub fn test_config() -> BusConfig {
    BusConfig {
        keepalive: KeepaliveConfig {
            probe_interval_ms: Some(50),
            reconnect_max_attempts: 3,
            reconnect_initial_backoff_ms: 10,
            reconnect_max_backoff_ms: 40,
            ..KeepaliveConfig::default()
        },
        cache: CacheConfig {
            sweep_interval_seconds: 0,
            ..CacheConfig::default()
        },
        ..BusConfig::default()
    }
}

/// Keep-alive probes effectively off, for tests that must not race a probe
pub fn quiet_config() -> BusConfig {
    BusConfig {
        cache: CacheConfig {
            sweep_interval_seconds: 0,
            ..CacheConfig::default()
        },
        ..BusConfig::default()
    }
}

pub async fn in_memory_bus() -> Bus {
    Bus::connect(BusBackend::in_memory(), quiet_config())
        .await
        .expect("in-memory bus connects")
}

/// Two buses sharing one in-memory backend, like two nodes of a deployment
pub async fn bus_pair(config: BusConfig) -> (Bus, Bus, BusBackend) {
    let backend = BusBackend::in_memory();
    let first = Bus::connect(backend.clone(), config.clone())
        .await
        .expect("first bus connects");
    let second = Bus::connect(backend.clone(), config)
        .await
        .expect("second bus connects");
    (first, second, backend)
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// In-memory backend plus a handle on its hub for failure injection
pub fn backend_with_hub() -> (BusBackend, InMemoryPubSub) {
    let hub = InMemoryPubSub::new();
    let backend = BusBackend::new(
        Arc::new(hub.clone()),
        Cache::new(InMemoryCacheStore::new()),
        Arc::new(InMemoryLockManager::new()),
    );
    (backend, hub)
}
