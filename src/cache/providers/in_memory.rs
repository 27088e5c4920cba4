//! In-memory cache provider
//!
//! Process-local store for tests and single-process development. **Not
//! distributed**: every process keeps its own entries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;
use tracing::debug;

use crate::cache::pattern;
use crate::cache::traits::CacheStore;
use crate::cache::CacheEntry;
use crate::error::{BusError, BusResult};

/// In-memory cache store backed by a `DashMap`
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    entries: DashMap<String, CacheEntry>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of physically stored entries, expired ones included (for testing)
    pub fn stored_len(&self) -> usize {
        self.entries.len()
    }

    fn expiry(key: &str, ttl: Option<Duration>) -> BusResult<Option<DateTime<Utc>>> {
        ttl.map(|ttl| {
            chrono::Duration::from_std(ttl)
                .map(|ttl| Utc::now() + ttl)
                .map_err(|e| BusError::cache("set", key, e))
        })
        .transpose()
    }

    fn live_keys(&self, pattern: &str) -> Vec<String> {
        let now = Utc::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| !entry.is_expired_at(now) && pattern::matches(pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn set(&self, key: &str, document: &str, ttl: Option<Duration>) -> BusResult<()> {
        let entry = CacheEntry {
            key: key.to_string(),
            value: document.to_string(),
            expire_at: Self::expiry(key, ttl)?,
            updated_at: Utc::now(),
        };
        self.entries.insert(key.to_string(), entry);
        debug!(key = key, ttl_ms = ttl.map(|t| t.as_millis() as u64), "Cache SET (in_memory)");
        Ok(())
    }

    async fn get(&self, key: &str) -> BusResult<Option<String>> {
        Ok(self.entry(key).await?.map(|entry| entry.value))
    }

    async fn has(&self, key: &str) -> BusResult<bool> {
        Ok(self.entry(key).await?.is_some())
    }

    async fn pop(&self, key: &str) -> BusResult<Option<String>> {
        let now = Utc::now();
        Ok(self
            .entries
            .remove(key)
            .filter(|(_, entry)| !entry.is_expired_at(now))
            .map(|(_, entry)| entry.value))
    }

    async fn get_like(&self, pattern: &str) -> BusResult<Vec<String>> {
        let mut documents = Vec::new();
        for key in self.live_keys(pattern) {
            if let Some(document) = self.get(&key).await? {
                documents.push(document);
            }
        }
        Ok(documents)
    }

    async fn pop_like(&self, pattern: &str) -> BusResult<Vec<String>> {
        let mut documents = Vec::new();
        for key in self.live_keys(pattern) {
            if let Some(document) = self.pop(&key).await? {
                documents.push(document);
            }
        }
        Ok(documents)
    }

    async fn delete(&self, key: &str) -> BusResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn entry(&self, key: &str) -> BusResult<Option<CacheEntry>> {
        let now = Utc::now();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| entry.value().clone()))
    }

    async fn sweep_expired(&self) -> BusResult<u64> {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired_at(now));
        let removed = before.saturating_sub(self.entries.len()) as u64;
        if removed > 0 {
            debug!(removed = removed, "Swept expired cache entries (in_memory)");
        }
        Ok(removed)
    }

    async fn health_check(&self) -> BusResult<bool> {
        Ok(true)
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}
