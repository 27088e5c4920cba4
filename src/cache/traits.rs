//! Cache store trait definition

use async_trait::async_trait;
use std::time::Duration;

use super::CacheEntry;
use crate::error::BusResult;

/// Key/value storage of JSON documents with optional expiry
///
/// Implemented by the PostgreSQL, Redis and in-memory providers. Documents are
/// opaque serialized JSON; typed access goes through [`super::Cache`].
///
/// Every read applies the expiry check itself, so an entry past its
/// `expire_at` is absent even if no cleanup has run yet.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Insert or overwrite `key`; `ttl` schedules its removal
    async fn set(&self, key: &str, document: &str, ttl: Option<Duration>) -> BusResult<()>;

    /// Read a live document
    async fn get(&self, key: &str) -> BusResult<Option<String>>;

    /// Whether a live document exists
    async fn has(&self, key: &str) -> BusResult<bool>;

    /// Atomically read and delete; `None` when absent or expired
    async fn pop(&self, key: &str) -> BusResult<Option<String>>;

    /// Live documents whose key matches the wildcard pattern, ordered by key
    async fn get_like(&self, pattern: &str) -> BusResult<Vec<String>>;

    /// Read and delete every live document matching the pattern, ordered by key
    async fn pop_like(&self, pattern: &str) -> BusResult<Vec<String>>;

    /// Delete `key`; true when something was removed
    async fn delete(&self, key: &str) -> BusResult<bool>;

    /// Live entry with its bookkeeping timestamps
    async fn entry(&self, key: &str) -> BusResult<Option<CacheEntry>>;

    /// Physically remove expired entries, returning how many went
    async fn sweep_expired(&self) -> BusResult<u64>;

    /// Check if the cache backend is reachable
    async fn health_check(&self) -> BusResult<bool>;

    /// Get the name of the cache provider
    fn provider_name(&self) -> &'static str;
}
