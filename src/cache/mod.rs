//! # Key-Value Cache Store
//!
//! Durable key/value storage with optional expiry, used directly by callers
//! and internally by the bus for payload overflow.
//!
//! [`CacheStore`] providers hold serialized JSON documents. [`Cache`] is the
//! typed facade: it serializes values on the way in and reports malformed
//! documents as [`BusError::Decode`] on the way out. Documents are always JSON
//! objects; a scalar is stored wrapped as `{"__value__": <scalar>}`.
//!
//! ```rust
//! use tasker_bus::cache::{Cache, providers::InMemoryCacheStore};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let cache = Cache::new(InMemoryCacheStore::new());
//! cache.set("greeting", &"hello", Some(Duration::from_secs(30))).await?;
//! assert_eq!(cache.get::<String>("greeting").await?, Some("hello".to_string()));
//! assert_eq!(cache.pop::<String>("greeting").await?, Some("hello".to_string()));
//! assert!(!cache.has("greeting").await?);
//! # Ok::<(), tasker_bus::BusError>(())
//! # }).unwrap();
//! ```

pub mod pattern;
pub mod providers;
pub mod sweeper;
pub mod traits;

pub use sweeper::CacheSweeper;
pub use traits::CacheStore;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{BusError, BusResult};

/// Key under which scalar values are wrapped
pub const SCALAR_KEY: &str = "__value__";

/// A live cache entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    /// Serialized JSON document
    pub value: String,
    pub expire_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Whether the entry is logically gone at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expire_at.is_some_and(|at| at <= now)
    }
}

/// Typed facade over a [`CacheStore`]
#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn CacheStore>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("provider", &self.store.provider_name())
            .finish()
    }
}

impl Cache {
    pub fn new<S: CacheStore>(store: S) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    pub fn from_store(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn provider_name(&self) -> &'static str {
        self.store.provider_name()
    }

    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> BusResult<()> {
        let document = encode_document(key, value)?;
        self.store.set(key, &document, ttl).await
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> BusResult<Option<T>> {
        match self.store.get(key).await? {
            Some(document) => decode_document(key, &document).map(Some),
            None => Ok(None),
        }
    }

    pub async fn has(&self, key: &str) -> BusResult<bool> {
        self.store.has(key).await
    }

    pub async fn pop<T: DeserializeOwned>(&self, key: &str) -> BusResult<Option<T>> {
        match self.store.pop(key).await? {
            Some(document) => decode_document(key, &document).map(Some),
            None => Ok(None),
        }
    }

    pub async fn get_like<T: DeserializeOwned>(&self, pattern: &str) -> BusResult<Vec<T>> {
        self.store
            .get_like(pattern)
            .await?
            .iter()
            .map(|document| decode_document(pattern, document))
            .collect()
    }

    pub async fn pop_like<T: DeserializeOwned>(&self, pattern: &str) -> BusResult<Vec<T>> {
        self.store
            .pop_like(pattern)
            .await?
            .iter()
            .map(|document| decode_document(pattern, document))
            .collect()
    }

    pub async fn delete(&self, key: &str) -> BusResult<bool> {
        self.store.delete(key).await
    }

    pub async fn entry(&self, key: &str) -> BusResult<Option<CacheEntry>> {
        self.store.entry(key).await
    }

    pub async fn sweep_expired(&self) -> BusResult<u64> {
        self.store.sweep_expired().await
    }

    pub async fn health_check(&self) -> BusResult<bool> {
        self.store.health_check().await
    }
}

/// Serialize a value into a cache document, wrapping non-objects
pub fn encode_document<T: Serialize + ?Sized>(key: &str, value: &T) -> BusResult<String> {
    let value = serde_json::to_value(value).map_err(|e| BusError::encode(key, e))?;
    let document = match value {
        Value::Object(map) => Value::Object(map),
        scalar => {
            let mut map = Map::new();
            map.insert(SCALAR_KEY.to_string(), scalar);
            Value::Object(map)
        }
    };
    serde_json::to_string(&document).map_err(|e| BusError::encode(key, e))
}

/// Decode a cache document, unwrapping scalars
pub fn decode_document<T: DeserializeOwned>(key: &str, document: &str) -> BusResult<T> {
    let value: Value = serde_json::from_str(document)
        .map_err(|e| BusError::decode(format!("cache document {key}"), e))?;
    let value = match value {
        Value::Object(mut map) if map.len() == 1 && map.contains_key(SCALAR_KEY) => {
            map.remove(SCALAR_KEY).unwrap_or(Value::Null)
        }
        other => other,
    };
    serde_json::from_value(value).map_err(|e| BusError::decode(format!("cache document {key}"), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalars_are_wrapped() {
        assert_eq!(encode_document("k", &42).unwrap(), r#"{"__value__":42}"#);
        assert_eq!(
            encode_document("k", &"text").unwrap(),
            r#"{"__value__":"text"}"#
        );
        assert_eq!(
            encode_document("k", &vec![1, 2]).unwrap(),
            r#"{"__value__":[1,2]}"#
        );
        assert_eq!(encode_document("k", &json!({"a": 1})).unwrap(), r#"{"a":1}"#);
    }

    #[test]
    fn test_decode_unwraps_scalars_only() {
        assert_eq!(decode_document::<i32>("k", r#"{"__value__":42}"#).unwrap(), 42);

        let map: Value = decode_document("k", r#"{"__value__":1,"other":2}"#).unwrap();
        assert_eq!(map["other"], 2);
    }

    #[test]
    fn test_malformed_documents_are_decode_errors() {
        let err = decode_document::<Value>("broken", "{not json").unwrap_err();
        assert!(matches!(err, BusError::Decode { .. }));

        let err = decode_document::<u32>("typed", r#"{"__value__":"nope"}"#).unwrap_err();
        assert!(matches!(err, BusError::Decode { .. }));
    }

    #[test]
    fn test_entry_expiry() {
        let now = Utc::now();
        let mut entry = CacheEntry {
            key: "k".into(),
            value: "{}".into(),
            expire_at: None,
            updated_at: now,
        };
        assert!(!entry.is_expired_at(now));
        entry.expire_at = Some(now - chrono::Duration::seconds(1));
        assert!(entry.is_expired_at(now));
    }
}
