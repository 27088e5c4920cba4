//! Cache store providers

pub mod in_memory;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryCacheStore;

#[cfg(feature = "postgres")]
pub use self::postgres::PgCacheStore;

#[cfg(feature = "redis")]
pub use self::redis::RedisCacheStore;
