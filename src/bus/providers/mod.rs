//! Pub/sub transport providers

pub mod in_memory;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryPubSub;

#[cfg(feature = "postgres")]
pub use self::postgres::PgPubSub;

#[cfg(feature = "redis")]
pub use self::redis::RedisPubSub;
