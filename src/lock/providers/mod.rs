//! Lock manager providers

pub mod in_memory;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryLockManager;

#[cfg(feature = "postgres")]
pub use self::postgres::PgLockManager;

#[cfg(feature = "redis")]
pub use self::redis::RedisLockManager;
