#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Tasker Bus
//!
//! Distributed cache, pub/sub message bus and advisory locks for processes
//! sharing either a PostgreSQL database or a Redis server.
//!
//! ## Overview
//!
//! Every component is written against a provider trait, so application code
//! is identical whichever backend a deployment runs:
//!
//! | Concern   | Trait              | PostgreSQL               | Redis                 |
//! |-----------|--------------------|--------------------------|-----------------------|
//! | Pub/sub   | [`PubSubBackend`]  | `LISTEN` / `pg_notify`   | `SUBSCRIBE`/`PUBLISH` |
//! | Cache     | [`CacheStore`]     | `tasker_bus_cache` table | keys with `PX` expiry |
//! | Locks     | [`LockManager`]    | `pg_advisory_xact_lock`  | `SET NX PX` tokens    |
//!
//! In-memory providers of all three exist for tests and single-process use.
//!
//! ## Module Organization
//!
//! - [`bus`] - Channels, subscriptions, request/reply correlation
//! - [`cache`] - Key/value store with expiry and wildcard queries
//! - [`lock`] - Advisory locks over a fixed id namespace
//! - [`envelope`] - Wire format of bus messages
//! - [`backend`] - Per-backend wiring of the three providers
//! - [`config`] - Configuration management
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tasker_bus::{Bus, BusBackend, BusConfig, Envelope};
//! use serde_json::json;
//!
//! # async fn example() -> tasker_bus::BusResult<()> {
//! tasker_bus::logging::init_structured_logging();
//!
//! let config = BusConfig::load()?;
//! let bus = Bus::connect(BusBackend::from_config(&config).await?, config).await?;
//!
//! let chan = bus.subscribe("test_chan").await?;
//! chan.handle("test", |msg: Envelope| async move {
//!     println!("received {:?}", msg.data.get("payload"));
//!     tasker_bus::Outcome::NoReply
//! });
//!
//! bus.publish("test_chan", Envelope::new("test").with_data("payload", json!("1234567")))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test                                  # in-memory backend only
//! cargo test --features test-services         # also PostgreSQL and Redis
//! ```

pub mod backend;
pub mod bus;
pub mod cache;
pub mod config;
pub mod envelope;
pub mod error;
pub mod lock;
pub mod logging;

pub use backend::BusBackend;
pub use bus::{
    Bus, KeepalivePolicy, MessageHandler, PubSubBackend, Subscription, SubscriptionState,
    SubscriptionStats,
};
pub use cache::{Cache, CacheEntry, CacheStore};
pub use config::{BusConfig, ConfigLoader};
pub use envelope::{Envelope, Outcome};
pub use error::{BusError, BusResult};
pub use lock::{LockHandle, LockId, LockManager};
