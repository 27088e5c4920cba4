//! # PostgreSQL LISTEN/NOTIFY Transport
//!
//! Publishing is `SELECT pg_notify($1, $2)` on the pool. Every subscription
//! gets its own dedicated [`PgListener`] connection. `NOTIFY` payloads are
//! limited to 8000 bytes, which is the default overflow threshold of a bus
//! running on this backend.

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tracing::debug;

use crate::bus::traits::{ChannelReceiver, PubSubBackend};
use crate::config::PG_NOTIFY_MAX_PAYLOAD;
use crate::error::{BusError, BusResult};

/// Pub/sub over PostgreSQL notifications
#[derive(Debug, Clone)]
pub struct PgPubSub {
    pool: PgPool,
}

impl PgPubSub {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn connect_listener(&self, channel: &str) -> BusResult<PgListener> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| BusError::subscribe(channel, e))?;
        listener
            .listen(channel)
            .await
            .map_err(|e| BusError::subscribe(channel, e))?;
        Ok(listener)
    }
}

#[async_trait]
impl PubSubBackend for PgPubSub {
    async fn listen(&self, channel: &str) -> BusResult<Box<dyn ChannelReceiver>> {
        let listener = self.connect_listener(channel).await?;
        debug!(channel = %channel, "LISTEN issued");

        Ok(Box::new(PgChannelReceiver {
            pubsub: self.clone(),
            channel: channel.to_string(),
            listener,
        }))
    }

    async fn notify(&self, channel: &str, payload: &str) -> BusResult<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(|e| BusError::publish(channel, e))?;
        Ok(())
    }

    fn max_payload_bytes(&self) -> Option<usize> {
        Some(PG_NOTIFY_MAX_PAYLOAD)
    }

    fn provider_name(&self) -> &'static str {
        "postgres"
    }
}

struct PgChannelReceiver {
    pubsub: PgPubSub,
    channel: String,
    listener: PgListener,
}

#[async_trait]
impl ChannelReceiver for PgChannelReceiver {
    async fn recv(&mut self) -> BusResult<Option<String>> {
        // try_recv reports a lost connection as None instead of silently reconnecting
        match self.listener.try_recv().await {
            Ok(Some(notification)) => Ok(Some(notification.payload().to_string())),
            Ok(None) => Ok(None),
            Err(e) => Err(BusError::connection("listen", e)),
        }
    }

    async fn ping(&mut self) -> BusResult<()> {
        sqlx::query("SELECT 1")
            .execute(&mut self.listener)
            .await
            .map_err(|e| BusError::connection("ping", e))?;
        Ok(())
    }

    async fn reconnect(&mut self) -> BusResult<()> {
        self.listener = self.pubsub.connect_listener(&self.channel).await?;
        Ok(())
    }
}
