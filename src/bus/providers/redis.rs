//! # Redis Pub/Sub Transport
//!
//! Publishing goes through a shared `ConnectionManager`; each subscription
//! opens its own `PubSub` connection. Redis places no practical limit on
//! message size, so overflow stays off unless configured.
//!
//! Liveness pings go over the subscribed connection itself, so a half-dead
//! subscriber socket fails the ping even while publishing works.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use tracing::{debug, warn};

use crate::bus::traits::{ChannelReceiver, PubSubBackend};
use crate::cache::providers::redis::redact_url;
use crate::error::{BusError, BusResult};

/// Pub/sub over Redis `PUBLISH`/`SUBSCRIBE`
#[derive(Clone)]
pub struct RedisPubSub {
    client: redis::Client,
    connection_manager: ConnectionManager,
}

impl std::fmt::Debug for RedisPubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPubSub")
            .field("connection_manager", &"ConnectionManager")
            .finish()
    }
}

impl RedisPubSub {
    pub fn new(client: redis::Client, connection_manager: ConnectionManager) -> Self {
        Self {
            client,
            connection_manager,
        }
    }

    pub async fn connect(url: &str) -> BusResult<Self> {
        let client =
            redis::Client::open(url).map_err(|e| BusError::connection("redis client", e))?;
        let connection_manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BusError::connection("redis connect", e))?;

        debug!(url = %redact_url(url), "Redis pub/sub connected");
        Ok(Self::new(client, connection_manager))
    }

    pub fn connection_manager(&self) -> &ConnectionManager {
        &self.connection_manager
    }

    async fn subscribe(&self, channel: &str) -> BusResult<PubSub> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::subscribe(channel, e))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| BusError::subscribe(channel, e))?;
        Ok(pubsub)
    }
}

#[async_trait]
impl PubSubBackend for RedisPubSub {
    async fn listen(&self, channel: &str) -> BusResult<Box<dyn ChannelReceiver>> {
        let pubsub = self.subscribe(channel).await?;
        debug!(channel = %channel, "SUBSCRIBE issued");

        Ok(Box::new(RedisChannelReceiver {
            backend: self.clone(),
            channel: channel.to_string(),
            pubsub,
        }))
    }

    async fn notify(&self, channel: &str, payload: &str) -> BusResult<()> {
        let mut conn = self.connection_manager.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::publish(channel, e))?;

        debug!(channel = %channel, receivers, "Published");
        Ok(())
    }

    fn max_payload_bytes(&self) -> Option<usize> {
        None
    }

    fn provider_name(&self) -> &'static str {
        "redis"
    }
}

struct RedisChannelReceiver {
    backend: RedisPubSub,
    channel: String,
    pubsub: PubSub,
}

#[async_trait]
impl ChannelReceiver for RedisChannelReceiver {
    async fn recv(&mut self) -> BusResult<Option<String>> {
        loop {
            let Some(message) = self.pubsub.on_message().next().await else {
                return Ok(None);
            };
            match message.get_payload::<String>() {
                Ok(payload) => return Ok(Some(payload)),
                Err(e) => warn!(channel = %self.channel, error = %e, "Skipping non-text payload"),
            }
        }
    }

    async fn ping(&mut self) -> BusResult<()> {
        // In subscribed mode the reply is an array, not a simple PONG
        let _: redis::Value = self
            .pubsub
            .ping()
            .await
            .map_err(|e| BusError::connection("ping", e))?;
        Ok(())
    }

    async fn reconnect(&mut self) -> BusResult<()> {
        self.pubsub = self.backend.subscribe(&self.channel).await?;
        Ok(())
    }
}
