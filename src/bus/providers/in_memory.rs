//! # In-Memory Pub/Sub
//!
//! Broadcast channels inside one process, for tests and single-process
//! development. Clones of an [`InMemoryPubSub`] share the same hub, so several
//! buses built from clones talk to each other like separate nodes would.
//!
//! The hub can be made unavailable with [`InMemoryPubSub::set_healthy`] and
//! can drop every listener with [`InMemoryPubSub::disconnect_all`], which
//! lets tests drive the probe and reconnect paths of a subscription.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::bus::traits::{ChannelReceiver, PubSubBackend};
use crate::error::{BusError, BusResult};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug)]
struct MemoryHub {
    channels: DashMap<String, broadcast::Sender<String>>,
    healthy: AtomicBool,
    capacity: usize,
}

impl MemoryHub {
    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn receiver(&self, channel: &str) -> broadcast::Receiver<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}

/// Process-local pub/sub backend
#[derive(Debug, Clone)]
pub struct InMemoryPubSub {
    hub: Arc<MemoryHub>,
}

impl Default for InMemoryPubSub {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a hub whose channels buffer up to `capacity` undelivered payloads per listener
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            hub: Arc::new(MemoryHub {
                channels: DashMap::new(),
                healthy: AtomicBool::new(true),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Make every operation fail (false) or succeed again (true)
    pub fn set_healthy(&self, healthy: bool) {
        self.hub.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Drop every channel, disconnecting all listeners
    pub fn disconnect_all(&self) {
        self.hub.channels.clear();
        debug!("In-memory hub dropped all listeners");
    }

    /// Number of open listeners on `channel`
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.hub
            .channels
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl PubSubBackend for InMemoryPubSub {
    async fn listen(&self, channel: &str) -> BusResult<Box<dyn ChannelReceiver>> {
        if !self.hub.is_healthy() {
            return Err(BusError::subscribe(channel, "in-memory hub unavailable"));
        }

        Ok(Box::new(InMemoryReceiver {
            hub: Arc::clone(&self.hub),
            channel: channel.to_string(),
            receiver: self.hub.receiver(channel),
        }))
    }

    async fn notify(&self, channel: &str, payload: &str) -> BusResult<()> {
        if !self.hub.is_healthy() {
            return Err(BusError::publish(channel, "in-memory hub unavailable"));
        }

        // Like NOTIFY, a channel without listeners silently drops the payload
        if let Some(sender) = self.hub.channels.get(channel) {
            let _ = sender.send(payload.to_string());
        }
        Ok(())
    }

    fn max_payload_bytes(&self) -> Option<usize> {
        None
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}

struct InMemoryReceiver {
    hub: Arc<MemoryHub>,
    channel: String,
    receiver: broadcast::Receiver<String>,
}

#[async_trait]
impl ChannelReceiver for InMemoryReceiver {
    async fn recv(&mut self) -> BusResult<Option<String>> {
        loop {
            match self.receiver.recv().await {
                Ok(payload) => return Ok(Some(payload)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.channel, skipped, "In-memory listener lagged; payloads dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }

    async fn ping(&mut self) -> BusResult<()> {
        if self.hub.is_healthy() {
            Ok(())
        } else {
            Err(BusError::connection("ping", "in-memory hub unavailable"))
        }
    }

    async fn reconnect(&mut self) -> BusResult<()> {
        if !self.hub.is_healthy() {
            return Err(BusError::connection("reconnect", "in-memory hub unavailable"));
        }
        self.receiver = self.hub.receiver(&self.channel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notify_reaches_every_listener() {
        let pubsub = InMemoryPubSub::new();
        let mut first = pubsub.listen("chan").await.unwrap();
        let mut second = pubsub.listen("chan").await.unwrap();
        assert_eq!(pubsub.subscriber_count("chan"), 2);

        pubsub.notify("chan", "hello").await.unwrap();
        assert_eq!(first.recv().await.unwrap().as_deref(), Some("hello"));
        assert_eq!(second.recv().await.unwrap().as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_notify_without_listeners_is_dropped() {
        let pubsub = InMemoryPubSub::new();
        pubsub.notify("nobody", "lost").await.unwrap();
        assert_eq!(pubsub.subscriber_count("nobody"), 0);
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect() {
        let pubsub = InMemoryPubSub::new();
        let mut receiver = pubsub.listen("chan").await.unwrap();

        pubsub.disconnect_all();
        assert_eq!(receiver.recv().await.unwrap(), None);

        pubsub.set_healthy(false);
        assert!(receiver.ping().await.is_err());
        assert!(receiver.reconnect().await.is_err());
        assert!(matches!(pubsub.listen("chan").await, Err(e) if e.is_setup()));

        pubsub.set_healthy(true);
        receiver.reconnect().await.unwrap();
        pubsub.notify("chan", "again").await.unwrap();
        assert_eq!(receiver.recv().await.unwrap().as_deref(), Some("again"));
    }
}
