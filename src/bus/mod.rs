//! # Pub/Sub Bus
//!
//! Channel-based publish/subscribe with request/reply correlation on top of a
//! [`PubSubBackend`]. Every bus owns a default channel: replies to its
//! requests come back there, and publishing to it dispatches locally without
//! a backend round trip.
//!
//! ```rust,no_run
//! use tasker_bus::{Bus, BusBackend, BusConfig, Envelope, Outcome};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn example() -> tasker_bus::BusResult<()> {
//! let bus = Bus::connect(BusBackend::in_memory(), BusConfig::default()).await?;
//! let orders = bus.subscribe("orders").await?;
//! orders.handle("ping", |msg: Envelope| async move {
//!     Outcome::Reply(msg.reply("pong").with_data("test", json!("received")))
//! });
//!
//! let reply = bus
//!     .publish_wait("orders", Envelope::new("ping"), Some(Duration::from_secs(2)))
//!     .await?;
//! assert_eq!(reply.message_type, "pong");
//! bus.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Oversized payloads
//!
//! An envelope whose serialized form exceeds the overflow threshold is stored
//! in the [`Cache`] under its request id and replaced on the wire by a stub.
//! Receivers pop the full envelope before dispatch, so handlers never see the
//! difference. Because the pop removes the entry, only one receiver of a
//! channel observes an overflowed message.

pub mod handler;
pub mod providers;
pub mod subscription;
pub mod traits;

pub use handler::MessageHandler;
pub use subscription::{KeepalivePolicy, Subscription, SubscriptionState, SubscriptionStats};
pub use traits::{ChannelReceiver, PubSubBackend};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::BusBackend;
use crate::cache::{Cache, CacheSweeper};
use crate::config::BusConfig;
use crate::envelope::{Envelope, Outcome};
use crate::error::{BusError, BusResult};
use crate::lock::LockManager;
use subscription::SubscriptionShared;

/// State shared by the [`Bus`] handle, receive loops and dispatch tasks
pub(crate) struct BusCore {
    pub(crate) backend: Arc<dyn PubSubBackend>,
    pub(crate) cache: Cache,
    locks: Arc<dyn LockManager>,
    config: BusConfig,
    keepalive: KeepalivePolicy,
    default_channel: String,
    overflow_threshold: Option<usize>,
    subscriptions: Mutex<HashMap<String, Arc<Subscription>>>,
    pub(crate) shutdown: watch::Sender<bool>,
}

impl BusCore {
    fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn subscription(&self, channel: &str) -> Option<Arc<Subscription>> {
        self.subscriptions.lock().get(channel).cloned()
    }

    async fn subscribe(self: &Arc<Self>, channel: &str) -> BusResult<Arc<Subscription>> {
        if channel.is_empty() {
            return Err(BusError::invalid_channel("channel name cannot be empty"));
        }
        if self.is_closed() {
            return Err(BusError::closed(channel));
        }

        // The previous receive loop is fully stopped before the new one listens
        let previous = {
            let mut subscriptions = self.subscriptions.lock();
            let previous = subscriptions.remove(channel);
            if let Some(old) = &previous {
                old.signal_close();
            }
            previous
        };
        if let Some(old) = previous {
            debug!(channel = %channel, "Replacing existing subscription");
            old.close().await;
        }

        let subscription = Subscription::open(self, channel, self.keepalive).await?;

        // A concurrent subscribe to the same channel may have won the slot meanwhile
        let raced = self
            .subscriptions
            .lock()
            .insert(channel.to_string(), Arc::clone(&subscription));
        if let Some(other) = raced {
            other.close().await;
        }

        info!(
            channel = %channel,
            provider = self.backend.provider_name(),
            "Subscribed"
        );
        Ok(subscription)
    }

    async fn publish(self: &Arc<Self>, channel: &str, mut message: Envelope) -> BusResult<()> {
        if channel.is_empty() {
            return Err(BusError::invalid_channel("channel name cannot be empty"));
        }
        if message.message_type.is_empty() {
            debug!(channel = %channel, "Ignoring message without a type");
            return Ok(());
        }
        if self.is_closed() {
            return Err(BusError::closed(channel));
        }

        message.set_from_channel(&self.default_channel);

        if channel == self.default_channel {
            if let Some(subscription) = self.subscription(channel) {
                let request_id = message.request_id.clone();
                // Own task, as on the backend path; a handler panic ends at the JoinHandle
                let dispatch =
                    tokio::spawn(Arc::clone(self).dispatch(subscription.shared(), message));
                if let Err(e) = dispatch.await {
                    warn!(
                        channel = %channel,
                        request_id = %request_id,
                        error = %e,
                        "Local dispatch ended abnormally"
                    );
                }
                return Ok(());
            }
        }

        let mut payload = message.encode()?;
        if let Some(threshold) = self.overflow_threshold {
            if payload.len() > threshold {
                self.cache
                    .set(
                        &message.request_id,
                        &message,
                        Some(self.config.overflow_ttl()),
                    )
                    .await?;
                debug!(
                    channel = %channel,
                    request_id = %message.request_id,
                    size = payload.len(),
                    threshold,
                    "Payload overflowed to cache"
                );
                payload = message.overflow_stub().encode()?;
            }
        }

        self.backend.notify(channel, &payload).await
    }

    /// Route one message to its reply handler or type handler
    ///
    /// Boxed so local dispatch inside `publish` does not make the future type recursive.
    pub(crate) fn dispatch(
        self: Arc<Self>,
        subscription: Arc<SubscriptionShared>,
        message: Envelope,
    ) -> BoxFuture<'static, ()> {
        async move {
            subscription.record_dispatch();

            if message.is_reply() {
                if let Some(reply_handler) =
                    subscription.handlers.take_reply(&message.orig_request_id)
                {
                    let outcome = reply_handler(message.clone()).await;
                    self.route_outcome(outcome, &message).await;
                    return;
                }
            }

            match subscription.handlers.handler(&message.message_type) {
                Some(handler) => {
                    let outcome = handler.handle(message.clone()).await;
                    self.route_outcome(outcome, &message).await;
                }
                None if message.is_no_reply() => {}
                None => {
                    subscription.record_unhandled();
                    warn!(
                        channel = %subscription.channel,
                        message_type = %message.message_type,
                        request_id = %message.request_id,
                        "No handler registered for message type"
                    );
                }
            }
        }
        .boxed()
    }

    async fn route_outcome(self: &Arc<Self>, outcome: Outcome, request: &Envelope) {
        let Some(reply) = outcome.into_reply(request) else {
            return;
        };

        let destination = reply
            .to_channel()
            .or_else(|| request.from_channel())
            .map(str::to_string);

        match destination {
            Some(channel) => {
                if let Err(e) = self.publish(&channel, reply).await {
                    warn!(
                        channel = %channel,
                        request_id = %request.request_id,
                        error = %e,
                        "Failed to route reply"
                    );
                }
            }
            None => debug!(
                request_id = %request.request_id,
                "Reply has no destination channel; dropping"
            ),
        }
    }

    fn signal_shutdown(&self) -> bool {
        let was_closed = self.shutdown.send_replace(true);
        for subscription in self.subscriptions.lock().values() {
            subscription.signal_close();
        }
        was_closed
    }
}

/// Distributed message bus with cache and lock manager
pub struct Bus {
    core: Arc<BusCore>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("default_channel", &self.core.default_channel)
            .field("provider", &self.core.backend.provider_name())
            .field("overflow_threshold", &self.core.overflow_threshold)
            .field("channels", &self.channels())
            .finish()
    }
}

impl Bus {
    /// Connect the bus and open its default subscription
    pub async fn connect(backend: BusBackend, config: BusConfig) -> BusResult<Self> {
        config.validate()?;

        let BusBackend {
            pubsub,
            cache,
            locks,
        } = backend;

        let default_channel = config.resolve_default_channel();
        let overflow_threshold = config
            .overflow_threshold_bytes
            .or_else(|| pubsub.max_payload_bytes());
        let keepalive = KeepalivePolicy::from(&config.keepalive);
        let sweep_interval = config.cache.sweep_interval();
        let (shutdown, _) = watch::channel(false);

        let core = Arc::new(BusCore {
            backend: pubsub,
            cache,
            locks,
            config,
            keepalive,
            default_channel,
            overflow_threshold,
            subscriptions: Mutex::new(HashMap::new()),
            shutdown,
        });

        core.subscribe(&core.default_channel).await?;

        let sweeper = sweep_interval.map(|interval| {
            CacheSweeper::spawn(
                core.cache.clone(),
                Some(Arc::clone(&core.locks)),
                interval,
                core.shutdown.subscribe(),
            )
        });

        info!(
            default_channel = %core.default_channel,
            provider = core.backend.provider_name(),
            cache_provider = core.cache.provider_name(),
            lock_provider = core.locks.provider_name(),
            overflow_threshold = ?core.overflow_threshold,
            "Bus connected"
        );

        Ok(Self {
            core,
            sweeper: Mutex::new(sweeper),
        })
    }

    /// Connect using the in-memory backend; messages stay inside this process
    pub async fn in_memory(config: BusConfig) -> BusResult<Self> {
        Self::connect(BusBackend::in_memory(), config).await
    }

    /// Channel this bus receives replies on
    pub fn default_channel(&self) -> &str {
        &self.core.default_channel
    }

    pub fn config(&self) -> &BusConfig {
        &self.core.config
    }

    /// Serialized size above which envelopes travel through the cache
    pub fn overflow_threshold(&self) -> Option<usize> {
        self.core.overflow_threshold
    }

    pub fn cache(&self) -> &Cache {
        &self.core.cache
    }

    pub fn locks(&self) -> &Arc<dyn LockManager> {
        &self.core.locks
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Publish `message` to `channel` without waiting for a reply
    ///
    /// An empty channel is an error; a message with an empty type is ignored.
    pub async fn publish(&self, channel: &str, message: Envelope) -> BusResult<()> {
        self.core.publish(channel, message).await
    }

    /// Publish `message` and wait for its correlated reply
    ///
    /// `timeout` defaults to `publish_wait_timeout_ms`. The reply handler is
    /// removed whether the reply arrives or not.
    pub async fn publish_wait(
        &self,
        channel: &str,
        message: Envelope,
        timeout: Option<Duration>,
    ) -> BusResult<Envelope> {
        let timeout = timeout.unwrap_or_else(|| self.core.config.publish_wait_timeout());
        let subscription = self.default_subscription()?;
        let request_id = message.request_id.clone();

        let (reply_tx, reply_rx) = oneshot::channel();
        subscription.on_reply(request_id.clone(), timeout, move |reply: Envelope| async move {
            let _ = reply_tx.send(reply);
            Outcome::NoReply
        });

        let timed_out = || {
            BusError::reply_timeout(request_id.clone(), channel, timeout.as_millis() as u64)
        };

        // Local dispatch on the default channel runs inside publish, so the
        // deadline has to cover the publish as well as the wait
        let exchange = async {
            self.core.publish(channel, message).await?;
            reply_rx.await.map_err(|_| timed_out())
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                subscription.remove_reply(&request_id);
                Err(e)
            }
            Err(_) => {
                subscription.remove_reply(&request_id);
                Err(timed_out())
            }
        }
    }

    /// Subscribe to `channel`, replacing any existing subscription to it
    pub async fn subscribe(&self, channel: &str) -> BusResult<Arc<Subscription>> {
        self.core.subscribe(channel).await
    }

    /// Close and forget the subscription to `channel`
    pub async fn unsubscribe(&self, channel: &str) -> bool {
        let removed = self.core.subscriptions.lock().remove(channel);
        match removed {
            Some(subscription) => {
                subscription.close().await;
                info!(channel = %channel, "Unsubscribed");
                true
            }
            None => false,
        }
    }

    pub fn subscription(&self, channel: &str) -> Option<Arc<Subscription>> {
        self.core.subscription(channel)
    }

    /// Subscribed channel names, sorted
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.core.subscriptions.lock().keys().cloned().collect();
        channels.sort();
        channels
    }

    fn default_subscription(&self) -> BusResult<Arc<Subscription>> {
        self.core
            .subscription(&self.core.default_channel)
            .ok_or_else(|| BusError::closed(self.core.default_channel.clone()))
    }

    /// Register a type handler on the default channel
    pub fn handle<H: MessageHandler>(
        &self,
        message_type: impl Into<String>,
        handler: H,
    ) -> BusResult<()> {
        self.default_subscription()?.handle(message_type, handler);
        Ok(())
    }

    /// Register a one-shot reply handler on the default channel
    pub fn on_reply<F, Fut>(
        &self,
        request_id: impl Into<String>,
        timeout: Duration,
        handler: F,
    ) -> BusResult<()>
    where
        F: FnOnce(Envelope) -> Fut + Send + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        self.default_subscription()?
            .on_reply(request_id, timeout, handler);
        Ok(())
    }

    /// Close every subscription and stop background tasks; idempotent
    pub async fn close(&self) {
        if self.core.signal_shutdown() {
            return;
        }

        let subscriptions: Vec<Arc<Subscription>> = self
            .core
            .subscriptions
            .lock()
            .drain()
            .map(|(_, subscription)| subscription)
            .collect();
        for subscription in subscriptions {
            subscription.close().await;
        }

        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }

        info!(default_channel = %self.core.default_channel, "Bus closed");
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        self.core.signal_shutdown();
    }
}
