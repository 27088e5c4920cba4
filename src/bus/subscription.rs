//! # Channel Subscription
//!
//! One subscription owns one backend connection listening on one channel and
//! the task that drains it. Its lifecycle is an explicit state machine:
//!
//! ```text
//! Opening -> Listening -> (Reconnecting -> Listening)* -> Closed
//! ```
//!
//! While listening, a receive that stays idle for a full probe interval
//! triggers a liveness ping; a failed ping closes the subscription. A dropped
//! connection goes through [`ReconnectPolicy`] before giving up.

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::handler::{HandlerRegistry, MessageHandler};
use super::traits::ChannelReceiver;
use super::BusCore;
use crate::config::{KeepaliveConfig, ReconnectPolicy};
use crate::envelope::{Envelope, Outcome};
use crate::error::{BusError, BusResult};
use crate::logging::{log_subscription_event, SubscriptionEvent};

/// Lifecycle state of a [`Subscription`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Opening,
    Listening,
    Reconnecting,
    Closed,
}

/// Counters of one subscription's receive loop
#[derive(Debug, Clone, Default)]
pub struct SubscriptionStats {
    pub notifications_received: u64,
    pub messages_dispatched: u64,
    pub decode_errors: u64,
    pub unhandled_messages: u64,
    pub overflow_resolved: u64,
    pub reconnects: u64,
    pub probes_sent: u64,
    pub last_message_at: Option<SystemTime>,
    pub last_error_at: Option<SystemTime>,
}

/// Probe interval and reconnect policy of a receive loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepalivePolicy {
    pub probe_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl From<&KeepaliveConfig> for KeepalivePolicy {
    fn from(config: &KeepaliveConfig) -> Self {
        Self {
            probe_interval: config.probe_interval(),
            reconnect: config.reconnect_policy(),
        }
    }
}

/// State shared between a [`Subscription`], its receive loop and dispatch tasks
pub(crate) struct SubscriptionShared {
    pub(crate) channel: String,
    pub(crate) provider: &'static str,
    pub(crate) handlers: Arc<HandlerRegistry>,
    state: RwLock<SubscriptionState>,
    stats: RwLock<SubscriptionStats>,
}

impl SubscriptionShared {
    fn set_state(&self, state: SubscriptionState) {
        *self.state.write() = state;
    }

    pub(crate) fn record_dispatch(&self) {
        let mut stats = self.stats.write();
        stats.messages_dispatched += 1;
        stats.last_message_at = Some(SystemTime::now());
    }

    pub(crate) fn record_unhandled(&self) {
        self.stats.write().unhandled_messages += 1;
    }

    fn record_error(&self, update: impl FnOnce(&mut SubscriptionStats)) {
        let mut stats = self.stats.write();
        update(&mut stats);
        stats.last_error_at = Some(SystemTime::now());
    }
}

/// A listening channel with its handlers
pub struct Subscription {
    shared: Arc<SubscriptionShared>,
    close_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.shared.channel)
            .field("provider", &self.shared.provider)
            .field("state", &self.state())
            .finish()
    }
}

impl Subscription {
    /// Connect, listen and start the receive loop
    pub(crate) async fn open(
        core: &Arc<BusCore>,
        channel: &str,
        policy: KeepalivePolicy,
    ) -> BusResult<Arc<Self>> {
        let provider = core.backend.provider_name();
        let shared = Arc::new(SubscriptionShared {
            channel: channel.to_string(),
            provider,
            handlers: Arc::new(HandlerRegistry::default()),
            state: RwLock::new(SubscriptionState::Opening),
            stats: RwLock::new(SubscriptionStats::default()),
        });

        let receiver = core.backend.listen(channel).await.map_err(|e| match e {
            BusError::Subscribe { .. } | BusError::Connection { .. } => e,
            other => BusError::subscribe(channel, other),
        })?;

        shared.set_state(SubscriptionState::Listening);
        log_subscription_event(SubscriptionEvent::Connected, channel, provider, None);

        let (close_tx, close_rx) = watch::channel(false);
        let cancel = Cancellation {
            close: close_rx,
            shutdown: core.shutdown.subscribe(),
        };

        let task = tokio::spawn(receive_loop(
            Arc::downgrade(core),
            Arc::clone(&shared),
            receiver,
            cancel,
            policy,
        ));

        Ok(Arc::new(Self {
            shared,
            close_tx,
            task: Mutex::new(Some(task)),
        }))
    }

    pub(crate) fn shared(&self) -> Arc<SubscriptionShared> {
        Arc::clone(&self.shared)
    }

    pub fn channel(&self) -> &str {
        &self.shared.channel
    }

    pub fn state(&self) -> SubscriptionState {
        *self.shared.state.read()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SubscriptionState::Closed
    }

    pub fn stats(&self) -> SubscriptionStats {
        self.shared.stats.read().clone()
    }

    /// Register the handler for `message_type`, replacing any previous one
    pub fn handle<H: MessageHandler>(&self, message_type: impl Into<String>, handler: H) {
        self.shared
            .handlers
            .set_handler(message_type.into(), Arc::new(handler));
    }

    pub fn remove_handler(&self, message_type: &str) -> bool {
        self.shared.handlers.remove_handler(message_type)
    }

    pub fn handler_types(&self) -> Vec<String> {
        self.shared.handlers.handler_types()
    }

    /// Register a one-shot handler for the reply to `request_id`
    ///
    /// The handler is dropped after `timeout` if no reply arrived.
    pub fn on_reply<F, Fut>(&self, request_id: impl Into<String>, timeout: Duration, handler: F)
    where
        F: FnOnce(Envelope) -> Fut + Send + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        self.shared.handlers.register_reply(
            request_id.into(),
            timeout,
            Box::new(move |reply: Envelope| handler(reply).boxed()),
        );
    }

    pub fn remove_reply(&self, request_id: &str) -> bool {
        self.shared.handlers.remove_reply(request_id)
    }

    pub fn pending_replies(&self) -> usize {
        self.shared.handlers.pending_replies()
    }

    /// Stop the receive loop and release the connection; idempotent
    pub async fn close(&self) {
        self.signal_close();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(channel = %self.shared.channel, error = %e, "Receive loop ended abnormally");
                }
            }
        }
        self.shared.handlers.clear();
        self.shared.set_state(SubscriptionState::Closed);
    }

    /// Ask the loop to stop without waiting for it
    pub(crate) fn signal_close(&self) {
        self.close_tx.send_replace(true);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close_tx.send_replace(true);
    }
}

/// Close and shutdown signals watched by the receive loop
struct Cancellation {
    close: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
}

impl Cancellation {
    /// Resolves once either signal is raised or its sender is gone
    async fn cancelled(&mut self) {
        tokio::select! {
            _ = raised(&mut self.close) => {}
            _ = raised(&mut self.shutdown) => {}
        }
    }
}

async fn raised(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|raised| *raised).await;
}

enum Received {
    Payload(String),
    Disconnected(Option<BusError>),
    Idle,
}

async fn receive_loop(
    core: Weak<BusCore>,
    shared: Arc<SubscriptionShared>,
    mut receiver: Box<dyn ChannelReceiver>,
    mut cancel: Cancellation,
    policy: KeepalivePolicy,
) {
    let channel = shared.channel.clone();
    let provider = shared.provider;
    debug!(channel = %channel, provider, "Receive loop started");

    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = tokio::time::timeout(policy.probe_interval, receiver.recv()) => match next {
                Ok(Ok(Some(payload))) => Received::Payload(payload),
                Ok(Ok(None)) => Received::Disconnected(None),
                Ok(Err(e)) => Received::Disconnected(Some(e)),
                Err(_) => Received::Idle,
            },
        };

        match received {
            Received::Payload(payload) => {
                let Some(core) = core.upgrade() else { break };
                handle_payload(&core, &shared, &payload).await;
            }
            Received::Idle => {
                shared.stats.write().probes_sent += 1;
                let probe = tokio::time::timeout(policy.probe_interval, receiver.ping()).await;
                let failure = match probe {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => Some("probe timed out".to_string()),
                };
                if let Some(failure) = failure {
                    shared.record_error(|_| {});
                    log_subscription_event(
                        SubscriptionEvent::ProbeFailed,
                        &channel,
                        provider,
                        Some(&failure),
                    );
                    break;
                }
                debug!(channel = %channel, "Liveness probe succeeded");
            }
            Received::Disconnected(error) => {
                let details = error.map(|e| e.to_string());
                shared.record_error(|_| {});
                log_subscription_event(
                    SubscriptionEvent::Disconnected,
                    &channel,
                    provider,
                    details.as_deref(),
                );
                if !reconnect(&shared, receiver.as_mut(), &mut cancel, &policy.reconnect).await {
                    break;
                }
            }
        }
    }

    shared.set_state(SubscriptionState::Closed);
    log_subscription_event(SubscriptionEvent::Closed, &channel, provider, None);
}

/// Run the reconnect policy; true once the receiver is listening again
async fn reconnect(
    shared: &SubscriptionShared,
    receiver: &mut dyn ChannelReceiver,
    cancel: &mut Cancellation,
    policy: &ReconnectPolicy,
) -> bool {
    shared.set_state(SubscriptionState::Reconnecting);

    for attempt in 0..policy.max_attempts {
        let details = format!("attempt {} of {}", attempt + 1, policy.max_attempts);
        log_subscription_event(
            SubscriptionEvent::Reconnecting,
            &shared.channel,
            shared.provider,
            Some(&details),
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(policy.backoff_for(attempt)) => {}
        }

        match receiver.reconnect().await {
            Ok(()) => {
                shared.set_state(SubscriptionState::Listening);
                shared.stats.write().reconnects += 1;
                log_subscription_event(
                    SubscriptionEvent::Reconnected,
                    &shared.channel,
                    shared.provider,
                    None,
                );
                return true;
            }
            Err(e) => {
                shared.record_error(|_| {});
                warn!(channel = %shared.channel, attempt = attempt + 1, error = %e, "Reconnect attempt failed");
            }
        }
    }

    warn!(
        channel = %shared.channel,
        max_attempts = policy.max_attempts,
        "Giving up on subscription after exhausting reconnect attempts"
    );
    false
}

/// Decode one notification, resolve overflow and hand it to dispatch
async fn handle_payload(core: &Arc<BusCore>, shared: &Arc<SubscriptionShared>, payload: &str) {
    {
        let mut stats = shared.stats.write();
        stats.notifications_received += 1;
        stats.last_message_at = Some(SystemTime::now());
    }

    let mut message = match Envelope::decode(payload) {
        Ok(message) => message,
        Err(e) => {
            shared.record_error(|stats| stats.decode_errors += 1);
            warn!(channel = %shared.channel, error = %e, "Dropping undecodable notification");
            return;
        }
    };

    if let Some(key) = message.overflow_key().map(str::to_string) {
        match core.cache.pop::<Envelope>(&key).await {
            Ok(Some(mut full)) => {
                full.strip_overflow_marker();
                shared.stats.write().overflow_resolved += 1;
                message = full;
            }
            Ok(None) => {
                shared.record_error(|_| {});
                warn!(
                    channel = %shared.channel,
                    request_id = %message.request_id,
                    "Overflow entry missing; already consumed or expired"
                );
                return;
            }
            Err(e) => {
                shared.record_error(|stats| stats.decode_errors += 1);
                warn!(channel = %shared.channel, error = %e, "Could not resolve overflow entry");
                return;
            }
        }
    }

    tokio::spawn(Arc::clone(core).dispatch(Arc::clone(shared), message));
}
