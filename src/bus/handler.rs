//! Message handlers and per-subscription handler registry

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::envelope::{Envelope, Outcome};

/// Handler for one message type on a subscription
///
/// Implemented for any `Fn(Envelope) -> impl Future<Output = Outcome>`, so
/// plain async closures work:
///
/// ```rust
/// use tasker_bus::bus::MessageHandler;
/// use tasker_bus::envelope::{Envelope, Outcome};
///
/// fn assert_handler<H: MessageHandler>(_: H) {}
/// assert_handler(|msg: Envelope| async move { Outcome::Reply(msg.reply("pong")) });
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Envelope) -> Outcome;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    async fn handle(&self, message: Envelope) -> Outcome {
        (self)(message).await
    }
}

/// One-shot handler for the reply to a specific request
pub(crate) type ReplyFn = Box<dyn FnOnce(Envelope) -> BoxFuture<'static, Outcome> + Send>;

struct PendingReply {
    handler: ReplyFn,
    registration: u64,
    expiry: AbortHandle,
}

/// Type handlers and outstanding reply handlers of one subscription
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: Mutex<HashMap<String, Arc<dyn MessageHandler>>>,
    replies: Mutex<HashMap<String, PendingReply>>,
    next_registration: Mutex<u64>,
}

impl HandlerRegistry {
    pub(crate) fn set_handler(&self, message_type: String, handler: Arc<dyn MessageHandler>) {
        self.handlers.lock().insert(message_type, handler);
    }

    pub(crate) fn remove_handler(&self, message_type: &str) -> bool {
        self.handlers.lock().remove(message_type).is_some()
    }

    pub(crate) fn handler(&self, message_type: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.lock().get(message_type).cloned()
    }

    pub(crate) fn handler_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.lock().keys().cloned().collect();
        types.sort();
        types
    }

    /// Register a reply handler evicted after `timeout` unless a reply arrives first
    pub(crate) fn register_reply(
        self: &Arc<Self>,
        request_id: String,
        timeout: Duration,
        handler: ReplyFn,
    ) {
        let registration = {
            let mut next = self.next_registration.lock();
            *next += 1;
            *next
        };

        let registry: Weak<Self> = Arc::downgrade(self);
        let expiring_id = request_id.clone();

        // Held across the spawn so a zero timeout cannot fire before the insert
        let mut replies = self.replies.lock();
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(registry) = registry.upgrade() {
                registry.expire_reply(&expiring_id, registration);
            }
        })
        .abort_handle();

        let replaced = replies.insert(
            request_id,
            PendingReply {
                handler,
                registration,
                expiry,
            },
        );
        if let Some(replaced) = replaced {
            replaced.expiry.abort();
        }
    }

    fn expire_reply(&self, request_id: &str, registration: u64) {
        let mut replies = self.replies.lock();
        // A newer registration for the same id keeps its own timer
        if replies
            .get(request_id)
            .is_some_and(|pending| pending.registration == registration)
        {
            replies.remove(request_id);
            debug!(request_id = %request_id, "Reply handler expired");
        }
    }

    /// Remove and return the reply handler for `request_id`, cancelling its timer
    pub(crate) fn take_reply(&self, request_id: &str) -> Option<ReplyFn> {
        let pending = self.replies.lock().remove(request_id)?;
        pending.expiry.abort();
        Some(pending.handler)
    }

    pub(crate) fn remove_reply(&self, request_id: &str) -> bool {
        self.take_reply(request_id).is_some()
    }

    pub(crate) fn pending_replies(&self) -> usize {
        self.replies.lock().len()
    }

    pub(crate) fn clear(&self) {
        self.handlers.lock().clear();
        for (_, pending) in self.replies.lock().drain() {
            pending.expiry.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn noop_reply() -> ReplyFn {
        Box::new(|_msg: Envelope| async { Outcome::NoReply }.boxed())
    }

    #[tokio::test]
    async fn test_reply_handler_expires() {
        let registry = Arc::new(HandlerRegistry::default());
        registry.register_reply("req-1".into(), Duration::from_millis(20), noop_reply());
        assert_eq!(registry.pending_replies(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(registry.pending_replies(), 0);
        assert!(registry.take_reply("req-1").is_none());
    }

    #[tokio::test]
    async fn test_take_reply_cancels_expiry() {
        let registry = Arc::new(HandlerRegistry::default());
        registry.register_reply("req-1".into(), Duration::from_millis(20), noop_reply());
        assert!(registry.take_reply("req-1").is_some());

        // Re-register with a long timeout; the first timer must not evict it
        registry.register_reply("req-1".into(), Duration::from_secs(60), noop_reply());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(registry.pending_replies(), 1);
        registry.clear();
        assert_eq!(registry.pending_replies(), 0);
    }

    #[tokio::test]
    async fn test_type_handlers() {
        let registry = HandlerRegistry::default();
        registry.set_handler(
            "ping".into(),
            Arc::new(|msg: Envelope| async move { Outcome::Reply(msg.reply("pong")) }),
        );

        let handler = registry.handler("ping").unwrap();
        let request = Envelope::new("ping");
        match handler.handle(request.clone()).await {
            Outcome::Reply(reply) => assert_eq!(reply.orig_request_id, request.request_id),
            other => panic!("unexpected outcome: {other:?}"),
        }

        assert_eq!(registry.handler_types(), vec!["ping".to_string()]);
        assert!(registry.remove_handler("ping"));
        assert!(registry.handler("ping").is_none());
    }
}
