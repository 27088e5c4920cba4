//! # Pub/Sub Backend Traits
//!
//! Provider-agnostic notification transport. A backend publishes raw
//! payloads to named channels and opens one [`ChannelReceiver`] per
//! subscription; the receiver owns exactly one backend connection.

use async_trait::async_trait;

use crate::error::BusResult;

/// Transport for envelopes between processes
#[async_trait]
pub trait PubSubBackend: Send + Sync + 'static {
    /// Open a dedicated connection listening on `channel`
    ///
    /// Failure here is a setup error for the subscription being opened.
    async fn listen(&self, channel: &str) -> BusResult<Box<dyn ChannelReceiver>>;

    /// Deliver `payload` to every listener on `channel`
    async fn notify(&self, channel: &str, payload: &str) -> BusResult<()>;

    /// Largest payload the transport accepts, if it has a limit
    fn max_payload_bytes(&self) -> Option<usize>;

    /// Provider name for logging
    fn provider_name(&self) -> &'static str;
}

/// Receiving end of one channel subscription
#[async_trait]
pub trait ChannelReceiver: Send + 'static {
    /// Wait for the next payload
    ///
    /// `Ok(None)` or `Err(_)` means the connection is gone and the caller
    /// should go through [`ChannelReceiver::reconnect`]. Must be cancel-safe:
    /// the receive loop races it against timers and shutdown.
    async fn recv(&mut self) -> BusResult<Option<String>>;

    /// Active liveness probe on the listening connection
    async fn ping(&mut self) -> BusResult<()>;

    /// Re-establish the connection and re-issue the listen
    async fn reconnect(&mut self) -> BusResult<()>;
}
