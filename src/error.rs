//! # Bus Error Types
//!
//! Structured error handling for the cache, lock and pub/sub layers using
//! thiserror instead of `Box<dyn Error>` patterns. Backend failures are wrapped
//! with the operation context (key, channel, lock id) before they reach callers.

use thiserror::Error;

/// Errors produced by the bus, the cache store and the lock manager
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Connection error: {operation}: {message}")]
    Connection { operation: String, message: String },

    #[error("Subscribe failed for channel {channel}: {message}")]
    Subscribe { channel: String, message: String },

    #[error("Publish failed for channel {channel}: {message}")]
    Publish { channel: String, message: String },

    #[error("Cache {operation} failed for key {key}: {message}")]
    Cache {
        operation: String,
        key: String,
        message: String,
    },

    #[error("Lock {operation} failed for lock {lock_id}: {message}")]
    Lock {
        lock_id: i64,
        operation: String,
        message: String,
    },

    #[error("Reply to request {request_id} on channel {channel} timed out after {timeout_ms}ms")]
    ReplyTimeout {
        request_id: String,
        channel: String,
        timeout_ms: u64,
    },

    #[error("Decode error: {context}: {message}")]
    Decode { context: String, message: String },

    #[error("Encode error: {context}: {message}")]
    Encode { context: String, message: String },

    #[error("Invalid channel: {reason}")]
    InvalidChannel { reason: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Subscription closed: {channel}")]
    Closed { channel: String },
}

impl BusError {
    /// Create a connection error
    pub fn connection(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Connection {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Create a subscribe (setup) error
    pub fn subscribe(channel: impl Into<String>, message: impl ToString) -> Self {
        Self::Subscribe {
            channel: channel.into(),
            message: message.to_string(),
        }
    }

    /// Create a publish error
    pub fn publish(channel: impl Into<String>, message: impl ToString) -> Self {
        Self::Publish {
            channel: channel.into(),
            message: message.to_string(),
        }
    }

    /// Create a cache operation error
    pub fn cache(
        operation: impl Into<String>,
        key: impl Into<String>,
        message: impl ToString,
    ) -> Self {
        Self::Cache {
            operation: operation.into(),
            key: key.into(),
            message: message.to_string(),
        }
    }

    /// Create a lock operation error
    pub fn lock(lock_id: i64, operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Lock {
            lock_id,
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Create a reply timeout error
    pub fn reply_timeout(
        request_id: impl Into<String>,
        channel: impl Into<String>,
        timeout_ms: u64,
    ) -> Self {
        Self::ReplyTimeout {
            request_id: request_id.into(),
            channel: channel.into(),
            timeout_ms,
        }
    }

    /// Create a decode error
    pub fn decode(context: impl Into<String>, message: impl ToString) -> Self {
        Self::Decode {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Create an encode error
    pub fn encode(context: impl Into<String>, message: impl ToString) -> Self {
        Self::Encode {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Create an invalid channel error
    pub fn invalid_channel(reason: impl Into<String>) -> Self {
        Self::InvalidChannel {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a closed subscription error
    pub fn closed(channel: impl Into<String>) -> Self {
        Self::Closed {
            channel: channel.into(),
        }
    }

    /// Whether this error is a request/reply correlation timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ReplyTimeout { .. })
    }

    /// Whether this error happened while setting up a connection or subscription
    pub fn is_setup(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Subscribe { .. })
    }
}

impl From<config::ConfigError> for BusError {
    fn from(err: config::ConfigError) -> Self {
        Self::configuration(err.to_string())
    }
}

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_context() {
        let err = BusError::cache("get", "user:42", "connection reset");
        assert_eq!(
            err.to_string(),
            "Cache get failed for key user:42: connection reset"
        );

        let err = BusError::lock(7, "try_lock", "pool timed out");
        assert!(err.to_string().contains("lock 7"));
    }

    #[test]
    fn test_error_classification() {
        assert!(BusError::reply_timeout("abc", "chan", 10_000).is_timeout());
        assert!(!BusError::publish("chan", "boom").is_timeout());
        assert!(BusError::subscribe("chan", "rejected").is_setup());
        assert!(BusError::connection("connect", "refused").is_setup());
        assert!(!BusError::decode("envelope", "eof").is_setup());
    }
}
