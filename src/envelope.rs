//! # Message Envelope
//!
//! The wire format exchanged between publishers and subscribers:
//!
//! ```json
//! {"req_id": "...", "type": "...", "data": {}, "error": "", "orig_req_id": ""}
//! ```
//!
//! A message is either a fresh request (empty `orig_req_id`) or a reply whose
//! `orig_req_id` equals the request's `req_id`. The reply constructors on
//! [`Envelope`] are the only way this crate builds replies.
//!
//! ```rust
//! use tasker_bus::envelope::{Envelope, message_types};
//! use serde_json::json;
//!
//! let request = Envelope::new("ping").with_data("payload", json!("1234567"));
//! let reply = request.reply("pong");
//! assert_eq!(reply.orig_request_id, request.request_id);
//! assert!(reply.is_reply());
//! assert_eq!(request.ack().message_type, message_types::ACK);
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{BusError, BusResult};

/// Reserved message types
pub mod message_types {
    /// Suppresses reply routing and the unhandled-type warning
    pub const NO_REPLY: &str = "no_reply";
    pub const ACK: &str = "ack";
    pub const ERROR: &str = "error";
}

/// Well-known keys inside [`Envelope::data`]
pub mod data_keys {
    pub const PAYLOAD: &str = "payload";
    /// Default channel of the publisher; replies go back here
    pub const FROM_CHANNEL: &str = "from_channel";
    /// Explicit reply destination set by a handler
    pub const TO_CHANNEL: &str = "to_channel";
    /// Overflow marker: the full envelope lives in the cache under this key
    pub const OVERFLOW_KEY: &str = "__cache_key__";
}

/// Generate a globally unique, time-sortable request id
pub fn new_request_id() -> String {
    Uuid::now_v7().to_string()
}

/// Structured message unit exchanged over the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "req_id")]
    pub request_id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub error: String,
    #[serde(rename = "orig_req_id", default)]
    pub orig_request_id: String,
}

impl Envelope {
    /// Create a fresh request with a new request id
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            request_id: new_request_id(),
            message_type: message_type.into(),
            data: Map::new(),
            error: String::new(),
            orig_request_id: String::new(),
        }
    }

    /// Add a data entry
    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Serialize `payload` to a JSON string stored under `data["payload"]`
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> BusResult<Self> {
        let encoded = serde_json::to_string(payload)
            .map_err(|e| BusError::encode(format!("payload of {}", self.request_id), e))?;
        self.data
            .insert(data_keys::PAYLOAD.to_string(), Value::String(encoded));
        Ok(self)
    }

    /// Decode `data["payload"]`, accepting either a serialized string or an inline value
    pub fn payload<T: DeserializeOwned>(&self) -> BusResult<Option<T>> {
        let context = || format!("payload of {}", self.request_id);
        match self.data.get(data_keys::PAYLOAD) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(raw)) => match serde_json::from_str(raw) {
                Ok(value) => Ok(Some(value)),
                // A plain string payload that is not itself JSON
                Err(_) => serde_json::from_value(Value::String(raw.clone()))
                    .map(Some)
                    .map_err(|e| BusError::decode(context(), e)),
            },
            Some(other) => serde_json::from_value(other.clone())
                .map(Some)
                .map_err(|e| BusError::decode(context(), e)),
        }
    }

    /// Build a reply correlated with this request
    pub fn reply(&self, message_type: impl Into<String>) -> Self {
        let mut reply = Self::new(message_type);
        reply.orig_request_id = self.request_id.clone();
        reply
    }

    /// Build an acknowledgement reply
    pub fn ack(&self) -> Self {
        self.reply(message_types::ACK)
    }

    /// Build an error reply carrying `error`
    pub fn error_reply(&self, error: impl Into<String>) -> Self {
        let mut reply = self.reply(message_types::ERROR);
        reply.error = error.into();
        reply
    }

    pub fn is_reply(&self) -> bool {
        !self.orig_request_id.is_empty()
    }

    pub fn is_error(&self) -> bool {
        self.message_type == message_types::ERROR
    }

    pub fn is_no_reply(&self) -> bool {
        self.message_type == message_types::NO_REPLY
    }

    /// Whether publishing this envelope would send anything
    pub fn is_routable(&self) -> bool {
        !self.message_type.is_empty() && !self.is_no_reply()
    }

    fn data_str(&self, key: &str) -> Option<&str> {
        self.data
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn from_channel(&self) -> Option<&str> {
        self.data_str(data_keys::FROM_CHANNEL)
    }

    pub fn to_channel(&self) -> Option<&str> {
        self.data_str(data_keys::TO_CHANNEL)
    }

    pub fn set_from_channel(&mut self, channel: &str) {
        self.data.insert(
            data_keys::FROM_CHANNEL.to_string(),
            Value::String(channel.to_string()),
        );
    }

    /// Ask the dispatcher to route this reply to `channel` instead of the sender
    pub fn with_to_channel(self, channel: impl Into<String>) -> Self {
        let channel = channel.into();
        self.with_data(data_keys::TO_CHANNEL, Value::String(channel))
    }

    /// Cache key of the full envelope when this is an overflow stub
    pub fn overflow_key(&self) -> Option<&str> {
        self.data_str(data_keys::OVERFLOW_KEY)
    }

    /// Minimal stand-in published instead of an oversized envelope
    pub fn overflow_stub(&self) -> Self {
        let mut data = Map::new();
        data.insert(
            data_keys::OVERFLOW_KEY.to_string(),
            Value::String(self.request_id.clone()),
        );
        Self {
            request_id: self.request_id.clone(),
            message_type: self.message_type.clone(),
            data,
            error: String::new(),
            orig_request_id: String::new(),
        }
    }

    /// Remove the overflow marker so handlers never see it
    pub fn strip_overflow_marker(&mut self) {
        self.data.remove(data_keys::OVERFLOW_KEY);
    }

    pub fn encode(&self) -> BusResult<String> {
        serde_json::to_string(self).map_err(|e| BusError::encode("envelope", e))
    }

    pub fn decode(raw: &str) -> BusResult<Self> {
        serde_json::from_str(raw).map_err(|e| BusError::decode("envelope", e))
    }
}

/// Result of a message handler
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Publish this envelope back (to `to_channel`, else the sender's `from_channel`)
    Reply(Envelope),
    /// Fire-and-forget: nothing is sent back
    NoReply,
    /// Send an `error` reply carrying this text
    Error(String),
}

impl Outcome {
    /// Turn the outcome into the envelope to route back for `request`, if any
    pub fn into_reply(self, request: &Envelope) -> Option<Envelope> {
        match self {
            Self::Reply(mut reply) => {
                if !reply.is_routable() {
                    return None;
                }
                if reply.orig_request_id.is_empty() {
                    reply.orig_request_id = request.request_id.clone();
                }
                Some(reply)
            }
            Self::NoReply => None,
            Self::Error(text) => Some(request.error_reply(text)),
        }
    }
}

impl From<Envelope> for Outcome {
    fn from(envelope: Envelope) -> Self {
        Self::Reply(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format_field_names() {
        let envelope = Envelope::new("test").with_data("payload", json!("1234567"));
        let wire: Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();

        assert_eq!(wire["type"], "test");
        assert_eq!(wire["req_id"], Value::String(envelope.request_id.clone()));
        assert_eq!(wire["data"]["payload"], "1234567");
        assert_eq!(wire["error"], "");
        assert_eq!(wire["orig_req_id"], "");
    }

    #[test]
    fn test_decode_fills_optional_fields() {
        let envelope = Envelope::decode(r#"{"req_id":"r1","type":"test"}"#).unwrap();
        assert!(envelope.data.is_empty());
        assert!(!envelope.is_reply());

        assert!(Envelope::decode(r#"{"type":"test"}"#).is_err());
        assert!(Envelope::decode("not json").is_err());
    }

    #[test]
    fn test_request_ids_are_time_sortable() {
        let first = Envelope::new("a");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = Envelope::new("a");
        assert!(first.request_id < second.request_id);
    }

    #[test]
    fn test_reply_correlation() {
        let request = Envelope::new("ping");
        let error = request.error_reply("boom");
        assert_eq!(error.orig_request_id, request.request_id);
        assert!(error.is_error());
        assert_eq!(error.error, "boom");
        assert_ne!(error.request_id, request.request_id);
    }

    #[test]
    fn test_payload_round_trip_and_inline_values() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Job {
            id: u32,
            name: String,
        }

        let job = Job {
            id: 7,
            name: "reindex".to_string(),
        };
        let envelope = Envelope::new("job").with_payload(&job).unwrap();
        assert!(envelope.data["payload"].is_string());
        assert_eq!(envelope.payload::<Job>().unwrap(), Some(job));

        let inline = Envelope::new("job").with_data("payload", json!({"id": 1, "name": "x"}));
        assert_eq!(inline.payload::<Job>().unwrap().unwrap().id, 1);

        let plain = Envelope::new("test").with_data("payload", json!("1234567"));
        assert_eq!(plain.payload::<u64>().unwrap(), Some(1234567));
        assert!(Envelope::new("none").payload::<Job>().unwrap().is_none());
    }

    #[test]
    fn test_overflow_stub_keeps_only_reference() {
        let envelope = Envelope::new("bulk")
            .with_data("payload", json!("x".repeat(100)))
            .with_data("from_channel", json!("node_a"));
        let stub = envelope.overflow_stub();

        assert_eq!(stub.request_id, envelope.request_id);
        assert_eq!(stub.overflow_key(), Some(envelope.request_id.as_str()));
        assert_eq!(stub.data.len(), 1);

        let mut restored = envelope.clone();
        restored.data.insert(
            data_keys::OVERFLOW_KEY.to_string(),
            json!(envelope.request_id),
        );
        restored.strip_overflow_marker();
        assert_eq!(restored, envelope);
    }

    #[test]
    fn test_outcome_reply_routing() {
        let request = Envelope::new("ping");

        let reply = Outcome::Reply(Envelope::new("pong"))
            .into_reply(&request)
            .unwrap();
        assert_eq!(reply.orig_request_id, request.request_id);

        assert!(Outcome::Reply(Envelope::new(message_types::NO_REPLY))
            .into_reply(&request)
            .is_none());
        assert!(Outcome::Reply(Envelope::new("")).into_reply(&request).is_none());
        assert!(Outcome::NoReply.into_reply(&request).is_none());

        let error = Outcome::Error("bad input".into())
            .into_reply(&request)
            .unwrap();
        assert!(error.is_error());
        assert_eq!(error.error, "bad input");
    }

    #[test]
    fn test_channel_accessors_ignore_empty_values() {
        let mut envelope = Envelope::new("t").with_data("to_channel", json!(""));
        assert_eq!(envelope.to_channel(), None);
        envelope.set_from_channel("node_a");
        assert_eq!(envelope.from_channel(), Some("node_a"));
        let routed = envelope.with_to_channel("audit");
        assert_eq!(routed.to_channel(), Some("audit"));
    }
}
