//! Messages as they move through the engine: raw delivery, decoded task, outcome.

use chrono::{DateTime, Utc};
use lapin::message::Delivery;
use serde_json::{Map, Value};

/// The decoded top-level JSON object handed to a `MessageHandler`.
pub type Payload = Map<String, Value>;

/// Broker-assigned identifier, unique and increasing per channel.
pub type DeliveryTag = u64;

/// A message received from the request queue.
#[derive(Debug, Clone)]
pub struct Message {
    pub payload: Vec<u8>,
    pub delivery_tag: DeliveryTag,
    pub received_at: DateTime<Utc>,
    pub redelivered: bool,
    pub message_id: Option<String>,
}

impl Message {
    pub fn new(delivery_tag: DeliveryTag, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            delivery_tag,
            received_at: Utc::now(),
            redelivered: false,
            message_id: None,
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn from_delivery(delivery: Delivery) -> Self {
        Self {
            message_id: delivery
                .properties
                .message_id()
                .as_ref()
                .map(|id| id.as_str().to_string()),
            payload: delivery.data,
            delivery_tag: delivery.delivery_tag,
            received_at: Utc::now(),
            redelivered: delivery.redelivered,
        }
    }
}

/// A successfully parsed message, ready for the dispatch pool.
#[derive(Debug, Clone)]
pub struct DecodedTask {
    pub payload: Payload,
    /// Only used to correlate the outcome with its ack.
    pub delivery_tag: DeliveryTag,
}

/// Parses a message body into a `DecodedTask`.
///
/// The body must be UTF-8 JSON with an object at the top level.
pub fn decode(message: &Message) -> Result<DecodedTask, String> {
    let text = std::str::from_utf8(&message.payload)
        .map_err(|e| format!("payload is not valid UTF-8: {}", e))?;
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(payload)) => Ok(DecodedTask {
            payload,
            delivery_tag: message.delivery_tag,
        }),
        Ok(other) => Err(format!(
            "expected a JSON object, found {}",
            json_kind(&other)
        )),
        Err(e) => Err(format!("Invalid JSON: {}", e)),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// What happened to a message, produced by the pool and consumed by the ack coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Success,
    HandlerError(String),
    DecodeError(String),
}
