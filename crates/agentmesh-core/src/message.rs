//! Wire-level message types shared by the transport, workers and correlator.
//!
//! Payloads are flat JSON objects except for agents whose payload kind is
//! `Binary` (raw PDF bytes). Correlation metadata lives inside the JSON
//! object under [`REQUEST_ID_FIELD`]; binary payloads carry none.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field carrying the per-request correlation id inside JSON payloads.
pub const REQUEST_ID_FIELD: &str = "request_id";

/// Field marking a structured error reply.
pub const ERROR_FIELD: &str = "error";

/// Broker delivery guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QoS {
    AtMostOnce,
    #[default]
    AtLeastOnce,
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        }
    }
}

/// A message as delivered by the broker: topic plus raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Serialize a JSON value as the payload.
    pub fn json(topic: impl Into<String>, value: &Value) -> Self {
        Self::new(topic, value.to_string().into_bytes())
    }

    /// Parse the payload as a JSON object.
    pub fn json_object(&self) -> Result<Map<String, Value>, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// How an agent expects its input payload to be encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    #[default]
    Json,
    Binary,
}

/// A decoded inbound payload handed to a transform.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Map<String, Value>),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Payload::Json(map) => request_id_of(map),
            Payload::Binary(_) => None,
        }
    }
}

/// Read the correlation id from a JSON object, if any.
pub fn request_id_of(map: &Map<String, Value>) -> Option<&str> {
    map.get(REQUEST_ID_FIELD).and_then(|v| v.as_str())
}

/// Generate a fresh correlation id.
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Structured error reply published when a transform fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub agent: String,
    pub message: String,
}

impl ErrorEnvelope {
    pub fn new(agent: &str, message: impl Into<String>, request_id: Option<String>) -> Self {
        Self {
            error: ErrorBody {
                agent: agent.to_string(),
                message: message.into(),
            },
            request_id,
        }
    }

    /// Recognise an error reply. Only objects whose `error` field is itself an
    /// object with a `message` string qualify.
    pub fn from_reply(map: &Map<String, Value>) -> Option<Self> {
        let error = map.get(ERROR_FIELD)?;
        if !error.get("message").is_some_and(|m| m.is_string()) {
            return None;
        }
        serde_json::from_value(Value::Object(map.clone())).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_id_only_on_json() {
        let map = json!({"user_input": "hi", "request_id": "abc"});
        let payload = Payload::Json(map.as_object().cloned().unwrap_or_default());
        assert_eq!(payload.request_id(), Some("abc"));
        assert_eq!(Payload::Binary(vec![1, 2, 3]).request_id(), None);
    }

    #[test]
    fn test_error_envelope_detection() {
        let reply = ErrorEnvelope::new("chat", "model offline", Some("r1".to_string())).to_value();
        let parsed = ErrorEnvelope::from_reply(reply.as_object().unwrap()).unwrap();
        assert_eq!(parsed.error.agent, "chat");
        assert_eq!(parsed.request_id.as_deref(), Some("r1"));

        let plain = json!({"error": "just a string field"});
        assert!(ErrorEnvelope::from_reply(plain.as_object().unwrap()).is_none());
    }

    #[test]
    fn test_envelope_json_object_rejects_garbage() {
        let env = Envelope::new("t", b"not-json".to_vec());
        assert!(env.json_object().is_err());
    }
}
