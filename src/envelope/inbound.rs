//! Inbound frame classification.
//!
//! Frames are discriminated by their `op` field. Anything with an unknown or
//! missing `op`, or missing the field it routes on, becomes
//! [`Inbound::Unknown`] and is dropped by the dispatcher.

use serde_json::Value;

use crate::error::Result;

/// A parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// `publish`: a message on a subscribed topic.
    Publish {
        /// Topic name.
        topic: String,
        /// The `msg` field.
        msg: Value,
    },
    /// `service_response`: the full response object for a pending call.
    ServiceResponse {
        /// Correlation id of the call.
        id: String,
        /// The whole frame, so the caller can inspect `result`.
        response: Value,
    },
    /// `call_service`: the server asks this client to serve a request.
    CallService {
        /// Service name.
        service: String,
        /// The whole frame.
        request: Value,
    },
    /// `status`: server status report, optionally tied to a request id.
    Status {
        /// Request id, when present.
        id: Option<String>,
        /// The whole frame.
        status: Value,
    },
    /// Unrecognized op.
    Unknown {
        /// The op, if the frame had one.
        op: Option<String>,
    },
}

impl Inbound {
    /// Parse a JSON text frame.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Ok(Self::from_value(value))
    }

    /// Classify an already-parsed frame.
    pub fn from_value(mut value: Value) -> Self {
        let op = value.get("op").and_then(Value::as_str).map(str::to_owned);

        match op.as_deref() {
            Some("publish") => match value.get("topic").and_then(Value::as_str) {
                Some(topic) => {
                    let topic = topic.to_string();
                    let msg = value.get_mut("msg").map(Value::take).unwrap_or(Value::Null);
                    Inbound::Publish { topic, msg }
                }
                None => Inbound::Unknown { op: op.clone() },
            },
            Some("service_response") => match value.get("id").and_then(key) {
                Some(id) => Inbound::ServiceResponse {
                    id,
                    response: value,
                },
                None => Inbound::Unknown { op: op.clone() },
            },
            Some("call_service") => match value.get("service").and_then(Value::as_str) {
                Some(service) => Inbound::CallService {
                    service: service.to_string(),
                    request: value,
                },
                None => Inbound::Unknown { op: op.clone() },
            },
            Some("status") => Inbound::Status {
                id: value.get("id").and_then(key),
                status: value,
            },
            _ => Inbound::Unknown { op: op.clone() },
        }
    }
}

/// Routing key from an id field. Empty strings, zero, and non-scalars don't route.
fn key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
        _ => None,
    }
}
