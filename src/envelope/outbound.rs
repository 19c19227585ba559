//! Outbound envelopes.
//!
//! Every frame the client sends is an [`Envelope`]. The operation code is a
//! closed set of known operations plus [`Op::Service`], which carries a
//! service name as the op (service calls use the service name itself).

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::error::Result;

/// Build a correlation id: `<kind>:<name>:<counter>`.
///
/// ```
/// use mrpt_ws_client::envelope::correlation_id;
///
/// assert_eq!(correlation_id("subscribe", "/path", 7), "subscribe:/path:7");
/// ```
pub fn correlation_id(kind: &str, name: &str, counter: u64) -> String {
    format!("{}:{}:{}", kind, name, counter)
}

/// Operation code of an outbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// `Subscriber.subscribe`
    Subscribe,
    /// `Subscriber.unsubscribe`
    Unsubscribe,
    /// `Publisher.advertise`
    Advertise,
    /// `Publisher.unadvertise`
    Unadvertise,
    /// `Publish`
    Publish,
    /// Service call; the op is the service name.
    Service(String),
}

impl Op {
    /// Wire representation of the op code.
    pub fn as_str(&self) -> &str {
        match self {
            Op::Subscribe => "Subscriber.subscribe",
            Op::Unsubscribe => "Subscriber.unsubscribe",
            Op::Advertise => "Publisher.advertise",
            Op::Unadvertise => "Publisher.unadvertise",
            Op::Publish => "Publish",
            Op::Service(name) => name,
        }
    }
}

impl Serialize for Op {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Payload compression. The server only understands `"none"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    /// No compression.
    #[default]
    #[serde(rename = "none")]
    None,
}

impl Compression {
    /// Parse a compression name. Returns `None` for unsupported schemes.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "none" => Some(Compression::None),
            _ => None,
        }
    }

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
        }
    }
}

/// Params of a `Subscriber.subscribe` envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscribeParams {
    /// Message type, like `geometry_msgs/Twist`.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Topic name.
    pub topic: String,
    /// Payload compression.
    pub compression: Compression,
    /// Minimum interval between messages, in milliseconds.
    pub throttle_rate: u64,
    /// Server-side queue length.
    pub queue_length: u64,
}

/// Params carrying only a topic name (unsubscribe, unadvertise).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicParams {
    /// Topic name.
    pub topic: String,
}

impl TopicParams {
    /// Create params for the given topic.
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
        }
    }
}

/// Params of a `Publisher.advertise` envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdvertiseParams {
    /// Message type.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Topic name.
    pub topic: String,
    /// Whether the server latches the last message.
    pub latch: bool,
    /// Server-side publisher queue size.
    pub queue_size: u64,
}

/// Params of a `Publish` envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishParams {
    /// Topic name.
    pub topic: String,
    /// The message body.
    pub message: Value,
    /// Whether the server latches this message.
    pub latch: bool,
}

/// Typed params, one variant per known op plus an open JSON variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Params {
    /// Subscribe registration.
    Subscribe(SubscribeParams),
    /// Topic-only params.
    Topic(TopicParams),
    /// Advertise registration.
    Advertise(AdvertiseParams),
    /// Publish body.
    Publish(PublishParams),
    /// Anything else (service requests, future ops).
    Custom(Value),
}

/// An outbound frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    /// Operation code.
    pub op: Op,
    /// Correlation id.
    pub id: String,
    /// Protocol version. Advertise and unadvertise omit it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
    /// Operation params.
    pub params: Params,
}

impl Envelope {
    /// `Subscriber.subscribe` envelope.
    pub fn subscribe(id: impl Into<String>, version: &str, params: SubscribeParams) -> Self {
        Self {
            op: Op::Subscribe,
            id: id.into(),
            v: Some(version.to_string()),
            params: Params::Subscribe(params),
        }
    }

    /// `Subscriber.unsubscribe` envelope.
    pub fn unsubscribe(id: impl Into<String>, version: &str, params: TopicParams) -> Self {
        Self {
            op: Op::Unsubscribe,
            id: id.into(),
            v: Some(version.to_string()),
            params: Params::Topic(params),
        }
    }

    /// `Publisher.advertise` envelope.
    pub fn advertise(id: impl Into<String>, params: AdvertiseParams) -> Self {
        Self {
            op: Op::Advertise,
            id: id.into(),
            v: None,
            params: Params::Advertise(params),
        }
    }

    /// `Publisher.unadvertise` envelope.
    pub fn unadvertise(id: impl Into<String>, params: TopicParams) -> Self {
        Self {
            op: Op::Unadvertise,
            id: id.into(),
            v: None,
            params: Params::Topic(params),
        }
    }

    /// `Publish` envelope.
    pub fn publish(id: impl Into<String>, version: &str, params: PublishParams) -> Self {
        Self {
            op: Op::Publish,
            id: id.into(),
            v: Some(version.to_string()),
            params: Params::Publish(params),
        }
    }

    /// Service call envelope; `service` becomes the op.
    pub fn call_service(
        service: &str,
        id: impl Into<String>,
        version: &str,
        request: Value,
    ) -> Self {
        Self {
            op: Op::Service(service.to_string()),
            id: id.into(),
            v: Some(version.to_string()),
            params: Params::Custom(request),
        }
    }

    /// Serialize to a single-line JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
