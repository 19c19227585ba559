//! Envelope module - the JSON objects exchanged with the server.
//!
//! Provides:
//! - [`Envelope`] - outbound frame: operation code, correlation id, version, params
//! - [`Inbound`] - inbound frame classified by its `op` field
//! - [`Message`], [`Param`], [`ServiceRequest`], [`ServiceResponse`] - payload wrappers
//!
//! # Wire format
//!
//! ```text
//! {"op":"Subscriber.subscribe","id":"subscribe:/path:1","v":"1.0","params":{...}}
//! {"op":"publish","topic":"/path","msg":{...}}
//! ```
//!
//! # Example
//!
//! ```
//! use mrpt_ws_client::envelope::{Envelope, Inbound, TopicParams};
//!
//! let env = Envelope::unadvertise("advertise:/cmd_vel:1", TopicParams::new("/cmd_vel"));
//! let json = env.to_json().unwrap();
//! assert!(json.contains("Publisher.unadvertise"));
//!
//! let inbound = Inbound::parse(r#"{"op":"publish","topic":"/path","msg":{"x":1}}"#).unwrap();
//! assert!(matches!(inbound, Inbound::Publish { .. }));
//! ```

mod inbound;
mod outbound;
mod payload;

pub use inbound::Inbound;
pub use outbound::{
    correlation_id, AdvertiseParams, Compression, Envelope, Op, Params, PublishParams,
    SubscribeParams, TopicParams,
};
pub use payload::{Message, Param, ServiceRequest, ServiceResponse};
