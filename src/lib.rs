//! # mrpt-ws-client
//!
//! Rust client for the mrpt-web WebSocket server.
//!
//! One [`Connection`] carries two communication patterns:
//!
//! - **Topics** ([`Topic`]): named publish/subscribe channels
//! - **Services** ([`Service`]): named request/response calls
//!
//! ## Architecture
//!
//! ```text
//! Topic / Service ──Envelope──► Connection ──(queue until open)──► Transport ──► socket
//!                                    ▲
//!        Bus (Channel) ◄── Dispatcher ◄── open / close / error / message
//! ```
//!
//! - [`Connection`] owns the transport, the state, the correlation id counter,
//!   and the outbound queue for frames sent before the socket opens.
//! - [`Dispatcher`](dispatcher::Dispatcher) turns transport signals into
//!   state changes and routes inbound frames onto the connection's
//!   [`Bus`](bus::Bus).
//! - [`Topic`] and [`Service`] build envelopes and listen on the bus.
//!
//! ## Example
//!
//! ```ignore
//! use mrpt_ws_client::{Connection, Service, Topic};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let conn = Connection::builder().url("ws://127.0.0.1:3000").build()?;
//!
//!     let path = Topic::new(&conn, "/path", "nav_msgs/Path");
//!     path.subscribe(|message| println!("path: {}", message.as_value()))?;
//!
//!     let adder = Service::new(&conn, "add_three_ints");
//!     let response = adder.call(&json!({"a": 1, "b": 2, "c": 3})).await?;
//!     println!("sum = {}", response["sum"]);
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod transport;

mod connection;
mod service;
mod topic;
mod writer;

pub use bus::{Bus, BusEvent, Channel, CloseInfo, ListenerId};
pub use connection::{
    Connection, ConnectionBuilder, ConnectionConfig, ConnectionState, DEFAULT_PROTOCOL_VERSION,
};
pub use dispatcher::{Dispatcher, Frame, TransportEvent};
pub use envelope::{Envelope, Message, ServiceRequest, ServiceResponse};
pub use error::{BridgeError, Result};
pub use service::{classify, CallHandle, CallTable, Outcome, Service, ServiceFailure};
pub use topic::{
    ReconnectState, Topic, TopicBuilder, TopicEvent, TopicEventKind, TopicOptions,
};
pub use writer::{spawn_writer_task, Outbound, OutboundQueue, WriterHandle};
