//! Protocol dispatcher: transport signals in, bus events out.
//!
//! A [`Dispatcher`] is handed to a transport when it is attached to a
//! connection. The transport reports four signals through
//! [`Dispatcher::handle`]:
//!
//! | Signal    | Effect                                                         |
//! |-----------|----------------------------------------------------------------|
//! | `Open`    | state = Connected, queued frames flushed, `Channel::Connected` |
//! | `Close`   | state = Disconnected, `Channel::Closed`                        |
//! | `Error`   | `Channel::Error` with the raw error                            |
//! | `Message` | parsed and routed by `op`                                      |
//!
//! An `Open` from a transport the connection was told to close is ignored.
//!
//! Message routing:
//!
//! | `op`               | Destination                                          |
//! |--------------------|------------------------------------------------------|
//! | `publish`          | `Channel::Topic(topic)` with `msg`                   |
//! | `service_response` | pending call `id`, else `Channel::Response(id)`      |
//! | `call_service`     | `Channel::Service(service)`                          |
//! | `status`           | `Channel::Status(Some(id))` or `Channel::Status(None)` |
//! | anything else      | dropped                                              |
//!
//! The dispatcher holds a weak reference; once the connection is dropped,
//! signals are ignored. Signals from a transport that has since been replaced
//! are ignored too.

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;

use crate::bus::{BusEvent, Channel, CloseInfo};
use crate::connection::{Connection, Shared};
use crate::envelope::Inbound;

/// A raw inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 JSON text.
    Text(String),
    /// Binary payload. Decoding is not supported; these are dropped.
    Binary(Bytes),
}

/// Lifecycle signal reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The socket is open.
    Open,
    /// The socket closed.
    Close(CloseInfo),
    /// The socket reported an error.
    Error(String),
    /// A frame arrived.
    Message(Frame),
}

/// Routes one transport's signals into its connection.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Weak<Shared>,
    generation: u64,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("generation", &self.generation)
            .field("attached", &(self.shared.strong_count() > 0))
            .finish()
    }
}

impl Dispatcher {
    pub(crate) fn new(shared: &Arc<Shared>, generation: u64) -> Self {
        Self {
            shared: Arc::downgrade(shared),
            generation,
        }
    }

    /// Which transport attachment this dispatcher belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Handle one transport signal.
    pub fn handle(&self, event: TransportEvent) {
        let Some(conn) = self.shared.upgrade().map(Connection::from_shared) else {
            tracing::trace!("connection dropped; ignoring transport signal");
            return;
        };

        if !conn.is_current(self.generation) {
            tracing::debug!(
                generation = self.generation,
                "signal from replaced transport ignored"
            );
            return;
        }

        match event {
            TransportEvent::Open => {
                if conn.transition_open(self.generation) {
                    conn.bus().emit(&Channel::Connected, &BusEvent::Connected);
                }
            }
            TransportEvent::Close(info) => {
                if conn.transition_closed(self.generation) {
                    conn.bus().emit(&Channel::Closed, &BusEvent::Closed(info));
                }
            }
            TransportEvent::Error(error) => {
                conn.bus().emit(&Channel::Error, &BusEvent::Error(error));
            }
            TransportEvent::Message(Frame::Text(text)) => match Inbound::parse(&text) {
                Ok(inbound) => route(&conn, inbound),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed frame");
                }
            },
            TransportEvent::Message(Frame::Binary(data)) => {
                tracing::debug!(len = data.len(), "binary frames are not decoded; dropped");
            }
        }
    }
}

/// Deliver a parsed frame to its bus channel.
fn route(conn: &Connection, inbound: Inbound) {
    match inbound {
        Inbound::Publish { topic, msg } => {
            tracing::trace!(%topic, "publish");
            conn.bus().emit(&Channel::Topic(topic), &BusEvent::Publish(msg));
        }
        Inbound::ServiceResponse { id, response } => {
            if let Some(unclaimed) = conn.calls().resolve(&id, response) {
                tracing::trace!(%id, "service response without pending call");
                conn.bus()
                    .emit(&Channel::Response(id), &BusEvent::ServiceResponse(unclaimed));
            }
        }
        Inbound::CallService { service, request } => {
            conn.bus()
                .emit(&Channel::Service(service), &BusEvent::CallService(request));
        }
        Inbound::Status { id, status } => {
            conn.bus().emit(&Channel::Status(id), &BusEvent::Status(status));
        }
        Inbound::Unknown { op } => {
            tracing::trace!(?op, "unroutable frame dropped");
        }
    }
}
