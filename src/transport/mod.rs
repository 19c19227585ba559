//! Transport module - the socket under the connection.
//!
//! Provides:
//! - [`Transport`] - what the connection needs from a socket: send a text
//!   frame, request teardown
//! - [`WsTransport`] - WebSocket over tokio-tungstenite
//! - [`MemoryTransport`] - in-memory recorder for tests and embedding
//!
//! Transports report lifecycle signals (open, close, error, message) to the
//! [`Dispatcher`](crate::dispatcher::Dispatcher) they were attached with.

mod memory;
mod ws;

pub use memory::MemoryTransport;
pub use ws::{read_loop, WsDriver, WsTransport};

use crate::error::Result;

/// A socket the connection can write to.
///
/// Implementations must not block: `send_text` hands the frame off (to a
/// writer task, a buffer) and returns.
pub trait Transport: Send + Sync {
    /// Transmit one JSON text frame.
    fn send_text(&self, frame: String) -> Result<()>;

    /// Request teardown. The transport reports the close through its dispatcher.
    fn close(&self);
}
