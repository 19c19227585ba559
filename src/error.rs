//! Error types for mrpt-ws-client.
//!
//! Protocol operations only return errors for faults on the caller's side
//! (payload serialization, missing runtime, malformed URL). Transport failures
//! are reported on the connection bus as [`BusEvent::Error`](crate::bus::BusEvent),
//! and service rejections reach the caller's failure callback.

use thiserror::Error;

/// Main error type for all client operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// I/O error on the underlying socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket handshake or framing error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The connection URL could not be turned into a WebSocket request.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// No tokio runtime is available to drive the transport.
    #[error("No tokio runtime available")]
    NoRuntime,

    /// The transport is gone.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Malformed frame or envelope.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server answered a service call with `result: false`.
    #[error("Service call failed: {0}")]
    ServiceFailed(serde_json::Value),

    /// No response arrived before the call timeout.
    #[error("Service call timed out: {0}")]
    Timeout(String),

    /// The call was cancelled before a response arrived.
    #[error("Service call cancelled: {0}")]
    Cancelled(String),
}

/// Result type alias using BridgeError.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<std::convert::Infallible> for BridgeError {
    fn from(never: std::convert::Infallible) -> Self {
        match never {}
    }
}
