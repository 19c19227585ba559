//! In-memory transport.
//!
//! Records every frame handed to it. Lifecycle signals are driven by hand
//! through the [`Dispatcher`](crate::dispatcher::Dispatcher) returned from
//! [`Connection::attach`](crate::Connection::attach).
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use mrpt_ws_client::dispatcher::TransportEvent;
//! use mrpt_ws_client::transport::MemoryTransport;
//! use mrpt_ws_client::Connection;
//!
//! let conn = Connection::new();
//! let transport = MemoryTransport::new();
//! let dispatcher = conn.attach(Arc::new(transport.clone()));
//!
//! dispatcher.handle(TransportEvent::Open);
//! assert!(conn.is_connected());
//! assert!(transport.frames().is_empty());
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use super::Transport;
use crate::error::Result;

#[derive(Debug, Default)]
struct Shared {
    frames: Mutex<Vec<String>>,
    close_requests: AtomicUsize,
}

/// Transport that keeps sent frames in memory.
///
/// Clones share the same frame log.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl MemoryTransport {
    /// Create an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self) -> MutexGuard<'_, Vec<String>> {
        self.shared.frames.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Frames sent so far, in order.
    pub fn frames(&self) -> Vec<String> {
        self.log().clone()
    }

    /// Frames sent so far, parsed as JSON. Unparseable frames are skipped.
    pub fn envelopes(&self) -> Vec<Value> {
        self.log()
            .iter()
            .filter_map(|f| serde_json::from_str(f).ok())
            .collect()
    }

    /// Drain the frame log.
    pub fn take_frames(&self) -> Vec<String> {
        std::mem::take(&mut *self.log())
    }

    /// Drain the frame log, parsed as JSON.
    pub fn take_envelopes(&self) -> Vec<Value> {
        self.take_frames()
            .iter()
            .filter_map(|f| serde_json::from_str(f).ok())
            .collect()
    }

    /// How many times `close` was requested.
    pub fn close_requests(&self) -> usize {
        self.shared.close_requests.load(Ordering::Acquire)
    }
}

impl Transport for MemoryTransport {
    fn send_text(&self, frame: String) -> Result<()> {
        tracing::trace!(len = frame.len(), "memory transport frame");
        self.log().push(frame);
        Ok(())
    }

    fn close(&self) {
        self.shared.close_requests.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_in_order() {
        let transport = MemoryTransport::new();
        transport.send_text(r#"{"n":1}"#.into()).unwrap();
        transport.send_text(r#"{"n":2}"#.into()).unwrap();

        let envelopes = transport.envelopes();
        assert_eq!(envelopes.len(), 2);
        assert_eq!(envelopes[0]["n"], 1);
        assert_eq!(envelopes[1]["n"], 2);
    }

    #[test]
    fn test_take_drains() {
        let transport = MemoryTransport::new();
        transport.send_text("a".into()).unwrap();
        assert_eq!(transport.take_frames(), vec!["a".to_string()]);
        assert!(transport.frames().is_empty());
    }

    #[test]
    fn test_clones_share_log() {
        let transport = MemoryTransport::new();
        let clone = transport.clone();
        clone.send_text("x".into()).unwrap();
        clone.close();

        assert_eq!(transport.frames().len(), 1);
        assert_eq!(transport.close_requests(), 1);
    }
}
