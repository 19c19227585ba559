//! Connection builder and manager.
//!
//! The [`ConnectionBuilder`] provides a fluent API for configuring the
//! connection. The [`Connection`] owns everything shared by the topics and
//! services that use it:
//! 1. The transport handle and connection state
//! 2. The correlation id counter
//! 3. The outbound queue for frames sent before the socket is open
//! 4. The message bus and the pending service-call table
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──open──► Connected ──close──► Disconnected
//! ```
//!
//! # Example
//!
//! ```ignore
//! use mrpt_ws_client::{Connection, Topic};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let conn = Connection::builder()
//!         .url("ws://127.0.0.1:8080")
//!         .version("1.0")
//!         .build()?;
//!
//!     let cmd_vel = Topic::new(&conn, "/cmd_vel", "geometry_msgs/Twist");
//!     cmd_vel.publish(&serde_json::json!({"linear": {"x": 0.1, "y": 0.0, "z": 0.0}}))?;
//!     Ok(())
//! }
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;

use crate::bus::{Bus, BusEvent, Channel};
use crate::dispatcher::Dispatcher;
use crate::envelope::Envelope;
use crate::error::{BridgeError, Result};
use crate::service::CallTable;
use crate::transport::{Transport, WsTransport};

/// Default protocol version sent in the `v` field.
pub const DEFAULT_PROTOCOL_VERSION: &str = "1.0";

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No open socket.
    Disconnected,
    /// Socket requested, not yet open.
    Connecting,
    /// Socket open; sends go straight out.
    Connected,
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server URL. When set, `ConnectionBuilder::build` connects immediately.
    pub url: Option<String>,
    /// Protocol version sent in the `v` field.
    pub version: String,
    /// Default timeout for service calls. `None` waits forever.
    pub call_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: None,
            version: DEFAULT_PROTOCOL_VERSION.to_string(),
            call_timeout: None,
        }
    }
}

/// Builder for configuring and creating a [`Connection`].
#[derive(Debug, Default)]
pub struct ConnectionBuilder {
    config: ConnectionConfig,
}

impl ConnectionBuilder {
    /// Create a new connection builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Server URL, like `ws://127.0.0.1:8080`.
    pub fn url(mut self, url: &str) -> Self {
        self.config.url = Some(url.to_string());
        self
    }

    /// Protocol version sent in the `v` field.
    ///
    /// Default: "1.0"
    pub fn version(mut self, version: &str) -> Self {
        self.config.version = version.to_string();
        self
    }

    /// Default timeout for service calls made through this connection.
    ///
    /// Default: none (a call without a response stays pending)
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = Some(timeout);
        self
    }

    /// Build the connection, connecting right away if a URL was given.
    ///
    /// Connecting needs a tokio runtime.
    pub fn build(self) -> Result<Connection> {
        let url = self.config.url.clone();
        let conn = Connection::with_config(self.config);
        if let Some(url) = url {
            conn.connect(&url)?;
        }
        Ok(conn)
    }
}

/// Socket-side state guarded by one lock.
struct Link {
    state: ConnectionState,
    transport: Option<Arc<dyn Transport>>,
    url: Option<String>,
    generation: u64,
    /// Teardown requested on the current transport; nothing more goes out on it.
    closing: bool,
    queue: VecDeque<String>,
}

impl Link {
    fn accepts_sends(&self) -> bool {
        self.state == ConnectionState::Connected && !self.closing
    }
}

pub(crate) struct Shared {
    config: ConnectionConfig,
    link: Mutex<Link>,
    id_counter: AtomicU64,
    bus: Bus,
    calls: Arc<CallTable>,
}

/// Handle to one server connection.
///
/// Cheaply cloneable; clones share the socket, the id counter, and the bus.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let link = self.link();
        f.debug_struct("Connection")
            .field("url", &link.url)
            .field("state", &link.state)
            .field("queued", &link.queue.len())
            .field("version", &self.shared.config.version)
            .finish_non_exhaustive()
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    /// Create a new connection builder.
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    /// A disconnected connection with default configuration.
    pub fn new() -> Self {
        Self::with_config(ConnectionConfig::default())
    }

    /// A disconnected connection with the given configuration.
    ///
    /// `config.url` is recorded but not connected; see [`ConnectionBuilder::build`].
    pub fn with_config(config: ConnectionConfig) -> Self {
        let url = config.url.clone();
        Self {
            shared: Arc::new(Shared {
                config,
                link: Mutex::new(Link {
                    state: ConnectionState::Disconnected,
                    transport: None,
                    url,
                    generation: 0,
                    closing: false,
                    queue: VecDeque::new(),
                }),
                id_counter: AtomicU64::new(0),
                bus: Bus::new(),
                calls: Arc::new(CallTable::new()),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.shared.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a WebSocket to `url`.
    ///
    /// Returns once the socket is requested; the open is reported on
    /// [`Channel::Connected`]. Any previous socket is closed.
    pub fn connect(&self, url: &str) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BridgeError::NoRuntime)?;
        let (transport, driver) = WsTransport::prepare(url)?;
        let dispatcher = self.install(Arc::new(transport), Some(url.to_string()));
        tracing::debug!(%url, generation = dispatcher.generation(), "connect requested");
        runtime.spawn(driver.run(dispatcher));
        Ok(())
    }

    /// Attach a custom transport. The returned dispatcher receives its signals.
    ///
    /// Any previous transport is closed. The state becomes `Connecting`
    /// until the transport reports open.
    pub fn attach(&self, transport: Arc<dyn Transport>) -> Dispatcher {
        self.install(transport, None)
    }

    fn install(&self, transport: Arc<dyn Transport>, url: Option<String>) -> Dispatcher {
        let mut link = self.link();
        if let Some(old) = link.transport.take() {
            old.close();
        }
        link.generation += 1;
        link.state = ConnectionState::Connecting;
        link.closing = false;
        link.transport = Some(transport);
        if url.is_some() {
            link.url = url;
        }
        Dispatcher::new(&self.shared, link.generation)
    }

    /// Request transport teardown.
    ///
    /// Frames still queued for the next open stay queued, including frames
    /// sent after this call. An open reported by the closing transport
    /// is ignored.
    pub fn close(&self) {
        let transport = {
            let mut link = self.link();
            if link.transport.is_some() {
                link.closing = true;
            }
            link.transport.clone()
        };
        match transport {
            Some(transport) => {
                tracing::debug!("close requested");
                transport.close();
            }
            None => tracing::trace!("close without transport"),
        }
    }

    /// Send an envelope now if connected, otherwise when the socket opens.
    ///
    /// Frames queued while not connected go out in issuance order, before
    /// [`Channel::Connected`] listeners run.
    pub fn send(&self, envelope: &Envelope) -> Result<()> {
        let frame = envelope.to_json()?;
        self.send_frame(frame);
        Ok(())
    }

    /// Like [`send`](Self::send), but while not connected a frame identical
    /// to one already queued is dropped. Returns whether the frame was taken.
    pub(crate) fn send_unless_queued(&self, envelope: &Envelope) -> Result<bool> {
        let frame = envelope.to_json()?;
        {
            let link = self.link();
            if !link.accepts_sends() && link.queue.contains(&frame) {
                tracing::trace!("identical frame already queued");
                return Ok(false);
            }
        }
        self.send_frame(frame);
        Ok(true)
    }

    fn send_frame(&self, frame: String) {
        let failure = {
            let mut link = self.link();
            match link.transport.clone() {
                Some(transport) if link.accepts_sends() => {
                    tracing::trace!(len = frame.len(), "send");
                    transport.send_text(frame).err()
                }
                _ => {
                    link.queue.push_back(frame);
                    tracing::trace!(queued = link.queue.len(), "send deferred until connected");
                    None
                }
            }
        };

        if let Some(e) = failure {
            self.report_send_failure(e);
        }
    }

    fn report_send_failure(&self, error: BridgeError) {
        tracing::warn!(error = %error, "transport rejected frame");
        self.shared
            .bus
            .emit(&Channel::Error, &BusEvent::Error(error.to_string()));
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.link().generation == generation
    }

    /// Mark connected and flush the queue.
    ///
    /// Returns `false` for a stale generation or a transport already told to close.
    pub(crate) fn transition_open(&self, generation: u64) -> bool {
        let failures = {
            let mut link = self.link();
            if link.generation != generation {
                return false;
            }
            if link.closing {
                tracing::debug!(generation, queued = link.queue.len(), "open after close request ignored");
                return false;
            }
            link.state = ConnectionState::Connected;

            let mut failures = Vec::new();
            if let Some(transport) = link.transport.clone() {
                if !link.queue.is_empty() {
                    tracing::debug!(frames = link.queue.len(), "flushing queued frames");
                }
                while let Some(frame) = link.queue.pop_front() {
                    if let Err(e) = transport.send_text(frame) {
                        failures.push(e);
                    }
                }
            }
            failures
        };

        tracing::debug!(generation, "connected");
        for e in failures {
            self.report_send_failure(e);
        }
        true
    }

    /// Mark disconnected. Returns `false` for a stale generation.
    pub(crate) fn transition_closed(&self, generation: u64) -> bool {
        let mut link = self.link();
        if link.generation != generation {
            return false;
        }
        link.state = ConnectionState::Disconnected;
        link.closing = false;
        tracing::debug!(generation, queued = link.queue.len(), "disconnected");
        true
    }

    /// Allocate the next correlation counter value. Never repeats.
    pub fn next_id(&self) -> u64 {
        self.shared.id_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.link().state
    }

    /// Whether the socket is open.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Protocol version sent in the `v` field.
    pub fn version(&self) -> &str {
        &self.shared.config.version
    }

    /// The last URL passed to `connect`.
    pub fn url(&self) -> Option<String> {
        self.link().url.clone()
    }

    /// Default timeout for service calls.
    pub fn call_timeout(&self) -> Option<Duration> {
        self.shared.config.call_timeout
    }

    /// Frames waiting for the socket to open.
    pub fn queued_frames(&self) -> usize {
        self.link().queue.len()
    }

    /// The connection's message bus.
    pub fn bus(&self) -> &Bus {
        &self.shared.bus
    }

    /// The pending service-call table.
    pub fn calls(&self) -> &Arc<CallTable> {
        &self.shared.calls
    }

    /// Number of service calls still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.calls.len()
    }

    /// List the topics published on the server.
    ///
    /// The server protocol defines no request for this; the callback
    /// completes immediately with `None`.
    pub fn get_topics<F: FnOnce(Option<Value>)>(&self, callback: F) {
        tracing::debug!("get_topics has no protocol support");
        callback(None)
    }

    /// Describe one topic. Completes immediately with `None`.
    pub fn get_topic_details<F: FnOnce(Option<Value>)>(&self, topic: &str, callback: F) {
        tracing::debug!(%topic, "get_topic_details has no protocol support");
        callback(None)
    }

    /// List the services offered by the server. Completes immediately with `None`.
    pub fn get_services<F: FnOnce(Option<Value>)>(&self, callback: F) {
        tracing::debug!("get_services has no protocol support");
        callback(None)
    }

    /// Describe one service. Completes immediately with `None`.
    pub fn get_service_details<F: FnOnce(Option<Value>)>(&self, service: &str, callback: F) {
        tracing::debug!(%service, "get_service_details has no protocol support");
        callback(None)
    }
}
