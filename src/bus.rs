//! Message bus for connection and topic events.
//!
//! [`Emitter`] is a keyed listener list with persistent ([`Emitter::on`]) and
//! one-shot ([`Emitter::once`]) listeners. The connection owns one [`Bus`]
//! keyed by [`Channel`]; every topic owns its own emitter for local events.
//!
//! # Ordering
//!
//! Listeners for a key fire in registration order, regardless of kind. One-shot
//! listeners are removed before they run, so each fires at most once.
//!
//! # Reentrancy
//!
//! `emit` snapshots the matching listeners and releases the lock before calling
//! them. Listeners may freely register, remove, or emit from inside a callback;
//! changes take effect from the next `emit`.
//!
//! # Example
//!
//! ```
//! use mrpt_ws_client::bus::{Bus, BusEvent, Channel};
//!
//! let bus = Bus::new();
//! let id = bus.on(Channel::Connected, |_event| println!("connected"));
//! bus.emit(&Channel::Connected, &BusEvent::Connected);
//! assert!(bus.off(id));
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

/// Identifies one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Listener ids are unique across every emitter in the process.
static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

impl ListenerId {
    fn next() -> Self {
        ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

type Persistent<E> = Arc<dyn Fn(&E) + Send + Sync>;
type OneShot<E> = Box<dyn FnOnce(&E) + Send>;

enum Callback<E> {
    Persistent(Persistent<E>),
    Once(OneShot<E>),
}

struct Entry<K, E> {
    id: ListenerId,
    key: K,
    callback: Callback<E>,
}

/// Invocation snapshot taken under the lock.
enum Ready<E> {
    Persistent(Persistent<E>),
    Once(OneShot<E>),
}

/// Keyed, ordered listener list.
pub struct Emitter<K, E> {
    entries: Mutex<Vec<Entry<K, E>>>,
}

impl<K, E> Emitter<K, E>
where
    K: Eq + Clone,
{
    /// Create an emitter with no listeners.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry<K, E>>> {
        // Listeners never run under the lock; a poisoned list is still consistent.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a persistent listener.
    pub fn on<F>(&self, key: K, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId::next();
        self.lock().push(Entry {
            id,
            key,
            callback: Callback::Persistent(Arc::new(listener)),
        });
        id
    }

    /// Register a listener that fires on the next matching emit only.
    pub fn once<F>(&self, key: K, listener: F) -> ListenerId
    where
        F: FnOnce(&E) + Send + 'static,
    {
        let id = ListenerId::next();
        self.lock().push(Entry {
            id,
            key,
            callback: Callback::Once(Box::new(listener)),
        });
        id
    }

    /// Remove a listener. Returns `false` if it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut entries = self.lock();
        match entries.iter().position(|e| e.id == id) {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Number of listeners registered for `key`.
    pub fn listener_count(&self, key: &K) -> usize {
        self.lock().iter().filter(|e| &e.key == key).count()
    }

    /// Whether `id` is still registered.
    pub fn contains(&self, id: ListenerId) -> bool {
        self.lock().iter().any(|e| e.id == id)
    }

    /// Deliver `event` to every listener for `key`. Returns how many ran.
    pub fn emit(&self, key: &K, event: &E) -> usize {
        let ready = {
            let mut entries = self.lock();
            let mut ready = Vec::new();
            let mut kept = Vec::with_capacity(entries.len());

            for entry in entries.drain(..) {
                if &entry.key != key {
                    kept.push(entry);
                    continue;
                }
                match entry.callback {
                    Callback::Persistent(f) => {
                        ready.push(Ready::Persistent(Arc::clone(&f)));
                        kept.push(Entry {
                            id: entry.id,
                            key: entry.key,
                            callback: Callback::Persistent(f),
                        });
                    }
                    Callback::Once(f) => ready.push(Ready::Once(f)),
                }
            }

            *entries = kept;
            ready
        };

        let count = ready.len();
        for listener in ready {
            match listener {
                Ready::Persistent(f) => f(event),
                Ready::Once(f) => f(event),
            }
        }
        count
    }
}

impl<K: Eq + Clone, E> Default for Emitter<K, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, E> fmt::Debug for Emitter<K, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.entries.lock().map(|e| e.len()).unwrap_or(0);
        f.debug_struct("Emitter").field("listeners", &len).finish()
    }
}

/// Named channels on the connection bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// The transport reported open.
    Connected,
    /// The transport reported close.
    Closed,
    /// The transport reported an error.
    Error,
    /// Messages published on a topic.
    Topic(String),
    /// Service responses for a correlation id that no pending call claimed.
    Response(String),
    /// Inbound `call_service` requests for a service name.
    Service(String),
    /// Status reports: `Some(id)` for `status:<id>`, `None` for generic status.
    Status(Option<String>),
}

/// Close details reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// WebSocket close code (1000 = normal, 1005 = no code, 1006 = abnormal).
    pub code: u16,
    /// Human-readable close reason.
    pub reason: String,
}

impl CloseInfo {
    /// A normal close with no reason.
    pub fn normal() -> Self {
        Self {
            code: 1000,
            reason: String::new(),
        }
    }

    /// Abnormal close (no close frame).
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: 1006,
            reason: reason.into(),
        }
    }
}

/// Events delivered on the connection bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// Transport opened.
    Connected,
    /// Transport closed.
    Closed(CloseInfo),
    /// Raw transport error.
    Error(String),
    /// Topic message body (the `msg` field).
    Publish(Value),
    /// Full `service_response` frame.
    ServiceResponse(Value),
    /// Full `call_service` frame.
    CallService(Value),
    /// Full `status` frame.
    Status(Value),
}

/// The connection's message bus.
pub type Bus = Emitter<Channel, BusEvent>;
