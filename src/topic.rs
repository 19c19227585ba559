//! Topic channel: publish/subscribe registration for one topic name.
//!
//! A [`Topic`] tracks its own registration state on top of the shared
//! connection:
//!
//! - `subscribe` sends `Subscriber.subscribe` once, then only attaches handlers
//! - `advertise` sends `Publisher.advertise` once until `unadvertise`
//! - `publish` advertises first when needed
//!
//! # Reconnect
//!
//! With `reconnect_on_close` (the default) the topic watches the connection's
//! `Closed` channel. Each close moves it from [`ReconnectState::Idle`] to
//! [`ReconnectState::PendingResubscribe`] and queues its active registration
//! envelopes; the next `Connected` returns it to `Idle`. Further closes while
//! pending queue nothing, so one close/connect cycle re-registers exactly once.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use mrpt_ws_client::{Connection, Topic};
//! use mrpt_ws_client::dispatcher::TransportEvent;
//! use mrpt_ws_client::transport::MemoryTransport;
//!
//! let conn = Connection::new();
//! let transport = MemoryTransport::new();
//! let dispatcher = conn.attach(Arc::new(transport.clone()));
//!
//! let cmd_vel = Topic::new(&conn, "/cmd_vel", "geometry_msgs/Twist");
//! cmd_vel.publish(&serde_json::json!({"linear": {"x": 0.1}})).unwrap();
//!
//! dispatcher.handle(TransportEvent::Open);
//! assert_eq!(transport.frames().len(), 2);
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::{Deserialize, Serialize};

use crate::bus::{BusEvent, Channel, Emitter, ListenerId};
use crate::connection::Connection;
use crate::envelope::{
    correlation_id, AdvertiseParams, Compression, Envelope, Message, PublishParams,
    SubscribeParams, TopicParams,
};
use crate::error::Result;

/// Topic configuration.
///
/// Deserializable with defaults for every field, so options can come from a
/// JSON config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicOptions {
    /// Message type, like `geometry_msgs/Twist`.
    #[serde(alias = "type")]
    pub message_type: String,
    /// Compression name. Only `"none"` is supported.
    pub compression: String,
    /// Minimum interval between messages in milliseconds. Negative becomes 0.
    pub throttle_rate: i64,
    /// Latch the topic when publishing.
    pub latch: bool,
    /// Server-side publisher queue size.
    pub queue_size: u64,
    /// Server-side subscriber queue length.
    pub queue_length: u64,
    /// Re-send active registrations after the connection reopens.
    pub reconnect_on_close: bool,
    /// Treat the topic as already advertised.
    pub is_advertised: bool,
}

impl Default for TopicOptions {
    fn default() -> Self {
        Self {
            message_type: String::new(),
            compression: Compression::None.as_str().to_string(),
            throttle_rate: 0,
            latch: false,
            queue_size: 100,
            queue_length: 0,
            reconnect_on_close: true,
            is_advertised: false,
        }
    }
}

/// Kinds of local topic events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicEventKind {
    /// A subscribed message arrived.
    Message,
    /// A configuration value was corrected.
    Warning,
    /// The subscription was dropped.
    Unsubscribe,
    /// The advertisement was dropped.
    Unadvertise,
}

/// Local topic events.
#[derive(Debug, Clone, PartialEq)]
pub enum TopicEvent {
    /// A subscribed message arrived.
    Message(Message),
    /// A configuration value was corrected.
    Warning(String),
    /// The subscription was dropped.
    Unsubscribe,
    /// The advertisement was dropped.
    Unadvertise,
}

impl TopicEvent {
    /// The kind this event is emitted under.
    pub fn kind(&self) -> TopicEventKind {
        match self {
            TopicEvent::Message(_) => TopicEventKind::Message,
            TopicEvent::Warning(_) => TopicEventKind::Warning,
            TopicEvent::Unsubscribe => TopicEventKind::Unsubscribe,
            TopicEvent::Unadvertise => TopicEventKind::Unadvertise,
        }
    }
}

/// Re-registration progress after a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectState {
    /// Nothing pending.
    #[default]
    Idle,
    /// Registrations are queued for the next open.
    PendingResubscribe,
}

/// Builder for a [`Topic`].
pub struct TopicBuilder {
    conn: Connection,
    name: String,
    options: TopicOptions,
    warning_hooks: Vec<Box<dyn Fn(&str) + Send + Sync>>,
}

impl fmt::Debug for TopicBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicBuilder")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("warning_hooks", &self.warning_hooks.len())
            .finish()
    }
}

impl TopicBuilder {
    /// Start a topic named `name` on `conn` with default options.
    pub fn new(conn: &Connection, name: &str) -> Self {
        Self {
            conn: conn.clone(),
            name: name.to_string(),
            options: TopicOptions::default(),
            warning_hooks: Vec::new(),
        }
    }

    /// Replace every option at once.
    pub fn options(mut self, options: TopicOptions) -> Self {
        self.options = options;
        self
    }

    /// Message type, like `geometry_msgs/Twist`.
    pub fn message_type(mut self, message_type: &str) -> Self {
        self.options.message_type = message_type.to_string();
        self
    }

    /// Compression name. Anything but `"none"` is corrected with a warning.
    pub fn compression(mut self, compression: &str) -> Self {
        self.options.compression = compression.to_string();
        self
    }

    /// Throttle rate in milliseconds. Negative values are corrected with a warning.
    pub fn throttle_rate(mut self, throttle_rate: i64) -> Self {
        self.options.throttle_rate = throttle_rate;
        self
    }

    /// Latch the topic when publishing.
    pub fn latch(mut self, latch: bool) -> Self {
        self.options.latch = latch;
        self
    }

    /// Server-side publisher queue size.
    ///
    /// Default: 100
    pub fn queue_size(mut self, queue_size: u64) -> Self {
        self.options.queue_size = queue_size;
        self
    }

    /// Server-side subscriber queue length.
    pub fn queue_length(mut self, queue_length: u64) -> Self {
        self.options.queue_length = queue_length;
        self
    }

    /// Re-send registrations after a reconnect.
    ///
    /// Default: true
    pub fn reconnect_on_close(mut self, enabled: bool) -> Self {
        self.options.reconnect_on_close = enabled;
        self
    }

    /// Treat the topic as already advertised.
    pub fn is_advertised(mut self, advertised: bool) -> Self {
        self.options.is_advertised = advertised;
        self
    }

    /// Observe configuration warnings raised while building.
    pub fn on_warning<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.warning_hooks.push(Box::new(hook));
        self
    }

    /// Validate the options and create the topic.
    pub fn build(self) -> Topic {
        let TopicBuilder {
            conn,
            name,
            options,
            warning_hooks,
        } = self;

        let events = Emitter::new();
        for hook in warning_hooks {
            events.on(TopicEventKind::Warning, move |event: &TopicEvent| {
                if let TopicEvent::Warning(text) = event {
                    hook(text);
                }
            });
        }

        let warn = |text: String| {
            tracing::warn!(topic = %name, "{}", text);
            events.emit(&TopicEventKind::Warning, &TopicEvent::Warning(text));
        };

        let compression = match Compression::parse(&options.compression) {
            Some(compression) => compression,
            None => {
                warn(format!(
                    "{} compression is not supported. No compression will be used",
                    options.compression
                ));
                Compression::None
            }
        };

        let throttle_rate = if options.throttle_rate < 0 {
            warn(format!("{} is not allowed. Set to 0.", options.throttle_rate));
            0
        } else {
            options.throttle_rate.unsigned_abs()
        };

        let registration = Registration {
            is_advertised: options.is_advertised,
            ..Registration::default()
        };

        Topic {
            inner: Arc::new(TopicInner {
                conn,
                name,
                message_type: options.message_type,
                compression,
                throttle_rate,
                latch: options.latch,
                queue_size: options.queue_size,
                queue_length: options.queue_length,
                reconnect_on_close: options.reconnect_on_close,
                events,
                registration: Mutex::new(registration),
            }),
        }
    }
}

#[derive(Default)]
struct Registration {
    /// Active subscribe envelope; its id is the subscribe id.
    subscribe: Option<Envelope>,
    /// Active advertise envelope, kept for re-sending.
    advertise: Option<Envelope>,
    advertise_id: Option<String>,
    is_advertised: bool,
    wire_listener: Option<ListenerId>,
    reconnect_hook: Option<ListenerId>,
    reconnect_state: ReconnectState,
    advertise_reset: Option<ListenerId>,
}

struct TopicInner {
    conn: Connection,
    name: String,
    message_type: String,
    compression: Compression,
    throttle_rate: u64,
    latch: bool,
    queue_size: u64,
    queue_length: u64,
    reconnect_on_close: bool,
    events: Emitter<TopicEventKind, TopicEvent>,
    registration: Mutex<Registration>,
}

impl Drop for TopicInner {
    fn drop(&mut self) {
        let reg = self
            .registration
            .get_mut()
            .unwrap_or_else(|e| e.into_inner());
        let bus = self.conn.bus();
        for id in [
            reg.wire_listener.take(),
            reg.reconnect_hook.take(),
            reg.advertise_reset.take(),
        ]
        .into_iter()
        .flatten()
        {
            bus.off(id);
        }
    }
}

/// A named topic on a connection.
///
/// Cheaply cloneable; clones share registration state.
#[derive(Clone)]
pub struct Topic {
    inner: Arc<TopicInner>,
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reg = self.inner.reg();
        f.debug_struct("Topic")
            .field("name", &self.inner.name)
            .field("message_type", &self.inner.message_type)
            .field("subscribed", &reg.subscribe.is_some())
            .field("advertised", &reg.is_advertised)
            .field("reconnect_state", &reg.reconnect_state)
            .finish_non_exhaustive()
    }
}

impl TopicInner {
    fn reg(&self) -> MutexGuard<'_, Registration> {
        self.registration.lock().unwrap_or_else(|e| e.into_inner())
    }

}

/// Install the reconnect hook if enabled and not installed yet.
fn ensure_reconnect_hook(inner: &Arc<TopicInner>, reg: &mut Registration) {
    if !inner.reconnect_on_close || reg.reconnect_hook.is_some() {
        return;
    }
    let weak = Arc::downgrade(inner);
    reg.reconnect_hook = Some(inner.conn.bus().on(Channel::Closed, move |_| {
        if let Some(inner) = weak.upgrade() {
            reregister(&inner);
        }
    }));
}

/// Remove the reconnect hook once nothing is registered.
fn release_reconnect_hook(inner: &TopicInner, reg: &mut Registration) {
    if reg.subscribe.is_some() || reg.advertise.is_some() {
        return;
    }
    if let Some(id) = reg.reconnect_hook.take() {
        inner.conn.bus().off(id);
    }
}

/// Closed-channel reaction: queue active registrations once per cycle.
fn reregister(inner: &Arc<TopicInner>) {
    let envelopes = {
        let mut reg = inner.reg();
        if reg.reconnect_state == ReconnectState::PendingResubscribe {
            tracing::trace!(topic = %inner.name, "re-registration already pending");
            return;
        }
        let envelopes: Vec<Envelope> = reg
            .subscribe
            .iter()
            .chain(reg.advertise.iter())
            .cloned()
            .collect();
        if envelopes.is_empty() {
            return;
        }
        reg.reconnect_state = ReconnectState::PendingResubscribe;
        envelopes
    };

    let weak: Weak<TopicInner> = Arc::downgrade(inner);
    inner.conn.bus().once(Channel::Connected, move |_| {
        if let Some(inner) = weak.upgrade() {
            inner.reg().reconnect_state = ReconnectState::Idle;
        }
    });

    tracing::debug!(topic = %inner.name, frames = envelopes.len(), "re-registration queued");
    // A registration still queued from before the close goes out on the next open as is
    for envelope in &envelopes {
        if let Err(e) = inner.conn.send_unless_queued(envelope) {
            tracing::warn!(topic = %inner.name, error = %e, "re-registration failed");
            return;
        }
    }
}

impl Topic {
    /// A topic with default options.
    pub fn new(conn: &Connection, name: &str, message_type: &str) -> Self {
        TopicBuilder::new(conn, name).message_type(message_type).build()
    }

    /// Start configuring a topic.
    pub fn builder(conn: &Connection, name: &str) -> TopicBuilder {
        TopicBuilder::new(conn, name)
    }

    /// Attach `handler` to received messages and subscribe if not yet subscribed.
    ///
    /// Handlers are never deduplicated. Only the first call while unsubscribed
    /// sends a `Subscriber.subscribe` envelope.
    pub fn subscribe<F>(&self, handler: F) -> Result<ListenerId>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let inner = &self.inner;
        let handler_id = inner.events.on(TopicEventKind::Message, move |event| {
            if let TopicEvent::Message(message) = event {
                handler(message);
            }
        });

        let envelope = {
            let mut reg = inner.reg();
            if reg.subscribe.is_some() {
                return Ok(handler_id);
            }

            let weak = Arc::downgrade(inner);
            reg.wire_listener = Some(inner.conn.bus().on(
                Channel::Topic(inner.name.clone()),
                move |event| {
                    if let (Some(inner), BusEvent::Publish(msg)) = (weak.upgrade(), event) {
                        inner.events.emit(
                            &TopicEventKind::Message,
                            &TopicEvent::Message(Message::from(msg.clone())),
                        );
                    }
                },
            ));

            let id = correlation_id("subscribe", &inner.name, inner.conn.next_id());
            let envelope = Envelope::subscribe(
                id,
                inner.conn.version(),
                SubscribeParams {
                    message_type: inner.message_type.clone(),
                    topic: inner.name.clone(),
                    compression: inner.compression,
                    throttle_rate: inner.throttle_rate,
                    queue_length: inner.queue_length,
                },
            );
            reg.subscribe = Some(envelope.clone());
            ensure_reconnect_hook(inner, &mut reg);
            envelope
        };

        tracing::debug!(topic = %inner.name, id = %envelope.id, "subscribe");
        inner.conn.send(&envelope)?;
        Ok(handler_id)
    }

    /// Detach a handler, and unsubscribe when none remain.
    ///
    /// With `Some(handler)` only that handler is removed; the subscription
    /// stays while other handlers are attached. With `None` the subscription
    /// is dropped and attached handlers are left for the caller to remove.
    pub fn unsubscribe(&self, handler: Option<ListenerId>) -> Result<()> {
        let inner = &self.inner;
        if let Some(handler) = handler {
            inner.events.off(handler);
            if inner.events.listener_count(&TopicEventKind::Message) > 0 {
                return Ok(());
            }
        }

        let envelope = {
            let mut reg = inner.reg();
            let Some(subscribe) = reg.subscribe.take() else {
                return Ok(());
            };
            if let Some(id) = reg.wire_listener.take() {
                inner.conn.bus().off(id);
            }
            release_reconnect_hook(inner, &mut reg);
            Envelope::unsubscribe(
                subscribe.id,
                inner.conn.version(),
                TopicParams::new(&inner.name),
            )
        };

        tracing::debug!(topic = %inner.name, id = %envelope.id, "unsubscribe");
        inner
            .events
            .emit(&TopicEventKind::Unsubscribe, &TopicEvent::Unsubscribe);
        inner.conn.send(&envelope)
    }

    /// Register as a publisher. No-op while advertised.
    pub fn advertise(&self) -> Result<()> {
        let inner = &self.inner;
        let envelope = {
            let mut reg = inner.reg();
            if reg.is_advertised {
                return Ok(());
            }

            let id = correlation_id("advertise", &inner.name, inner.conn.next_id());
            let envelope = Envelope::advertise(
                id.clone(),
                AdvertiseParams {
                    message_type: inner.message_type.clone(),
                    topic: inner.name.clone(),
                    latch: inner.latch,
                    queue_size: inner.queue_size,
                },
            );
            reg.advertise_id = Some(id);
            reg.is_advertised = true;

            if inner.reconnect_on_close {
                reg.advertise = Some(envelope.clone());
                ensure_reconnect_hook(inner, &mut reg);
            } else if reg.advertise_reset.is_none() {
                // The server forgets publishers on close; advertise again next publish
                let weak = Arc::downgrade(inner);
                reg.advertise_reset = Some(inner.conn.bus().once(Channel::Closed, move |_| {
                    if let Some(inner) = weak.upgrade() {
                        let mut reg = inner.reg();
                        reg.is_advertised = false;
                        reg.advertise_reset = None;
                    }
                }));
            }
            envelope
        };

        tracing::debug!(topic = %inner.name, id = %envelope.id, "advertise");
        inner.conn.send(&envelope)
    }

    /// Unregister as a publisher. No-op unless advertised.
    pub fn unadvertise(&self) -> Result<()> {
        let inner = &self.inner;
        let envelope = {
            let mut reg = inner.reg();
            if !reg.is_advertised {
                return Ok(());
            }
            reg.is_advertised = false;
            reg.advertise = None;
            if let Some(id) = reg.advertise_reset.take() {
                inner.conn.bus().off(id);
            }
            release_reconnect_hook(inner, &mut reg);

            let id = match reg.advertise_id.clone() {
                Some(id) => id,
                None => correlation_id("advertise", &inner.name, inner.conn.next_id()),
            };
            Envelope::unadvertise(id, TopicParams::new(&inner.name))
        };

        tracing::debug!(topic = %inner.name, id = %envelope.id, "unadvertise");
        inner
            .events
            .emit(&TopicEventKind::Unadvertise, &TopicEvent::Unadvertise);
        inner.conn.send(&envelope)
    }

    /// Publish `message`, advertising first if needed.
    pub fn publish<T: Serialize + ?Sized>(&self, message: &T) -> Result<()> {
        let inner = &self.inner;
        let message = serde_json::to_value(message)?;
        if !self.is_advertised() {
            self.advertise()?;
        }

        let id = correlation_id("publish", &inner.name, inner.conn.next_id());
        tracing::trace!(topic = %inner.name, %id, "publish");
        inner.conn.send(&Envelope::publish(
            id,
            inner.conn.version(),
            PublishParams {
                topic: inner.name.clone(),
                message,
                latch: inner.latch,
            },
        ))
    }

    /// Listen for local topic events of one kind.
    pub fn on<F>(&self, kind: TopicEventKind, listener: F) -> ListenerId
    where
        F: Fn(&TopicEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, listener)
    }

    /// Remove a listener or handler.
    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }

    /// Number of attached message handlers.
    pub fn handler_count(&self) -> usize {
        self.inner.events.listener_count(&TopicEventKind::Message)
    }

    /// Topic name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Message type.
    pub fn message_type(&self) -> &str {
        &self.inner.message_type
    }

    /// Effective compression.
    pub fn compression(&self) -> Compression {
        self.inner.compression
    }

    /// Effective throttle rate.
    pub fn throttle_rate(&self) -> u64 {
        self.inner.throttle_rate
    }

    /// Whether publishes are latched.
    pub fn latch(&self) -> bool {
        self.inner.latch
    }

    /// Server-side publisher queue size.
    pub fn queue_size(&self) -> u64 {
        self.inner.queue_size
    }

    /// Server-side subscriber queue length.
    pub fn queue_length(&self) -> u64 {
        self.inner.queue_length
    }

    /// Whether registrations are re-sent after a reconnect.
    pub fn reconnect_on_close(&self) -> bool {
        self.inner.reconnect_on_close
    }

    /// Whether an advertise is in effect.
    pub fn is_advertised(&self) -> bool {
        self.inner.reg().is_advertised
    }

    /// Whether a subscription is active.
    pub fn is_subscribed(&self) -> bool {
        self.inner.reg().subscribe.is_some()
    }

    /// Correlation id of the active subscription.
    pub fn subscribe_id(&self) -> Option<String> {
        self.inner.reg().subscribe.as_ref().map(|e| e.id.clone())
    }

    /// Correlation id of the last advertise.
    pub fn advertise_id(&self) -> Option<String> {
        self.inner.reg().advertise_id.clone()
    }

    /// Re-registration progress.
    pub fn reconnect_state(&self) -> ReconnectState {
        self.inner.reg().reconnect_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::CloseInfo;
    use crate::dispatcher::{Dispatcher, Frame, TransportEvent};
    use crate::transport::MemoryTransport;
    use serde_json::{json, Value};

    fn setup() -> (Connection, MemoryTransport, Dispatcher) {
        let conn = Connection::new();
        let transport = MemoryTransport::new();
        let dispatcher = conn.attach(Arc::new(transport.clone()));
        (conn, transport, dispatcher)
    }

    fn ops(transport: &MemoryTransport) -> Vec<String> {
        transport
            .take_envelopes()
            .iter()
            .map(|e| e["op"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    fn publish_frame(topic: &str, msg: Value) -> TransportEvent {
        TransportEvent::Message(Frame::Text(
            json!({"op": "publish", "topic": topic, "msg": msg}).to_string(),
        ))
    }

    fn cycle(dispatcher: &Dispatcher) {
        dispatcher.handle(TransportEvent::Close(CloseInfo::abnormal("drop")));
        dispatcher.handle(TransportEvent::Open);
    }

    #[test]
    fn test_default_options() {
        let options = TopicOptions::default();
        assert_eq!(options.compression, "none");
        assert_eq!(options.queue_size, 100);
        assert_eq!(options.queue_length, 0);
        assert!(options.reconnect_on_close);
        assert!(!options.latch);
    }

    #[test]
    fn test_builder_settings_are_exposed() {
        let conn = Connection::new();
        let topic = Topic::builder(&conn, "/map")
            .message_type("nav_msgs/OccupancyGrid")
            .latch(true)
            .queue_size(5)
            .queue_length(2)
            .reconnect_on_close(false)
            .build();

        assert_eq!(topic.name(), "/map");
        assert_eq!(topic.message_type(), "nav_msgs/OccupancyGrid");
        assert!(topic.latch());
        assert_eq!(topic.queue_size(), 5);
        assert_eq!(topic.queue_length(), 2);
        assert!(!topic.reconnect_on_close());
    }

    #[test]
    fn test_options_from_json() {
        let options: TopicOptions =
            serde_json::from_str(r#"{"type": "nav_msgs/Path", "latch": true}"#).unwrap();
        assert_eq!(options.message_type, "nav_msgs/Path");
        assert!(options.latch);
        assert_eq!(options.queue_size, 100);
    }

    #[test]
    fn test_invalid_options_warn_and_correct() {
        let conn = Connection::new();
        let warnings = Arc::new(Mutex::new(Vec::new()));
        let w = warnings.clone();

        let topic = Topic::builder(&conn, "/scan")
            .compression("png")
            .throttle_rate(-5)
            .on_warning(move |text| w.lock().unwrap().push(text.to_string()))
            .build();

        assert_eq!(topic.compression(), Compression::None);
        assert_eq!(topic.throttle_rate(), 0);
        assert_eq!(
            *warnings.lock().unwrap(),
            vec![
                "png compression is not supported. No compression will be used".to_string(),
                "-5 is not allowed. Set to 0.".to_string(),
            ]
        );
    }

    #[test]
    fn test_subscribe_sends_once() {
        let (conn, transport, dispatcher) = setup();
        dispatcher.handle(TransportEvent::Open);
        let topic = Topic::new(&conn, "/path", "nav_msgs/Path");

        topic.subscribe(|_| {}).unwrap();
        topic.subscribe(|_| {}).unwrap();

        let sent = transport.take_envelopes();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0],
            json!({
                "op": "Subscriber.subscribe",
                "id": "subscribe:/path:1",
                "v": "1.0",
                "params": {
                    "type": "nav_msgs/Path",
                    "topic": "/path",
                    "compression": "none",
                    "throttle_rate": 0,
                    "queue_length": 0
                }
            })
        );
        assert_eq!(topic.handler_count(), 2);
        assert_eq!(topic.subscribe_id().as_deref(), Some("subscribe:/path:1"));
    }

    #[test]
    fn test_messages_reach_every_handler() {
        let (conn, _t, dispatcher) = setup();
        dispatcher.handle(TransportEvent::Open);
        let topic = Topic::new(&conn, "/pose", "geometry_msgs/Pose");
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b"] {
            let s = seen.clone();
            topic
                .subscribe(move |m: &Message| s.lock().unwrap().push(format!("{}{}", tag, m["x"])))
                .unwrap();
        }

        dispatcher.handle(publish_frame("/pose", json!({"x": 1})));
        dispatcher.handle(publish_frame("/other", json!({"x": 2})));
        assert_eq!(*seen.lock().unwrap(), vec!["a1", "b1"]);
    }

    #[test]
    fn test_partial_unsubscribe_keeps_subscription() {
        let (conn, transport, dispatcher) = setup();
        dispatcher.handle(TransportEvent::Open);
        let topic = Topic::new(&conn, "/pose", "geometry_msgs/Pose");
        let seen = Arc::new(Mutex::new(0));

        let a = topic.subscribe(|_| {}).unwrap();
        let s = seen.clone();
        topic.subscribe(move |_| *s.lock().unwrap() += 1).unwrap();
        transport.take_frames();

        topic.unsubscribe(Some(a)).unwrap();
        assert!(transport.frames().is_empty());
        assert!(topic.is_subscribed());

        dispatcher.handle(publish_frame("/pose", json!({})));
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn test_full_unsubscribe() {
        let (conn, transport, dispatcher) = setup();
        dispatcher.handle(TransportEvent::Open);
        let topic = Topic::new(&conn, "/pose", "geometry_msgs/Pose");
        let events = Arc::new(Mutex::new(0));
        let e = events.clone();
        topic.on(TopicEventKind::Unsubscribe, move |_| *e.lock().unwrap() += 1);

        let handler = topic.subscribe(|_| {}).unwrap();
        transport.take_frames();
        topic.unsubscribe(Some(handler)).unwrap();

        assert_eq!(
            transport.take_envelopes(),
            vec![json!({
                "op": "Subscriber.unsubscribe",
                "id": "subscribe:/pose:1",
                "v": "1.0",
                "params": {"topic": "/pose"}
            })]
        );
        assert!(!topic.is_subscribed());
        assert_eq!(*events.lock().unwrap(), 1);
        assert_eq!(conn.bus().listener_count(&Channel::Topic("/pose".into())), 0);
        assert_eq!(conn.bus().listener_count(&Channel::Closed), 0);

        // Second unsubscribe is silent
        topic.unsubscribe(None).unwrap();
        assert!(transport.frames().is_empty());
    }

    #[test]
    fn test_advertise_is_idempotent() {
        let (conn, transport, dispatcher) = setup();
        dispatcher.handle(TransportEvent::Open);
        let topic = Topic::new(&conn, "/cmd_vel", "geometry_msgs/Twist");

        topic.advertise().unwrap();
        topic.advertise().unwrap();
        assert_eq!(ops(&transport), vec!["Publisher.advertise"]);
        assert!(topic.is_advertised());
    }

    #[test]
    fn test_unadvertise_uses_advertise_id() {
        let (conn, transport, dispatcher) = setup();
        dispatcher.handle(TransportEvent::Open);
        let topic = Topic::new(&conn, "/cmd_vel", "geometry_msgs/Twist");
        topic.unadvertise().unwrap();
        assert!(transport.frames().is_empty());

        topic.advertise().unwrap();
        topic.unadvertise().unwrap();
        let sent = transport.take_envelopes();
        assert_eq!(
            sent[1],
            json!({
                "op": "Publisher.unadvertise",
                "id": "advertise:/cmd_vel:1",
                "params": {"topic": "/cmd_vel"}
            })
        );
        assert!(!topic.is_advertised());
    }

    #[test]
    fn test_publish_advertises_first() {
        let (conn, transport, dispatcher) = setup();
        dispatcher.handle(TransportEvent::Open);
        let topic = Topic::builder(&conn, "/chatter")
            .message_type("std_msgs/String")
            .latch(true)
            .build();

        topic.publish(&json!({"data": "hi"})).unwrap();
        topic.publish(&json!({"data": "again"})).unwrap();

        let sent = transport.take_envelopes();
        let ops: Vec<_> = sent.iter().map(|e| e["op"].as_str().unwrap()).collect();
        assert_eq!(ops, vec!["Publisher.advertise", "Publish", "Publish"]);
        assert_eq!(sent[2]["id"], "publish:/chatter:3");
        assert_eq!(sent[2]["params"]["latch"], true);
        assert_eq!(sent[2]["params"]["message"]["data"], "again");
    }

    #[test]
    fn test_reconnect_resends_once_per_cycle() {
        let (conn, transport, dispatcher) = setup();
        dispatcher.handle(TransportEvent::Open);
        let topic = Topic::new(&conn, "/path", "nav_msgs/Path");
        topic.subscribe(|_| {}).unwrap();
        transport.take_frames();

        cycle(&dispatcher);
        assert_eq!(ops(&transport), vec!["Subscriber.subscribe"]);
        assert_eq!(topic.reconnect_state(), ReconnectState::Idle);

        cycle(&dispatcher);
        assert_eq!(ops(&transport), vec!["Subscriber.subscribe"]);
    }

    #[test]
    fn test_repeated_close_while_pending() {
        let (conn, transport, dispatcher) = setup();
        dispatcher.handle(TransportEvent::Open);
        let topic = Topic::new(&conn, "/path", "nav_msgs/Path");
        topic.subscribe(|_| {}).unwrap();
        topic.advertise().unwrap();
        transport.take_frames();

        let close = TransportEvent::Close(CloseInfo::abnormal("drop"));
        dispatcher.handle(close.clone());
        assert_eq!(topic.reconnect_state(), ReconnectState::PendingResubscribe);

        // A reconnect attempt that fails before opening closes again
        let dispatcher = conn.attach(Arc::new(transport.clone()));
        dispatcher.handle(close);
        dispatcher.handle(TransportEvent::Open);

        assert_eq!(
            ops(&transport),
            vec!["Subscriber.subscribe", "Publisher.advertise"]
        );
        assert_eq!(topic.reconnect_state(), ReconnectState::Idle);
    }

    #[test]
    fn test_close_before_first_open_sends_registrations_once() {
        let (conn, transport, dispatcher) = setup();
        let topic = Topic::new(&conn, "/cmd_vel", "geometry_msgs/Twist");
        topic.publish(&json!({"linear": {"x": 0.1}})).unwrap();
        assert_eq!(conn.queued_frames(), 2);

        conn.close();
        dispatcher.handle(TransportEvent::Open);
        dispatcher.handle(TransportEvent::Close(CloseInfo::normal()));
        assert!(transport.frames().is_empty());
        assert_eq!(conn.queued_frames(), 2);

        let next = MemoryTransport::new();
        conn.attach(Arc::new(next.clone())).handle(TransportEvent::Open);
        assert_eq!(ops(&next), vec!["Publisher.advertise", "Publish"]);
        assert_eq!(topic.reconnect_state(), ReconnectState::Idle);
    }

    #[test]
    fn test_no_reconnect_readvertises_on_next_publish() {
        let (conn, transport, dispatcher) = setup();
        dispatcher.handle(TransportEvent::Open);
        let topic = Topic::builder(&conn, "/cmd_vel")
            .message_type("geometry_msgs/Twist")
            .reconnect_on_close(false)
            .build();

        topic.publish(&json!({})).unwrap();
        cycle(&dispatcher);
        assert!(!topic.is_advertised());
        assert_eq!(ops(&transport), vec!["Publisher.advertise", "Publish"]);

        topic.publish(&json!({})).unwrap();
        assert_eq!(ops(&transport), vec!["Publisher.advertise", "Publish"]);
    }

    #[test]
    fn test_drop_detaches_bus_listeners() {
        let (conn, _t, dispatcher) = setup();
        dispatcher.handle(TransportEvent::Open);
        let topic = Topic::new(&conn, "/path", "nav_msgs/Path");
        topic.subscribe(|_| {}).unwrap();
        assert_eq!(conn.bus().listener_count(&Channel::Closed), 1);

        drop(topic);
        assert_eq!(conn.bus().listener_count(&Channel::Closed), 0);
        assert_eq!(conn.bus().listener_count(&Channel::Topic("/path".into())), 0);
    }
}
