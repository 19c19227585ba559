//! Service channel: correlated request/response calls.
//!
//! Every call gets a correlation id `call_service:<name>:<n>`. A resolver for
//! that id is armed in the connection's [`CallTable`] *before* the request is
//! sent, so a response can never arrive ahead of its listener.
//!
//! # Classification
//!
//! A response is a failure iff its `result` field is present and is exactly
//! `false`. Every other value (objects, arrays, `0`, `""`, missing) is a
//! success and is delivered verbatim.
//!
//! # Example
//!
//! ```ignore
//! let service = Service::new(&conn, "add_three_ints").with_timeout(Duration::from_secs(2));
//!
//! // Callback style
//! service.call_service(
//!     &json!({"a": 1, "b": 2, "c": 3}),
//!     |response| println!("sum = {}", response["sum"]),
//!     |failure| eprintln!("{}", failure),
//! )?;
//!
//! // Async style
//! let response = service.call(&json!({"a": 1, "b": 2, "c": 3})).await?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::connection::Connection;
use crate::envelope::{correlation_id, Envelope, ServiceResponse};
use crate::error::{BridgeError, Result};

/// Why a service call did not succeed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ServiceFailure {
    /// The server answered with `result: false`. Carries the raw result.
    #[error("service rejected the call: {0}")]
    Rejected(Value),

    /// No response arrived in time.
    #[error("no response within {0:?}")]
    TimedOut(Duration),
}

/// Final outcome of one call.
pub type Outcome = std::result::Result<ServiceResponse, ServiceFailure>;

type Resolver = Box<dyn FnOnce(Outcome) + Send>;

/// Classify a `service_response` frame.
pub fn classify(response: &Value) -> Outcome {
    match response.get("result") {
        Some(Value::Bool(false)) => Err(ServiceFailure::Rejected(Value::Bool(false))),
        Some(result) => Ok(ServiceResponse::from(result.clone())),
        None => Ok(ServiceResponse::from(Value::Null)),
    }
}

struct Pending {
    resolver: Resolver,
    timer: Option<AbortHandle>,
}

impl Pending {
    /// Stop the expiry timer and hand back the resolver.
    fn settle(self) -> Resolver {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        self.resolver
    }
}

/// Pending calls keyed by correlation id.
///
/// Each record is removed exactly once, by its response, its timeout or a
/// cancel. Removal by response or cancel stops the record's expiry timer.
/// Resolvers run outside the table lock.
#[derive(Default)]
pub struct CallTable {
    pending: Mutex<HashMap<String, Pending>>,
}

impl fmt::Debug for CallTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallTable")
            .field("pending", &self.len())
            .finish()
    }
}

impl CallTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Pending>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Arm a resolver for `id`. A resolver already armed for `id` is replaced.
    pub fn arm<F>(&self, id: impl Into<String>, resolver: F)
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        let id = id.into();
        let pending = Pending {
            resolver: Box::new(resolver),
            timer: None,
        };
        let replaced = self.lock().insert(id.clone(), pending);
        if let Some(replaced) = replaced {
            tracing::warn!(%id, "replaced pending call with the same id");
            drop(replaced.settle());
        }
    }

    /// Attach the expiry timer for `id`. Aborted at once if the call already settled.
    pub(crate) fn set_timer(&self, id: &str, timer: AbortHandle) {
        match self.lock().get_mut(id) {
            Some(pending) => pending.timer = Some(timer),
            None => timer.abort(),
        }
    }

    /// Deliver a response frame to the call armed for `id`.
    ///
    /// Returns the frame back when no call is armed for it.
    pub fn resolve(&self, id: &str, response: Value) -> Option<Value> {
        let pending = self.lock().remove(id);
        match pending {
            Some(pending) => {
                tracing::trace!(%id, "service response");
                (pending.settle())(classify(&response));
                None
            }
            None => Some(response),
        }
    }

    /// Fail the call armed for `id` with [`ServiceFailure::TimedOut`].
    pub fn expire(&self, id: &str, after: Duration) -> bool {
        let pending = self.lock().remove(id);
        match pending {
            Some(pending) => {
                tracing::debug!(%id, ?after, "service call timed out");
                (pending.resolver)(Err(ServiceFailure::TimedOut(after)));
                true
            }
            None => false,
        }
    }

    /// Drop the call armed for `id` without delivering anything.
    pub fn cancel(&self, id: &str) -> bool {
        let pending = self.lock().remove(id);
        match pending {
            Some(pending) => {
                tracing::debug!(%id, "service call cancelled");
                drop(pending.settle());
                true
            }
            None => false,
        }
    }

    /// Whether a call is armed for `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Number of armed calls.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no call is armed.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Handle to one armed call.
#[derive(Debug, Clone)]
pub struct CallHandle {
    id: String,
    calls: Weak<CallTable>,
}

impl CallHandle {
    /// The call's correlation id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the call still waits for a response.
    pub fn is_pending(&self) -> bool {
        self.calls
            .upgrade()
            .map(|calls| calls.contains(&self.id))
            .unwrap_or(false)
    }

    /// Retract the call. Its callbacks will never run.
    ///
    /// Returns `false` if it already completed. The request frame, once
    /// queued or sent, is not retracted.
    pub fn cancel(&self) -> bool {
        self.calls
            .upgrade()
            .map(|calls| calls.cancel(&self.id))
            .unwrap_or(false)
    }
}

/// Cancels an async call if its future is dropped early.
struct CancelOnDrop(CallHandle);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// A named remote service.
#[derive(Debug, Clone)]
pub struct Service {
    conn: Connection,
    name: String,
    service_type: Option<String>,
    timeout: Option<Duration>,
}

impl Service {
    /// A service on `conn`. Uses the connection's default call timeout.
    pub fn new(conn: &Connection, name: &str) -> Self {
        Self {
            conn: conn.clone(),
            name: name.to_string(),
            service_type: None,
            timeout: conn.call_timeout(),
        }
    }

    /// Record the service type, like `rospy_tutorials/AddTwoInts`.
    pub fn with_service_type(mut self, service_type: &str) -> Self {
        self.service_type = Some(service_type.to_string());
        self
    }

    /// Fail calls that get no response within `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Service type, if set.
    pub fn service_type(&self) -> Option<&str> {
        self.service_type.as_deref()
    }

    /// Call timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Call the service. Exactly one of the callbacks runs, at most once.
    ///
    /// With no timeout configured, a call that never gets a response stays
    /// armed until cancelled through the returned handle.
    pub fn call_service<R, S, F>(&self, request: &R, on_success: S, on_failure: F) -> Result<CallHandle>
    where
        R: Serialize + ?Sized,
        S: FnOnce(ServiceResponse) + Send + 'static,
        F: FnOnce(ServiceFailure) + Send + 'static,
    {
        self.dispatch(
            request,
            Some(Box::new(move |outcome: Outcome| match outcome {
                Ok(response) => on_success(response),
                Err(failure) => on_failure(failure),
            })),
            self.timeout,
        )
    }

    /// Call the service with a success callback only. Failures are logged.
    pub fn call_service_then<R, S>(&self, request: &R, on_success: S) -> Result<CallHandle>
    where
        R: Serialize + ?Sized,
        S: FnOnce(ServiceResponse) + Send + 'static,
    {
        let name = self.name.clone();
        self.call_service(request, on_success, move |failure| {
            tracing::debug!(service = %name, %failure, "service call failed without failure handler");
        })
    }

    /// Call the service with a failure callback only. Successes are logged.
    pub fn call_service_or_else<R, F>(&self, request: &R, on_failure: F) -> Result<CallHandle>
    where
        R: Serialize + ?Sized,
        F: FnOnce(ServiceFailure) + Send + 'static,
    {
        let name = self.name.clone();
        self.call_service(
            request,
            move |_| tracing::trace!(service = %name, "service call succeeded without success handler"),
            on_failure,
        )
    }

    /// Send a request without waiting for a response.
    ///
    /// Nothing is armed; a response, if any, surfaces on the bus
    /// `Channel::Response(id)`. Returns the correlation id.
    pub fn notify<R: Serialize + ?Sized>(&self, request: &R) -> Result<String> {
        let handle = self.dispatch(request, None, None)?;
        Ok(handle.id)
    }

    /// Call the service and wait for its response.
    ///
    /// Dropping the future cancels the call.
    pub async fn call<R: Serialize + ?Sized>(&self, request: &R) -> Result<ServiceResponse> {
        let (tx, rx) = oneshot::channel();
        let handle = self.dispatch(
            request,
            Some(Box::new(move |outcome: Outcome| {
                // The receiver may already be gone if the caller gave up
                let _ = tx.send(outcome);
            })),
            None,
        )?;
        let id = handle.id.clone();
        let _guard = CancelOnDrop(handle);

        let received = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(received) => received,
                Err(_) => {
                    tracing::debug!(%id, ?timeout, "service call timed out");
                    return Err(BridgeError::Timeout(id));
                }
            },
            None => rx.await,
        };

        match received {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(ServiceFailure::Rejected(result))) => Err(BridgeError::ServiceFailed(result)),
            Ok(Err(ServiceFailure::TimedOut(_))) => Err(BridgeError::Timeout(id)),
            Err(_) => Err(BridgeError::Cancelled(id)),
        }
    }

    fn dispatch<R: Serialize + ?Sized>(
        &self,
        request: &R,
        resolver: Option<Resolver>,
        timeout: Option<Duration>,
    ) -> Result<CallHandle> {
        let request = serde_json::to_value(request)?;
        let id = correlation_id("call_service", &self.name, self.conn.next_id());
        let calls = self.conn.calls();
        let handle = CallHandle {
            id: id.clone(),
            calls: Arc::downgrade(calls),
        };

        let armed = resolver.is_some();
        if let Some(resolver) = resolver {
            calls.arm(id.clone(), resolver);
        }

        let envelope = Envelope::call_service(&self.name, id.clone(), self.conn.version(), request);
        if let Err(e) = self.conn.send(&envelope) {
            calls.cancel(&id);
            return Err(e);
        }
        tracing::trace!(service = %self.name, %id, armed, "service call sent");

        if let (true, Some(timeout)) = (armed, timeout) {
            self.schedule_expiry(&handle, timeout);
        }
        Ok(handle)
    }

    fn schedule_expiry(&self, handle: &CallHandle, timeout: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(id = %handle.id, "no tokio runtime; call timeout not enforced");
            return;
        };
        let id = handle.id.clone();
        let calls = handle.calls.clone();
        let timer = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(calls) = calls.upgrade() {
                calls.expire(&id, timeout);
            }
        });
        self.conn.calls().set_timer(&handle.id, timer.abort_handle());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{Frame, TransportEvent};
    use crate::transport::MemoryTransport;
    use serde_json::json;

    fn connected() -> (Connection, MemoryTransport, crate::dispatcher::Dispatcher) {
        let conn = Connection::new();
        let transport = MemoryTransport::new();
        let dispatcher = conn.attach(Arc::new(transport.clone()));
        dispatcher.handle(TransportEvent::Open);
        (conn, transport, dispatcher)
    }

    fn respond(dispatcher: &crate::dispatcher::Dispatcher, frame: Value) {
        dispatcher.handle(TransportEvent::Message(Frame::Text(frame.to_string())));
    }

    type Log = Arc<Mutex<Vec<String>>>;

    fn log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn test_classify() {
        assert!(classify(&json!({"result": false})).is_err());
        assert_eq!(
            classify(&json!({"result": 0})).unwrap().into_inner(),
            json!(0)
        );
        assert_eq!(
            classify(&json!({"result": ""})).unwrap().into_inner(),
            json!("")
        );
        assert_eq!(
            classify(&json!({"result": []})).unwrap().into_inner(),
            json!([])
        );
        assert_eq!(classify(&json!({"id": "x"})).unwrap().into_inner(), Value::Null);
        assert!(classify(&json!({"result": true})).is_ok());
    }

    #[test]
    fn test_call_envelope_shape() {
        let (conn, transport, _d) = connected();
        let service = Service::new(&conn, "add_three_ints");

        let handle = service.call_service_then(&json!({"a": 1}), |_| {}).unwrap();
        assert_eq!(handle.id(), "call_service:add_three_ints:1");

        let sent = transport.envelopes();
        assert_eq!(
            sent[0],
            json!({
                "op": "add_three_ints",
                "id": "call_service:add_three_ints:1",
                "v": "1.0",
                "params": {"a": 1}
            })
        );
    }

    #[test]
    fn test_success_delivers_result_once() {
        let (conn, _t, dispatcher) = connected();
        let service = Service::new(&conn, "add_three_ints");
        let seen = log();

        let s = seen.clone();
        let f = seen.clone();
        let handle = service
            .call_service(
                &json!({"a": 5, "b": 7, "c": 10}),
                move |r| s.lock().unwrap().push(format!("ok {}", r["sum"])),
                move |e| f.lock().unwrap().push(format!("err {}", e)),
            )
            .unwrap();

        let frame = json!({"op": "service_response", "id": handle.id(), "result": {"sum": 22}});
        respond(&dispatcher, frame.clone());
        respond(&dispatcher, frame);

        assert_eq!(*seen.lock().unwrap(), vec!["ok 22"]);
        assert!(!handle.is_pending());
        assert_eq!(conn.pending_calls(), 0);
    }

    #[test]
    fn test_result_false_runs_only_failure() {
        let (conn, _t, dispatcher) = connected();
        let service = Service::new(&conn, "reset");
        let seen = log();

        let s = seen.clone();
        let f = seen.clone();
        let handle = service
            .call_service(
                &json!({}),
                move |_| s.lock().unwrap().push("ok".into()),
                move |e| f.lock().unwrap().push(format!("{:?}", e)),
            )
            .unwrap();

        respond(
            &dispatcher,
            json!({"op": "service_response", "id": handle.id(), "result": false}),
        );
        assert_eq!(*seen.lock().unwrap(), vec!["Rejected(Bool(false))"]);
    }

    #[test]
    fn test_failure_only_call() {
        let (conn, _t, dispatcher) = connected();
        let service = Service::new(&conn, "reset");
        let seen = log();

        let f = seen.clone();
        let rejected = service
            .call_service_or_else(&json!({}), move |e| f.lock().unwrap().push(e.to_string()))
            .unwrap();
        let f = seen.clone();
        let accepted = service
            .call_service_or_else(&json!({}), move |e| f.lock().unwrap().push(e.to_string()))
            .unwrap();

        respond(
            &dispatcher,
            json!({"op": "service_response", "id": rejected.id(), "result": false}),
        );
        respond(
            &dispatcher,
            json!({"op": "service_response", "id": accepted.id(), "result": {"ok": 1}}),
        );

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["service rejected the call: false"]
        );
        assert_eq!(conn.pending_calls(), 0);
    }

    #[test]
    fn test_armed_before_send_while_disconnected() {
        let conn = Connection::new();
        let transport = MemoryTransport::new();
        let dispatcher = conn.attach(Arc::new(transport.clone()));
        let service = Service::new(&conn, "get_map");

        let handle = service.call_service_then(&json!({}), |_| {}).unwrap();
        assert!(handle.is_pending());
        assert!(transport.frames().is_empty());

        dispatcher.handle(TransportEvent::Open);
        assert_eq!(transport.frames().len(), 1);
    }

    #[test]
    fn test_cancel_suppresses_callbacks() {
        let (conn, _t, dispatcher) = connected();
        let service = Service::new(&conn, "slow");
        let seen = log();

        let s = seen.clone();
        let handle = service
            .call_service_then(&json!({}), move |_| s.lock().unwrap().push("ok".into()))
            .unwrap();
        assert!(handle.cancel());
        assert!(!handle.cancel());

        let unclaimed = log();
        let u = unclaimed.clone();
        conn.bus().on(
            crate::bus::Channel::Response(handle.id().to_string()),
            move |_| u.lock().unwrap().push("bus".into()),
        );
        respond(
            &dispatcher,
            json!({"op": "service_response", "id": handle.id(), "result": {}}),
        );

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(*unclaimed.lock().unwrap(), vec!["bus"]);
    }

    #[test]
    fn test_notify_arms_nothing() {
        let (conn, transport, _d) = connected();
        let id = Service::new(&conn, "beep").notify(&json!(null)).unwrap();

        assert_eq!(id, "call_service:beep:1");
        assert_eq!(conn.pending_calls(), 0);
        assert_eq!(transport.frames().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_and_frees_record() {
        let (conn, _t, _d) = connected();
        let service = Service::new(&conn, "never").with_timeout(Duration::from_millis(500));
        let seen = log();

        let f = seen.clone();
        service
            .call_service(&json!({}), |_| {}, move |e| f.lock().unwrap().push(e.to_string()))
            .unwrap();
        assert_eq!(conn.pending_calls(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(conn.pending_calls(), 0);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(seen.lock().unwrap()[0].starts_with("no response within"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_stops_expiry_timer() {
        let (conn, _t, dispatcher) = connected();
        let service = Service::new(&conn, "add_three_ints").with_timeout(Duration::from_secs(60));
        let timed_out = log();

        let f = timed_out.clone();
        let handle = service
            .call_service(&json!({}), |_| {}, move |e| f.lock().unwrap().push(e.to_string()))
            .unwrap();
        let id = handle.id().to_string();
        drop(handle);
        // The expiry task holds the only other weak reference to the table
        let armed = Arc::weak_count(conn.calls());
        assert!(armed >= 1);

        respond(
            &dispatcher,
            json!({"op": "service_response", "id": id, "result": {"sum": 0}}),
        );
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(Arc::weak_count(conn.calls()), armed - 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(timed_out.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_expiry_timer() {
        let (conn, _t, _d) = connected();
        let service = Service::new(&conn, "slow").with_timeout(Duration::from_secs(60));
        let handle = service.call_service_then(&json!({}), |_| {}).unwrap();
        let armed = Arc::weak_count(conn.calls());

        assert!(handle.cancel());
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        // The handle keeps its own weak reference
        assert_eq!(Arc::weak_count(conn.calls()), armed - 1);
    }

    #[tokio::test]
    async fn test_async_call_resolves() {
        let (conn, _t, dispatcher) = connected();
        let service = Service::new(&conn, "add_three_ints");

        let responder = tokio::spawn(async move {
            tokio::task::yield_now().await;
            respond(
                &dispatcher,
                json!({"op": "service_response", "id": "call_service:add_three_ints:1", "result": {"sum": 6}}),
            );
        });

        let response = service.call(&json!({"a": 1, "b": 2, "c": 3})).await.unwrap();
        responder.await.unwrap();
        assert_eq!(response["sum"], 6);
    }

    #[tokio::test]
    async fn test_async_call_rejected() {
        let (conn, _t, dispatcher) = connected();
        let service = Service::new(&conn, "reset");

        tokio::spawn(async move {
            tokio::task::yield_now().await;
            respond(
                &dispatcher,
                json!({"op": "service_response", "id": "call_service:reset:1", "result": false}),
            );
        });

        let result = service.call(&json!({})).await;
        assert!(matches!(result, Err(BridgeError::ServiceFailed(Value::Bool(false)))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_call_timeout_cleans_up() {
        let conn = Connection::builder()
            .call_timeout(Duration::from_millis(100))
            .build()
            .unwrap();
        let service = Service::new(&conn, "never");
        assert_eq!(service.timeout(), Some(Duration::from_millis(100)));

        let result = service.call(&json!({})).await;
        assert!(matches!(result, Err(BridgeError::Timeout(id)) if id == "call_service:never:1"));
        assert_eq!(conn.pending_calls(), 0);
    }

    #[test]
    fn test_service_metadata() {
        let conn = Connection::new();
        let service = Service::new(&conn, "add_two_ints").with_service_type("rospy_tutorials/AddTwoInts");
        assert_eq!(service.name(), "add_two_ints");
        assert_eq!(service.service_type(), Some("rospy_tutorials/AddTwoInts"));
        assert_eq!(service.timeout(), None);
    }
}
