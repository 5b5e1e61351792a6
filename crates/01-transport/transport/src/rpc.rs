use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::thread;

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use futures::channel::oneshot;
use parking_lot::{Mutex, RwLock};

use crate::availability::{Availability, FaultWatcher};
use crate::context::ContextHandle;
use crate::error::{Fault, RpcError, RpcResult};
use crate::frame::{CallId, Frame, Port, Protocol};

type Resolver<M> = Box<dyn FnOnce(RpcResult<M>) + Send>;
type Handler<P> = Arc<dyn Fn(<P as Protocol>::Message, Reply<P>) + Send + Sync>;

/// Where request handlers execute.
#[derive(Clone)]
pub enum Dispatch {
    /// On the endpoint's receive thread, in arrival order.
    Inline,
    /// Queued onto a context loop, serialized with everything else that context runs.
    Context(ContextHandle),
}

/// Request/response messaging over one [`Port`].
///
/// Each `Rpc` owns a receive thread that routes incoming requests to the
/// handler registered for their event and resolves pending calls from
/// incoming responses. Calls are correlated by id, so responses may arrive in
/// any order. Cloning shares the same endpoint.
pub struct Rpc<P: Protocol> {
    inner: Arc<RpcInner<P>>,
}

impl<P: Protocol> Clone for Rpc<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct RpcInner<P: Protocol> {
    label: String,
    outbound: Sender<Frame<P>>,
    pending: Mutex<HashMap<CallId, Resolver<P::Message>>>,
    handlers: RwLock<HashMap<P::Event, Handler<P>>>,
    next_id: AtomicU64,
    dispatch: Dispatch,
    availability: Option<Availability>,
    shutdown: Mutex<Option<Sender<()>>>,
    connected: AtomicBool,
}

impl<P: Protocol> Rpc<P> {
    /// Wraps `port` and starts its receive thread.
    pub fn new(label: impl Into<String>, port: Port<P>, dispatch: Dispatch) -> Self {
        Self::build(label.into(), port, dispatch, None)
    }

    /// Like [`Rpc::new`], but calls fail fast while `availability` is faulted and
    /// fatal faults received on this endpoint trip it.
    pub fn with_availability(
        label: impl Into<String>,
        port: Port<P>,
        dispatch: Dispatch,
        availability: Availability,
    ) -> Self {
        Self::build(label.into(), port, dispatch, Some(availability))
    }

    fn build(
        label: String,
        port: Port<P>,
        dispatch: Dispatch,
        availability: Option<Availability>,
    ) -> Self {
        let (outbound, inbound) = port.split();
        let (shutdown_tx, shutdown_rx) = unbounded();
        let inner = Arc::new(RpcInner {
            label,
            outbound,
            pending: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            dispatch,
            availability,
            shutdown: Mutex::new(Some(shutdown_tx)),
            connected: AtomicBool::new(true),
        });

        if let Some(availability) = &inner.availability {
            let watcher: Weak<dyn FaultWatcher> = Arc::downgrade(&inner) as Weak<dyn FaultWatcher>;
            availability.watch(watcher);
        }

        let weak = Arc::downgrade(&inner);
        let name = format!("{}-rx:{}", P::NAME, inner.label);
        let spawned = thread::Builder::new()
            .name(name)
            .spawn(move || receive_loop(weak, inbound, shutdown_rx));
        if let Err(err) = spawned {
            tracing::error!("failed to start receive thread for {}: {err}", inner.label);
            inner.connected.store(false, Ordering::Release);
            inner.fail_all(RpcError::Disconnected);
        }

        Self { inner }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Issues a call and returns a future resolving with the peer's response.
    pub fn send(&self, event: P::Event, message: P::Message) -> PendingCall<P::Message> {
        let (tx, rx) = oneshot::channel();
        self.send_with(event, message, move |result| {
            let _ = tx.send(result);
        });
        PendingCall { rx }
    }

    /// Issues a call and invokes `on_reply` exactly once with its outcome.
    pub fn send_with<F>(&self, event: P::Event, message: P::Message, on_reply: F)
    where
        F: FnOnce(RpcResult<P::Message>) + Send + 'static,
    {
        if let Some(err) = self.inner.faulted() {
            on_reply(Err(err));
            return;
        }
        if !self.is_connected() {
            on_reply(Err(RpcError::Disconnected));
            return;
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.pending.lock().insert(id, Box::new(on_reply));

        // A fault that landed between the check above and the insert drained
        // the table without seeing this call.
        if let Some(err) = self.inner.faulted() {
            if let Some(resolver) = self.inner.pending.lock().remove(&id) {
                resolver(Err(err));
            }
            return;
        }

        let frame = Frame::Request {
            id: Some(id),
            event,
            message,
        };
        if self.inner.outbound.send(frame).is_err() {
            if let Some(resolver) = self.inner.pending.lock().remove(&id) {
                resolver(Err(RpcError::Disconnected));
            }
        }
    }

    /// Fire-and-forget message; the peer's handler receives a reply token that goes nowhere.
    pub fn notify(&self, event: P::Event, message: P::Message) -> RpcResult<()> {
        self.inner
            .outbound
            .send(Frame::Request {
                id: None,
                event,
                message,
            })
            .map_err(|_| RpcError::Disconnected)
    }

    /// Registers the handler for `event`. A later registration replaces an earlier one.
    pub fn receive<F>(&self, event: P::Event, handler: F)
    where
        F: Fn(P::Message, Reply<P>) + Send + Sync + 'static,
    {
        let previous = self.inner.handlers.write().insert(event, Arc::new(handler));
        if previous.is_some() {
            tracing::debug!("{}: replaced handler for {event:?}", self.inner.label);
        }
    }

    /// False once the peer hung up or the endpoint was closed.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Stops the receive thread, drops all handlers and fails outstanding calls.
    pub fn close(&self) {
        self.inner.connected.store(false, Ordering::Release);
        self.inner.shutdown.lock().take();
        self.inner.handlers.write().clear();
        self.inner.fail_all(RpcError::Disconnected);
    }
}

impl<P: Protocol> RpcInner<P> {
    fn faulted(&self) -> Option<RpcError> {
        let availability = self.availability.as_ref()?;
        if !availability.is_faulted() {
            return None;
        }
        availability.check().err()
    }

    fn fail_all(&self, err: RpcError) {
        let drained: Vec<Resolver<P::Message>> =
            self.pending.lock().drain().map(|(_, resolver)| resolver).collect();
        if !drained.is_empty() {
            tracing::debug!("{}: failing {} pending calls: {err}", self.label, drained.len());
        }
        for resolver in drained {
            resolver(Err(err.clone()));
        }
    }

    fn handle_frame(&self, frame: Frame<P>) {
        match frame {
            Frame::Request { id, event, message } => self.handle_request(id, event, message),
            Frame::Response { id, result } => self.handle_response(id, result),
        }
    }

    fn handle_request(&self, id: Option<CallId>, event: P::Event, message: P::Message) {
        let handler = self.handlers.read().get(&event).cloned();
        let Some(handler) = handler else {
            tracing::warn!("{}: no handler registered for {event:?}", self.label);
            if let Some(id) = id {
                let fault = Fault::protocol(format!("no handler registered for {event:?}"));
                let _ = self.outbound.send(Frame::Response {
                    id,
                    result: Err(fault),
                });
            }
            return;
        };

        let reply = Reply {
            id,
            event,
            outbound: Some(self.outbound.clone()),
        };
        match &self.dispatch {
            Dispatch::Inline => handler(message, reply),
            Dispatch::Context(context) => {
                if !context.post(move || handler(message, reply)) {
                    tracing::error!(
                        "{}: context {} stopped; dropping {event:?}",
                        self.label,
                        context.name()
                    );
                }
            }
        }
    }

    fn handle_response(&self, id: CallId, result: Result<P::Message, Fault>) {
        let resolver = self.pending.lock().remove(&id);
        let Some(resolver) = resolver else {
            tracing::debug!("{}: discarding response for unknown call {id}", self.label);
            return;
        };

        match result {
            Ok(message) => resolver(Ok(message)),
            Err(fault) => {
                if fault.is_fatal() {
                    if let Some(availability) = &self.availability {
                        availability.mark_unavailable(fault.message.clone());
                    }
                }
                resolver(Err(RpcError::Remote(fault)));
            }
        }
    }
}

impl<P: Protocol> FaultWatcher for RpcInner<P> {
    fn on_unavailable(&self, reason: &str) {
        self.fail_all(RpcError::Unavailable(reason.to_owned()));
    }
}

fn receive_loop<P: Protocol>(
    inner: Weak<RpcInner<P>>,
    inbound: Receiver<Frame<P>>,
    shutdown: Receiver<()>,
) {
    loop {
        select! {
            recv(inbound) -> frame => match frame {
                Ok(frame) => {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.handle_frame(frame);
                }
                Err(_) => {
                    if let Some(inner) = inner.upgrade() {
                        tracing::debug!("{}: peer disconnected", inner.label);
                        inner.connected.store(false, Ordering::Release);
                        inner.fail_all(RpcError::Disconnected);
                    }
                    break;
                }
            },
            recv(shutdown) -> _ => break,
        }
    }
}

/// Response token handed to a request handler.
///
/// Consuming it with [`Reply::ok`], [`Reply::fail`] or [`Reply::respond`] answers
/// the call. Dropping it unanswered answers with a protocol fault, so the caller
/// never waits forever. Tokens for notifications answer nothing.
pub struct Reply<P: Protocol> {
    id: Option<CallId>,
    event: P::Event,
    outbound: Option<Sender<Frame<P>>>,
}

impl<P: Protocol> Reply<P> {
    pub fn expects_response(&self) -> bool {
        self.id.is_some()
    }

    pub fn event(&self) -> P::Event {
        self.event
    }

    pub fn ok(self, message: P::Message) {
        self.respond(Ok(message));
    }

    pub fn fail(self, fault: Fault) {
        self.respond(Err(fault));
    }

    pub fn respond(mut self, result: Result<P::Message, Fault>) {
        self.finish(result);
    }

    fn finish(&mut self, result: Result<P::Message, Fault>) {
        let Some(outbound) = self.outbound.take() else {
            return;
        };
        let Some(id) = self.id else {
            if let Err(fault) = result {
                tracing::warn!("{:?} notification failed: {fault}", self.event);
            }
            return;
        };
        if outbound.send(Frame::Response { id, result }).is_err() {
            tracing::debug!("{:?} response for call {id} had no receiver", self.event);
        }
    }
}

impl<P: Protocol> Drop for Reply<P> {
    fn drop(&mut self) {
        if self.outbound.is_some() && self.id.is_some() {
            let fault = Fault::protocol(format!("{:?} handler dropped its reply", self.event));
            self.finish(Err(fault));
        }
    }
}

/// Future returned by [`Rpc::send`].
#[must_use = "a pending call does nothing unless awaited"]
pub struct PendingCall<T> {
    rx: oneshot::Receiver<RpcResult<T>>,
}

impl<T> Future for PendingCall<T> {
    type Output = RpcResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_canceled)) => Poll::Ready(Err(RpcError::Disconnected)),
            Poll::Pending => Poll::Pending,
        }
    }
}
