//! Remote call protocol: request/response/progress correlation over the bus.
//!
//! # Message flow
//!
//! 1. Client calls [`RpcChannel::call`] with a name and JSON args
//! 2. A per-call unique id is assigned and a pending entry created
//! 3. The tuple `["call", id, name, args]` is emitted over the bus
//! 4. The responder side looks up its handler and answers with
//!    `["progress", id, value]*` then `["reply", id, value]` or
//!    `["error", id, payload]`
//! 5. The pending entry is resolved by id; progress events are replayed to
//!    the call handle strictly before its terminal result
//!
//! Correlation is by the unique call id, never by name, so concurrent calls
//! to the same name cannot cross-deliver responses.

use crate::error::{Error, Result};
use crate::transport::MessageBus;
use dashmap::DashMap;
use nocturne_protocol::{
    ErrorPayload, EVENT_CALL, EVENT_ERROR, EVENT_PROGRESS, EVENT_REPLY,
};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

/// Handler invoked when a call arrives for a registered name.
///
/// Receives the call arguments and a [`Responder`]; long-running handlers
/// should move the responder into a spawned task and complete it there.
pub type Handler = Arc<dyn Fn(Vec<Value>, Responder) + Send + Sync>;

/// Completion object handed to responder handlers.
///
/// `resolve`/`reject` are one-shot: the first terminal wins and later calls
/// are ignored. Progress may be emitted any number of times before the
/// terminal, never after.
#[derive(Clone)]
pub struct Responder {
    id: u64,
    bus: Arc<MessageBus>,
    completed: Arc<AtomicBool>,
}

impl Responder {
    fn new(id: u64, bus: Arc<MessageBus>) -> Self {
        Self {
            id,
            bus,
            completed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Emits an intermediate progress value. Returns false once completed.
    pub fn progress(&self, value: Value) -> bool {
        if self.completed.load(Ordering::SeqCst) {
            return false;
        }
        self.bus
            .emit(EVENT_PROGRESS, vec![Value::from(self.id), value]);
        true
    }

    /// Resolves the call. Returns false if already completed.
    pub fn resolve(&self, value: Value) -> bool {
        if self.completed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.bus.emit(EVENT_REPLY, vec![Value::from(self.id), value]);
        true
    }

    /// Rejects the call. Returns false if already completed.
    pub fn reject(&self, payload: ErrorPayload) -> bool {
        if self.completed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let payload = serde_json::to_value(&payload).unwrap_or(Value::Null);
        self.bus.emit(EVENT_ERROR, vec![Value::from(self.id), payload]);
        true
    }

    /// Rejects with an [`Error`], preserving its name for rehydration.
    pub fn reject_error(&self, error: &Error) -> bool {
        let payload = match error {
            Error::Remote {
                name,
                message,
                stack,
            } => ErrorPayload {
                message: message.clone(),
                name: Some(name.clone()),
                stack: stack.clone(),
            },
            Error::Timeout { .. } => ErrorPayload::named("TimeoutError", error.to_string()),
            other => ErrorPayload::message(other.to_string()),
        };
        self.reject(payload)
    }
}

/// One progress notification observed by a call handle.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    /// An intermediate value emitted by the responder.
    Data(Value),
    /// The terminal resolved value; fires after every `Data` event.
    End(Value),
}

struct PendingCall {
    reply_tx: oneshot::Sender<Result<Value>>,
    progress_tx: mpsc::UnboundedSender<Progress>,
}

/// Ordered stream of [`Progress`] events for one call.
pub struct ProgressStream {
    rx: mpsc::UnboundedReceiver<Progress>,
}

impl ProgressStream {
    /// Receives the next progress event; `None` after the stream ends.
    ///
    /// A successful call ends with [`Progress::End`]; a failed call closes
    /// the stream without one (listeners are cleaned up before rejection).
    pub async fn recv(&mut self) -> Option<Progress> {
        self.rx.recv().await
    }
}

/// Guard ensuring the pending entry is removed if a call handle is dropped
/// before its terminal event arrives.
struct CallGuard {
    id: u64,
    channel: Weak<RpcChannel>,
    completed: bool,
}

impl CallGuard {
    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if let Some(channel) = self.channel.upgrade() {
            if channel.pending.remove(&self.id).is_some() {
                tracing::debug!(id = self.id, "removed orphaned pending call");
            }
        }
    }
}

/// In-flight remote invocation.
///
/// Awaiting the handle yields the terminal result. [`take_progress`] detaches
/// the ordered progress stream; data events are buffered, so progress that
/// arrived before the first `recv` is replayed in order.
///
/// [`take_progress`]: CallHandle::take_progress
pub struct CallHandle {
    rx: oneshot::Receiver<Result<Value>>,
    progress: Option<ProgressStream>,
    guard: CallGuard,
}

impl CallHandle {
    /// Creates a handle that has already failed with `error`.
    ///
    /// Used wherever a call cannot even be issued (dead connection, no
    /// session yet) so callers still get the ordinary rejection path
    /// instead of a hang.
    pub fn failed(error: Error) -> Self {
        let (reply_tx, rx) = oneshot::channel();
        let (_progress_tx, progress_rx) = mpsc::unbounded_channel();
        let _ = reply_tx.send(Err(error));
        Self {
            rx,
            progress: Some(ProgressStream { rx: progress_rx }),
            guard: CallGuard {
                id: 0,
                channel: Weak::new(),
                completed: true,
            },
        }
    }

    /// Detaches the progress stream. Subsequent calls return `None`.
    pub fn take_progress(&mut self) -> Option<ProgressStream> {
        self.progress.take()
    }

    /// Awaits the result, racing the given timeout.
    ///
    /// On timeout the call stops being awaited and rejects with the elapsed
    /// bound and operation name; any host-side effect already in flight
    /// continues independently.
    pub async fn wait_timeout(self, operation: &str, timeout_ms: u64) -> Result<Value> {
        match tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), self).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: operation.to_string(),
                timeout_ms,
            }),
        }
    }
}

impl Future for CallHandle {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(result) => {
                self.guard.complete();
                Poll::Ready(result.map_err(|_| Error::ChannelClosed).and_then(|r| r))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Request/response/progress protocol endpoint bound to one bus.
///
/// Both peers of a connection run one of these; a peer-less local bus gets a
/// single channel that answers its own calls, which is the unit-test mode.
pub struct RpcChannel {
    bus: Arc<MessageBus>,
    responders: DashMap<String, Handler>,
    pending: DashMap<u64, PendingCall>,
    next_id: AtomicU64,
}

impl RpcChannel {
    /// Creates a channel and installs its frame listeners on the bus.
    pub fn new(bus: Arc<MessageBus>) -> Arc<Self> {
        let channel = Arc::new(Self {
            bus: Arc::clone(&bus),
            responders: DashMap::new(),
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
        });

        let weak = Arc::downgrade(&channel);
        let on_call = weak.clone();
        bus.on(EVENT_CALL, move |args| {
            if let Some(channel) = on_call.upgrade() {
                channel.handle_call(args);
            }
        });
        let on_reply = weak.clone();
        bus.on(EVENT_REPLY, move |args| {
            if let Some(channel) = on_reply.upgrade() {
                channel.handle_reply(args);
            }
        });
        let on_progress = weak.clone();
        bus.on(EVENT_PROGRESS, move |args| {
            if let Some(channel) = on_progress.upgrade() {
                channel.handle_progress(args);
            }
        });
        let on_error = weak.clone();
        bus.on(EVENT_ERROR, move |args| {
            if let Some(channel) = on_error.upgrade() {
                channel.handle_error(args);
            }
        });
        let on_close = weak;
        bus.on_close(move || {
            if let Some(channel) = on_close.upgrade() {
                channel.fail_pending();
            }
        });

        channel
    }

    /// The bus this channel is bound to.
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Registers `handler` as the authority for calls named `name`.
    ///
    /// Last registration wins; replacing an existing responder logs a
    /// diagnostic.
    pub fn respond_to<F>(&self, name: &str, handler: F)
    where
        F: Fn(Vec<Value>, Responder) + Send + Sync + 'static,
    {
        if self
            .responders
            .insert(name.to_string(), Arc::new(handler))
            .is_some()
        {
            tracing::warn!(name, "replacing responder");
        }
    }

    /// Removes the responder for `name`, if any.
    pub fn remove_responder(&self, name: &str) {
        self.responders.remove(name);
    }

    /// Issues a remote call.
    ///
    /// The returned handle resolves with the matching terminal response and
    /// exposes the ordered progress stream. Calls on a dead connection fail
    /// immediately with [`Error::ChannelClosed`] instead of hanging.
    pub fn call(self: &Arc<Self>, name: &str, args: Vec<Value>) -> CallHandle {
        if self.bus.is_closed() {
            return CallHandle::failed(Error::ChannelClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(id, name, "issuing call");

        let (reply_tx, reply_rx) = oneshot::channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        self.pending.insert(
            id,
            PendingCall {
                reply_tx,
                progress_tx,
            },
        );

        self.bus.emit(
            EVENT_CALL,
            vec![
                Value::from(id),
                Value::String(name.to_string()),
                Value::Array(args),
            ],
        );

        // The connection may have died between the check above and the emit;
        // fail_pending only covers entries present when close fired.
        if self.bus.is_closed() {
            if let Some((_, pending)) = self.pending.remove(&id) {
                drop(pending.progress_tx);
                let _ = pending.reply_tx.send(Err(Error::ChannelClosed));
            }
        }

        CallHandle {
            rx: reply_rx,
            progress: Some(ProgressStream { rx: progress_rx }),
            guard: CallGuard {
                id,
                channel: Arc::downgrade(self),
                completed: false,
            },
        }
    }

    fn handle_call(&self, args: &[Value]) {
        let Some((id, name)) = parse_call_header(args) else {
            tracing::warn!("malformed call frame");
            return;
        };
        let params = match args.get(2) {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => vec![other.clone()],
            None => Vec::new(),
        };

        let responder = Responder::new(id, Arc::clone(&self.bus));
        let handler = self.responders.get(&name).map(|entry| Arc::clone(&entry));
        match handler {
            Some(handler) => handler(params, responder),
            None => {
                tracing::debug!(name, "call with no registered responder");
                responder.reject(ErrorPayload::named("NoResponderError", name));
            }
        }
    }

    fn handle_reply(&self, args: &[Value]) {
        let Some(id) = args.first().and_then(Value::as_u64) else {
            return;
        };
        let value = args.get(1).cloned().unwrap_or(Value::Null);
        if let Some((_, pending)) = self.pending.remove(&id) {
            let _ = pending.progress_tx.send(Progress::End(value.clone()));
            drop(pending.progress_tx);
            let _ = pending.reply_tx.send(Ok(value));
        } else {
            tracing::debug!(id, "reply for unknown call (ignored)");
        }
    }

    fn handle_progress(&self, args: &[Value]) {
        let Some(id) = args.first().and_then(Value::as_u64) else {
            return;
        };
        let value = args.get(1).cloned().unwrap_or(Value::Null);
        if let Some(pending) = self.pending.get(&id) {
            let _ = pending.progress_tx.send(Progress::Data(value));
        }
    }

    fn handle_error(&self, args: &[Value]) {
        let Some(id) = args.first().and_then(Value::as_u64) else {
            return;
        };
        let payload = args
            .get(1)
            .cloned()
            .and_then(|value| serde_json::from_value::<ErrorPayload>(value).ok())
            .unwrap_or_else(|| ErrorPayload::message("unknown remote error"));
        if let Some((_, pending)) = self.pending.remove(&id) {
            // Progress listeners are torn down before the rejection lands.
            drop(pending.progress_tx);
            let _ = pending.reply_tx.send(Err(rehydrate_error(payload)));
        }
    }

    fn fail_pending(&self) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                drop(pending.progress_tx);
                let _ = pending.reply_tx.send(Err(Error::ChannelClosed));
            }
        }
    }
}

fn parse_call_header(args: &[Value]) -> Option<(u64, String)> {
    let id = args.first().and_then(Value::as_u64)?;
    let name = args.get(1).and_then(Value::as_str)?.to_string();
    Some((id, name))
}

/// Converts an [`ErrorPayload`] from the peer into a client-side [`Error`].
fn rehydrate_error(payload: ErrorPayload) -> Error {
    match payload.name.as_deref() {
        Some("NoResponderError") => Error::NoResponder(payload.message),
        _ => Error::Remote {
            name: payload.name.unwrap_or_else(|| "Error".to_string()),
            message: payload.message,
            stack: payload.stack,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::duplex;

    fn loopback() -> Arc<RpcChannel> {
        RpcChannel::new(MessageBus::local())
    }

    fn pipe_pair() -> (Arc<RpcChannel>, Arc<RpcChannel>) {
        let (a, b) = duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        let client = RpcChannel::new(MessageBus::wrap(&crate::transport::PeerConnection::from_io(
            a_write, a_read,
        )));
        let host = RpcChannel::new(MessageBus::wrap(&crate::transport::PeerConnection::from_io(
            b_write, b_read,
        )));
        (client, host)
    }

    #[tokio::test]
    async fn loopback_call_round_trips_value() {
        let channel = loopback();
        channel.respond_to("echo", |args, done| {
            done.resolve(args.into_iter().next().unwrap_or(Value::Null));
        });

        let result = channel.call("echo", vec![json!({"deep": [1, 2, 3]})]).await;
        assert_eq!(result.unwrap(), json!({"deep": [1, 2, 3]}));
    }

    #[tokio::test]
    async fn no_responder_rejects_with_action_name() {
        let channel = loopback();
        let err = channel.call("goto", vec![json!("http://x")]).await.unwrap_err();
        assert!(err.is_no_responder());
        assert!(err.to_string().contains("goto"));
    }

    #[tokio::test]
    async fn progress_events_precede_terminal_in_order() {
        let channel = loopback();
        channel.respond_to("steps", |_args, done| {
            done.progress(json!("one"));
            done.progress(json!("two"));
            done.resolve(json!("done"));
        });

        let mut handle = channel.call("steps", vec![]);
        let mut progress = handle.take_progress().unwrap();
        let result = handle.await.unwrap();
        assert_eq!(result, json!("done"));

        assert_eq!(progress.recv().await, Some(Progress::Data(json!("one"))));
        assert_eq!(progress.recv().await, Some(Progress::Data(json!("two"))));
        assert_eq!(progress.recv().await, Some(Progress::End(json!("done"))));
        assert_eq!(progress.recv().await, None);
    }

    #[tokio::test]
    async fn rejection_closes_progress_without_end() {
        let channel = loopback();
        channel.respond_to("fails", |_args, done| {
            done.progress(json!("partial"));
            done.reject(ErrorPayload::named("EvaluateError", "boom"));
        });

        let mut handle = channel.call("fails", vec![]);
        let mut progress = handle.take_progress().unwrap();
        let err = handle.await.unwrap_err();
        assert_eq!(err.error_name(), Some("EvaluateError"));

        assert_eq!(progress.recv().await, Some(Progress::Data(json!("partial"))));
        assert_eq!(progress.recv().await, None);
    }

    #[tokio::test]
    async fn double_completion_is_ignored() {
        let channel = loopback();
        channel.respond_to("once", |_args, done| {
            assert!(done.resolve(json!(1)));
            assert!(!done.resolve(json!(2)));
            assert!(!done.reject(ErrorPayload::message("late")));
            assert!(!done.progress(json!("late")));
        });

        let result = channel.call("once", vec![]).await.unwrap();
        assert_eq!(result, json!(1));
    }

    #[tokio::test]
    async fn last_responder_registration_wins() {
        let channel = loopback();
        channel.respond_to("who", |_args, done| {
            done.resolve(json!("first"));
        });
        channel.respond_to("who", |_args, done| {
            done.resolve(json!("second"));
        });

        let result = channel.call("who", vec![]).await.unwrap();
        assert_eq!(result, json!("second"));
    }

    #[tokio::test]
    async fn concurrent_same_name_calls_correlate_by_id() {
        let (client, host) = pipe_pair();
        host.respond_to("evaluate", |args, done| {
            // Answer out of order: the second call resolves first.
            let value = args.into_iter().next().unwrap_or(Value::Null);
            tokio::spawn(async move {
                let n = value.as_u64().unwrap_or(0);
                tokio::time::sleep(std::time::Duration::from_millis(20 - 5 * n)).await;
                done.resolve(json!(n * 10));
            });
        });

        let first = client.call("evaluate", vec![json!(1)]);
        let second = client.call("evaluate", vec![json!(2)]);
        let (a, b) = tokio::join!(first, second);
        assert_eq!(a.unwrap(), json!(10));
        assert_eq!(b.unwrap(), json!(20));
    }

    #[tokio::test]
    async fn cross_pipe_call_round_trips() {
        let (client, host) = pipe_pair();
        host.respond_to("title", |_args, done| {
            done.progress(json!("loading"));
            done.resolve(json!("Example Domain"));
        });

        let mut handle = client.call("title", vec![]);
        let mut progress = handle.take_progress().unwrap();
        assert_eq!(handle.await.unwrap(), json!("Example Domain"));
        assert_eq!(progress.recv().await, Some(Progress::Data(json!("loading"))));
        assert_eq!(
            progress.recv().await,
            Some(Progress::End(json!("Example Domain")))
        );
    }

    #[tokio::test]
    async fn pending_calls_reject_when_connection_dies() {
        let (a, b) = duplex(1024);
        let (a_read, a_write) = tokio::io::split(a);
        let client = RpcChannel::new(MessageBus::wrap(
            &crate::transport::PeerConnection::from_io(a_write, a_read),
        ));

        let handle = client.call("goto", vec![json!("http://x")]);
        drop(b);

        let err = handle.await.unwrap_err();
        assert!(matches!(err, Error::ChannelClosed));
    }

    #[tokio::test]
    async fn timeout_stops_waiting_with_descriptive_error() {
        let channel = loopback();
        channel.respond_to("never", |_args, _done| {
            // Responder intentionally never completes.
        });

        let err = channel
            .call("never", vec![])
            .wait_timeout("wait for page load", 10)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("wait for page load"));
        assert!(err.to_string().contains("10ms"));
    }
}
