//! Host-forwarded event surface.
//!
//! Page lifecycle, console output, and navigation events forwarded by the
//! host are delivered asynchronously, outside the action queue - they may
//! fire between or during queued actions. Two consumption patterns are
//! supported:
//!
//! 1. **Streams**: [`Client::subscribe`] returns an [`EventStream`]
//! 2. **Callbacks**: [`Client::on_event`] spawns a background task managed
//!    by an RAII [`EventSubscription`]
//!
//! [`Client::subscribe`]: crate::Client::subscribe
//! [`Client::on_event`]: crate::Client::on_event

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};

use nocturne_runtime::{Error, Result};

/// One event forwarded from the host.
#[derive(Debug, Clone, PartialEq)]
pub struct HostEvent {
    /// Event name (e.g. "did-finish-load", "console").
    pub name: String,
    /// Event payload.
    pub params: Value,
}

/// RAII handle that cancels a callback-style event handler when dropped.
pub struct EventSubscription {
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl EventSubscription {
    pub(crate) fn new(cancel_tx: oneshot::Sender<()>) -> Self {
        Self {
            cancel_tx: Some(cancel_tx),
        }
    }

    /// Explicitly cancels the subscription, equivalent to dropping it.
    pub fn unsubscribe(mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
    }
}

struct WaiterEntry<E> {
    predicate: Box<dyn Fn(&E) -> bool + Send + Sync>,
    complete_tx: oneshot::Sender<E>,
}

/// Internal dispatcher combining a broadcast channel with predicate waiters.
///
/// Waiters are checked first during [`emit`](Self::emit), so `wait_for_*`
/// patterns have guaranteed delivery even when broadcast receivers lag.
pub(crate) struct EventBus<E: Clone + Send + 'static> {
    tx: broadcast::Sender<E>,
    waiters: Mutex<Vec<WaiterEntry<E>>>,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Emits an event to all matching waiters, then all subscribers.
    pub fn emit(&self, event: E) {
        {
            let mut waiters = self.waiters.lock();
            let mut i = 0;
            while i < waiters.len() {
                if (waiters[i].predicate)(&event) {
                    let entry = waiters.swap_remove(i);
                    let _ = entry.complete_tx.send(event.clone());
                } else {
                    i += 1;
                }
            }
        }
        let _ = self.tx.send(event);
    }

    /// Subscribes to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    /// Registers a waiter completed by the first event matching `predicate`.
    pub fn register_waiter<F>(&self, predicate: F) -> oneshot::Receiver<E>
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        let (complete_tx, complete_rx) = oneshot::channel();
        self.waiters.lock().push(WaiterEntry {
            predicate: Box::new(predicate),
            complete_tx,
        });
        complete_rx
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Wrapper around a broadcast receiver with automatic lag handling.
///
/// Broadcast lag is logged and skipped instead of breaking the consuming
/// loop.
pub struct EventStream<E: Clone + Send + 'static> {
    rx: broadcast::Receiver<E>,
}

impl<E: Clone + Send + 'static> EventStream<E> {
    pub(crate) fn new(rx: broadcast::Receiver<E>) -> Self {
        Self { rx }
    }

    /// Receives the next event; `None` once the source closes.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(dropped = n, "Event stream lagged, dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Attempts to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(dropped = n, "Event stream lagged, dropped events");
                }
                Err(
                    broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed,
                ) => return None,
            }
        }
    }
}

/// One-shot event waiter with timeout support.
pub struct EventWaiter<E> {
    rx: oneshot::Receiver<E>,
    timeout: Duration,
    operation: String,
}

impl<E: Send + 'static> EventWaiter<E> {
    pub(crate) fn new(
        rx: oneshot::Receiver<E>,
        timeout: Duration,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            rx,
            timeout,
            operation: operation.into(),
        }
    }

    /// Waits for the event with the configured timeout.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] naming the awaited event if nothing matches in
    ///   time
    /// - [`Error::ChannelClosed`] if the event source is dropped
    pub async fn wait(self) -> Result<E> {
        let timeout_ms = self.timeout.as_millis() as u64;
        match tokio::time::timeout(self.timeout, self.rx).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(Error::ChannelClosed),
            Err(_) => Err(Error::Timeout {
                operation: self.operation,
                timeout_ms,
            }),
        }
    }
}

impl<E: Send + 'static> Future for EventWaiter<E> {
    type Output = Result<E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(event)) => Poll::Ready(Ok(event)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::ChannelClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}
