//! Queued actions and their one-shot completion handle.

use crate::client::ActionContext;
use nocturne_runtime::{Error, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Function queued by a chainable call; executed once during a drain.
pub type Invoker = Arc<dyn Fn(ActionContext, Vec<Value>, Done) + Send + Sync>;

/// A deferred unit of work.
///
/// Arguments are captured at enqueue time; mutating the caller's values
/// afterwards cannot affect the queued call.
pub struct QueuedAction {
    pub(crate) invoker: Invoker,
    pub(crate) args: Vec<Value>,
    /// Whether the scheduler probes host readiness before this item runs.
    pub(crate) wait_ready: bool,
}

impl QueuedAction {
    pub(crate) fn new(invoker: Invoker, args: Vec<Value>, wait_ready: bool) -> Self {
        Self {
            invoker,
            args,
            wait_ready,
        }
    }
}

/// One-shot completion handle passed to every queued action.
///
/// The first call to [`resolve`] or [`reject`] wins; later calls return
/// false and count for nothing, so an action that completes twice cannot
/// advance the drain twice.
///
/// [`resolve`]: Done::resolve
/// [`reject`]: Done::reject
#[derive(Clone)]
pub struct Done {
    tx: Arc<Mutex<Option<oneshot::Sender<Result<Value>>>>>,
}

impl Done {
    pub(crate) fn new() -> (Self, oneshot::Receiver<Result<Value>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Completes the action successfully. Returns false if already completed.
    pub fn resolve(&self, value: Value) -> bool {
        self.finish(Ok(value))
    }

    /// Fails the action, halting the enclosing drain. Returns false if
    /// already completed.
    pub fn reject(&self, error: Error) -> bool {
        self.finish(Err(error))
    }

    fn finish(&self, result: Result<Value>) -> bool {
        match self.tx.lock().take() {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }
}
