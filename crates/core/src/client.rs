//! Client facade: chainable queueing plus the single-drain scheduler.
//!
//! Calls on a [`Client`] never touch the host directly; they push
//! [`QueuedAction`]s onto an internal FIFO queue and return immediately.
//! [`Client::run`] drains the queue with exactly one action in flight,
//! probing host readiness before each host-backed step, and settles with
//! the value produced by the last action. An action error halts the drain
//! and leaves the remaining items queued.
//!
//! Connection establishment is itself the first queued action: the
//! constructor enqueues a bootstrap step that spawns (or attaches to) the
//! host, sends `browser-initialize`, and syncs the action manifest, so the
//! first explicit action always finds a live session ahead of it in the
//! queue.

use std::collections::BTreeMap;
use std::future::Future;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};

use nocturne_protocol::{ops, InitializeParams, ReadyInfo, EVENT_FORWARD, EVENT_READY};
use nocturne_runtime::{
    CallHandle, Error, HostConfig, HostProcess, MessageBus, Result, RpcChannel,
};

use crate::events::{EventBus, EventStream, EventSubscription, EventWaiter, HostEvent};
use crate::queue::{Done, QueuedAction};
use crate::registry::ActionRegistry;

/// Default for every client timeout, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Whether the browser window is visible.
    pub show: bool,
    /// Navigation timeout in milliseconds.
    pub goto_timeout_ms: u64,
    /// Wait/poll timeout in milliseconds.
    pub wait_timeout_ms: u64,
    /// Timeout for individual host calls, in milliseconds.
    pub execution_timeout_ms: u64,
    /// Host process to spawn; required for the default Electron connector.
    pub host: Option<HostConfig>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            show: false,
            goto_timeout_ms: DEFAULT_TIMEOUT_MS,
            wait_timeout_ms: DEFAULT_TIMEOUT_MS,
            execution_timeout_ms: DEFAULT_TIMEOUT_MS,
            host: None,
        }
    }
}

/// Lifecycle of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Created; no host session yet.
    Initial,
    /// Bootstrap completed, host session live.
    Ready,
    /// Torn down; further drains fail with [`Error::Ended`].
    Ended,
}

/// An established host session.
pub struct Session {
    /// The call channel to the host.
    pub rpc: Arc<RpcChannel>,
    /// The spawned host process, when this client owns one.
    pub host: Option<HostProcess>,
    /// Version metadata the host announced with `ready`.
    pub ready: ReadyInfo,
}

impl Session {
    /// Wraps an externally managed connection as a session.
    pub fn attached(rpc: Arc<RpcChannel>, ready: ReadyInfo) -> Self {
        Self {
            rpc,
            host: None,
            ready,
        }
    }
}

/// Strategy for establishing the host session during bootstrap.
pub trait Connector: Send + Sync {
    /// Connects and yields the session. Runs once, as the first queued
    /// action.
    fn connect(&self, options: &ClientOptions) -> BoxFuture<'static, Result<Session>>;
}

/// Default connector: spawns the Electron host and waits for `ready`.
pub struct ElectronConnector;

impl Connector for ElectronConnector {
    fn connect(&self, options: &ClientOptions) -> BoxFuture<'static, Result<Session>> {
        let options = options.clone();
        Box::pin(async move {
            let config = options
                .host
                .clone()
                .ok_or_else(|| Error::LaunchFailed("no host runner configured".to_string()))?;
            let mut host = HostProcess::launch(&config).await?;
            let peer = host.connect()?;

            // The listener goes in before the dispatch task starts; a ready
            // frame the host sent during startup is still observed.
            let (ready_tx, ready_rx) = oneshot::channel();
            let ready_tx = Mutex::new(Some(ready_tx));
            let bus = MessageBus::wrap_with(&peer, |bus| {
                bus.on(EVENT_READY, move |args| {
                    if let Some(tx) = ready_tx.lock().take() {
                        let _ = tx.send(args.first().cloned().unwrap_or(Value::Null));
                    }
                });
            });
            let rpc = RpcChannel::new(Arc::clone(&bus));

            let timeout_ms = options.wait_timeout_ms;
            let info = tokio::time::timeout(Duration::from_millis(timeout_ms), ready_rx)
                .await
                .map_err(|_| Error::Timeout {
                    operation: "wait for host ready".to_string(),
                    timeout_ms,
                })?
                .map_err(|_| Error::ChannelClosed)?;
            let ready: ReadyInfo = serde_json::from_value(info)?;
            tracing::debug!(version = %ready.version, "host announced ready");

            Ok(Session {
                rpc,
                host: Some(host),
                ready,
            })
        })
    }
}

/// Connector that hands out a pre-established session.
///
/// Used when embedding the client over an existing connection, and by
/// integration tests that run the host runtime in-process over a pipe pair.
pub struct AttachedConnector {
    session: Mutex<Option<Session>>,
}

impl AttachedConnector {
    pub fn new(session: Session) -> Self {
        Self {
            session: Mutex::new(Some(session)),
        }
    }
}

impl Connector for AttachedConnector {
    fn connect(&self, _options: &ClientOptions) -> BoxFuture<'static, Result<Session>> {
        let session = self.session.lock().take();
        Box::pin(async move {
            session.ok_or_else(|| Error::Transport("attached session already consumed".to_string()))
        })
    }
}

struct ClientShared {
    options: ClientOptions,
    registry: Arc<ActionRegistry>,
    connector: Option<Box<dyn Connector>>,
    state: Mutex<ClientState>,
    queue: Mutex<Vec<QueuedAction>>,
    running: AtomicBool,
    ending: AtomicBool,
    last_result: Mutex<Value>,
    headers: Mutex<BTreeMap<String, String>>,
    synced_generation: AtomicU64,
    session: Mutex<Option<Session>>,
    events: EventBus<HostEvent>,
}

/// Execution context handed to every running action.
#[derive(Clone)]
pub struct ActionContext {
    shared: Arc<ClientShared>,
}

impl ActionContext {
    /// Issues a raw call to the host.
    ///
    /// Without a live session the handle fails immediately instead of
    /// hanging.
    pub fn invoke(&self, name: &str, args: Vec<Value>) -> CallHandle {
        match self.shared.session.lock().as_ref() {
            Some(session) => session.rpc.call(name, args),
            None => CallHandle::failed(Error::Transport("no active host session".to_string())),
        }
    }

    /// Calls the host half of an action and awaits its result within the
    /// execution timeout.
    pub async fn invoke_runner(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        self.invoke(name, args)
            .wait_timeout(name, self.shared.options.execution_timeout_ms)
            .await
    }

    /// The options this client was configured with.
    pub fn options(&self) -> &ClientOptions {
        &self.shared.options
    }

    /// Polls `probe` every 250ms until it reports true, racing the whole
    /// wait against the wait timeout. The bound holds even when a single
    /// probe never settles; timing out stops the wait but does not cancel
    /// any host-side effect the probe started.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] naming `operation` once the bound elapses.
    pub async fn wait_until<F, Fut>(&self, operation: &str, probe: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let timeout_ms = self.shared.options.wait_timeout_ms;
        match tokio::time::timeout(Duration::from_millis(timeout_ms), poll_until(probe)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: operation.to_string(),
                timeout_ms,
            }),
        }
    }
}

/// Action-queued automation client.
///
/// Cheap to clone; clones share the queue, session, and state.
#[derive(Clone)]
pub struct Client {
    shared: Arc<ClientShared>,
}

impl Client {
    /// Creates a client that spawns the Electron host on first drain.
    pub fn new(options: ClientOptions) -> Self {
        Self::with_registry(options, ElectronConnector, ActionRegistry::global())
    }

    /// Creates a client with a custom connection strategy.
    pub fn with_connector(options: ClientOptions, connector: impl Connector + 'static) -> Self {
        Self::with_registry(options, connector, ActionRegistry::global())
    }

    /// Creates a client with a custom connector and its own registry.
    pub fn with_registry(
        options: ClientOptions,
        connector: impl Connector + 'static,
        registry: Arc<ActionRegistry>,
    ) -> Self {
        let client = Self::build(options, Some(Box::new(connector)), registry);
        client.enqueue_bootstrap();
        client
    }

    /// Creates a client with no host connection at all; actions run with
    /// only their local halves.
    #[cfg(test)]
    pub(crate) fn detached(options: ClientOptions) -> Self {
        Self::build(options, None, Arc::new(ActionRegistry::new()))
    }

    fn build(
        options: ClientOptions,
        connector: Option<Box<dyn Connector>>,
        registry: Arc<ActionRegistry>,
    ) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                options,
                registry,
                connector,
                state: Mutex::new(ClientState::Initial),
                queue: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                ending: AtomicBool::new(false),
                last_result: Mutex::new(Value::Null),
                headers: Mutex::new(BTreeMap::new()),
                synced_generation: AtomicU64::new(0),
                session: Mutex::new(None),
                events: EventBus::default(),
            }),
        }
    }

    fn enqueue_bootstrap(&self) {
        let invoker = Arc::new(|ctx: ActionContext, _args: Vec<Value>, done: Done| {
            tokio::spawn(async move {
                match bootstrap(ctx.shared).await {
                    Ok(value) => done.resolve(value),
                    Err(error) => done.reject(error),
                };
            });
        });
        self.shared
            .queue
            .lock()
            .push(QueuedAction::new(invoker, Vec::new(), false));
    }

    /// The registry this client resolves action names against.
    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.shared.registry
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        *self.shared.state.lock()
    }

    /// Queues a registered action by name with its arguments.
    ///
    /// Arguments are captured now; later mutation of the caller's values
    /// cannot affect the queued call.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownAction`] if `name` is not registered.
    pub fn queue_action(&self, name: &str, args: Vec<Value>) -> Result<&Self> {
        let invoker = self
            .shared
            .registry
            .invoker(name)
            .ok_or_else(|| Error::UnknownAction(name.to_string()))?;
        self.shared
            .queue
            .lock()
            .push(QueuedAction::new(invoker, args, true));
        Ok(self)
    }

    /// Queues an ad-hoc function.
    pub fn queue_fn<F>(&self, action: F) -> &Self
    where
        F: Fn(ActionContext, Vec<Value>, Done) + Send + Sync + 'static,
    {
        self.shared
            .queue
            .lock()
            .push(QueuedAction::new(Arc::new(action), Vec::new(), true));
        self
    }

    /// Queues an ad-hoc future-returning function.
    pub fn queue_future<F, Fut>(&self, action: F) -> &Self
    where
        F: Fn(ActionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.queue_fn(move |ctx, _args, done| {
            let fut = action(ctx);
            tokio::spawn(async move {
                match fut.await {
                    Ok(value) => done.resolve(value),
                    Err(error) => done.reject(error),
                };
            });
        })
    }

    /// Sets a header applied to every navigation. Takes effect immediately,
    /// not as a queued step.
    pub fn header(&self, key: impl Into<String>, value: impl Into<String>) -> &Self {
        self.shared.headers.lock().insert(key.into(), value.into());
        self
    }

    /// Headers currently configured.
    pub fn headers(&self) -> BTreeMap<String, String> {
        self.shared.headers.lock().clone()
    }

    /// Runs `plugin` against this client, splicing the actions it queues at
    /// the call site.
    ///
    /// A failing plugin queues nothing: actions it added before the error
    /// are rolled back.
    pub fn use_plugin<F>(&self, plugin: F) -> Result<&Self>
    where
        F: FnOnce(&Self) -> Result<()>,
    {
        let saved = mem::take(&mut *self.shared.queue.lock());
        let outcome = plugin(self);
        {
            let mut queue = self.shared.queue.lock();
            let added = mem::take(&mut *queue);
            *queue = saved;
            if outcome.is_ok() {
                queue.extend(added);
            }
        }
        outcome.map(|()| self)
    }

    /// Marks the client for teardown: the next successful drain quits the
    /// host, shuts it down, and moves the client to
    /// [`ClientState::Ended`].
    pub fn end(&self) -> &Self {
        self.shared.ending.store(true, Ordering::SeqCst);
        self
    }

    /// Drains the queue and settles with the last action's value.
    ///
    /// Exactly one action is in flight at a time; actions enqueued while
    /// the drain runs are picked up by the same drain. With an empty queue
    /// this settles immediately with the previous drain's final value
    /// (`null` before any drain).
    ///
    /// # Errors
    ///
    /// - [`Error::Ended`] after teardown
    /// - [`Error::DrainInProgress`] when a drain is already running
    /// - The first failing action's error; remaining items stay queued
    pub async fn run(&self) -> Result<Value> {
        if matches!(*self.shared.state.lock(), ClientState::Ended) {
            return Err(Error::Ended);
        }
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(Error::DrainInProgress);
        }

        let result = self.drain().await;
        if result.is_ok() && self.shared.ending.load(Ordering::SeqCst) {
            self.teardown().await;
        }
        self.shared.running.store(false, Ordering::SeqCst);
        result
    }

    async fn drain(&self) -> Result<Value> {
        loop {
            let action = {
                let mut queue = self.shared.queue.lock();
                if queue.is_empty() {
                    None
                } else {
                    Some(queue.remove(0))
                }
            };
            let Some(action) = action else {
                break;
            };

            if let Some(rpc) = self.current_rpc() {
                self.sync_actions(&rpc).await?;
                if action.wait_ready {
                    rpc.call(ops::CONTINUE, vec![])
                        .wait_timeout("host ready probe", self.shared.options.execution_timeout_ms)
                        .await?;
                }
            }

            let ctx = ActionContext {
                shared: Arc::clone(&self.shared),
            };
            let (done, rx) = Done::new();
            (action.invoker)(ctx, action.args, done);
            let value = match rx.await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(Error::Protocol(
                        "action dropped its completion handle without a result".to_string(),
                    ));
                }
            };
            *self.shared.last_result.lock() = value;
        }
        Ok(self.shared.last_result.lock().clone())
    }

    fn current_rpc(&self) -> Option<Arc<RpcChannel>> {
        self.shared
            .session
            .lock()
            .as_ref()
            .map(|session| Arc::clone(&session.rpc))
    }

    /// Pushes a fresh manifest to the host when the registry has grown
    /// since the last sync, so dynamically added actions are live before
    /// the next step runs.
    async fn sync_actions(&self, rpc: &Arc<RpcChannel>) -> Result<()> {
        if self.shared.synced_generation.load(Ordering::SeqCst)
            == self.shared.registry.generation()
        {
            return Ok(());
        }
        let manifest = self.shared.registry.manifest();
        let generation = manifest.generation;
        rpc.call(
            ops::REGISTER_ACTIONS,
            vec![serde_json::to_value(&manifest)?],
        )
        .wait_timeout(
            "register actions",
            self.shared.options.execution_timeout_ms,
        )
        .await?;
        self.shared
            .synced_generation
            .store(generation, Ordering::SeqCst);
        Ok(())
    }

    async fn teardown(&self) {
        let session = self.shared.session.lock().take();
        if let Some(session) = session {
            // Best effort: the host may already be gone.
            let _ = session
                .rpc
                .call(ops::QUIT, vec![])
                .wait_timeout("quit", 2_000)
                .await;
            if let Some(host) = session.host {
                if let Err(error) = host.shutdown().await {
                    tracing::warn!(%error, "host shutdown failed");
                }
            }
        }
        *self.shared.state.lock() = ClientState::Ended;
    }

    /// Subscribes to all host-forwarded events.
    pub fn subscribe(&self) -> EventStream<HostEvent> {
        EventStream::new(self.shared.events.subscribe())
    }

    /// Invokes `handler` for every forwarded event named `name` until the
    /// returned subscription is dropped.
    pub fn on_event<F>(&self, name: &str, handler: F) -> EventSubscription
    where
        F: Fn(HostEvent) + Send + 'static,
    {
        let name = name.to_string();
        let mut rx = self.shared.events.subscribe();
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => break,
                    event = rx.recv() => match event {
                        Ok(event) => {
                            if event.name == name {
                                handler(event);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
        EventSubscription::new(cancel_tx)
    }

    /// Waits for the next forwarded event named `name`, bounded by the wait
    /// timeout.
    pub fn wait_for_event(&self, name: &str) -> EventWaiter<HostEvent> {
        let operation = format!("wait for event '{name}'");
        let name = name.to_string();
        let rx = self
            .shared
            .events
            .register_waiter(move |event: &HostEvent| event.name == name);
        EventWaiter::new(
            rx,
            Duration::from_millis(self.shared.options.wait_timeout_ms),
            operation,
        )
    }
}

async fn poll_until<F, Fut>(mut probe: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    loop {
        if probe().await? {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// Establishes the host session; queued as the first action of every
/// connected client.
async fn bootstrap(shared: Arc<ClientShared>) -> Result<Value> {
    let connector = shared
        .connector
        .as_ref()
        .ok_or_else(|| Error::Transport("client has no connector".to_string()))?;
    let session = connector.connect(&shared.options).await?;

    // Forwarded host events feed the client-side event bus for the rest of
    // the session. Weak, so the bus listener cannot keep the client alive.
    let weak = Arc::downgrade(&shared);
    session.rpc.bus().on(EVENT_FORWARD, move |args| {
        if let Some(shared) = weak.upgrade() {
            let name = args
                .first()
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let params = args.get(1).cloned().unwrap_or(Value::Null);
            shared.events.emit(HostEvent { name, params });
        }
    });

    let params = InitializeParams {
        headers: shared.headers.lock().clone(),
        show: shared.options.show,
        goto_timeout_ms: shared.options.goto_timeout_ms,
        wait_timeout_ms: shared.options.wait_timeout_ms,
        execution_timeout_ms: shared.options.execution_timeout_ms,
    };
    session
        .rpc
        .call(
            ops::BROWSER_INITIALIZE,
            vec![serde_json::to_value(&params)?],
        )
        .wait_timeout("browser initialize", shared.options.goto_timeout_ms)
        .await?;

    let manifest = shared.registry.manifest();
    let generation = manifest.generation;
    session
        .rpc
        .call(
            ops::REGISTER_ACTIONS,
            vec![serde_json::to_value(&manifest)?],
        )
        .wait_timeout("register actions", shared.options.execution_timeout_ms)
        .await?;
    shared.synced_generation.store(generation, Ordering::SeqCst);

    tracing::info!(version = %session.ready.version, "host session established");
    *shared.session.lock() = Some(session);
    *shared.state.lock() = ClientState::Ready;
    Ok(Value::Null)
}
