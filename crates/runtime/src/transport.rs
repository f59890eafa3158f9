//! Pipe framing and the message bus.
//!
//! Frames on the wire are 4-byte little-endian length prefixes followed by a
//! JSON body. Each body is an array `[event, ...args]`. The [`MessageBus`]
//! turns a peer connection into an event emitter: incoming tuples are
//! unpacked and dispatched to local listeners, while outgoing [`emit`] calls
//! are intercepted and sent to the peer instead when one is alive. A bus with
//! no peer dispatches locally, which is what unit tests use.
//!
//! [`emit`]: MessageBus::emit

use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Sender half of a framed pipe.
pub struct PipeSender<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> PipeSender<W> {
    /// Writes one length-prefixed JSON frame.
    pub async fn send(&mut self, message: Value) -> Result<()> {
        let bytes = serde_json::to_vec(&message)?;
        let length = bytes.len() as u32;
        self.writer
            .write_all(&length.to_le_bytes())
            .await
            .map_err(|e| Error::Transport(format!("Failed to write length prefix: {e}")))?;
        self.writer
            .write_all(&bytes)
            .await
            .map_err(|e| Error::Transport(format!("Failed to write frame: {e}")))?;
        self.writer
            .flush()
            .await
            .map_err(|e| Error::Transport(format!("Failed to flush frame: {e}")))?;
        Ok(())
    }
}

/// Receiver half of a framed pipe.
///
/// [`run`] reads frames until EOF or error and forwards each decoded value
/// to the channel handed out by [`PipeTransport::new`].
///
/// [`run`]: PipeReceiver::run
pub struct PipeReceiver<R> {
    reader: R,
    inbound_tx: mpsc::UnboundedSender<Value>,
}

impl<R: AsyncRead + Unpin> PipeReceiver<R> {
    /// Runs the read loop.
    ///
    /// Returns `Ok(())` when the consumer side of the message channel is
    /// dropped (normal shutdown) and an error when the pipe breaks or a
    /// frame is malformed.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            let mut len_buf = [0u8; 4];
            self.reader
                .read_exact(&mut len_buf)
                .await
                .map_err(|e| Error::Transport(format!("Failed to read length prefix: {e}")))?;
            let length = u32::from_le_bytes(len_buf) as usize;

            let mut body = vec![0u8; length];
            self.reader
                .read_exact(&mut body)
                .await
                .map_err(|e| Error::Transport(format!("Failed to read frame body: {e}")))?;

            let message: Value = serde_json::from_slice(&body)?;
            if self.inbound_tx.send(message).is_err() {
                // Consumer is gone; treat as graceful shutdown.
                return Ok(());
            }
        }
    }
}

/// A framed pipe over any async byte stream pair (child stdio in production,
/// duplex pipes in tests).
pub struct PipeTransport<W, R> {
    sender: PipeSender<W>,
    receiver: PipeReceiver<R>,
}

impl<W: AsyncWrite + Unpin, R: AsyncRead + Unpin> PipeTransport<W, R> {
    /// Creates a transport and the channel on which decoded inbound frames
    /// are delivered.
    pub fn new(writer: W, reader: R) -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                sender: PipeSender { writer },
                receiver: PipeReceiver { reader, inbound_tx },
            },
            inbound_rx,
        )
    }

    /// Splits the transport into independently owned halves.
    pub fn into_parts(self) -> (PipeSender<W>, PipeReceiver<R>) {
        (self.sender, self.receiver)
    }

    /// Runs the read loop without splitting. See [`PipeReceiver::run`].
    pub async fn run(&mut self) -> Result<()> {
        self.receiver.run().await
    }
}

/// Boxed sender half, erased over the underlying writer type.
pub trait FrameSink: Send {
    /// Sends one frame to the peer.
    fn send(&mut self, message: Value) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

impl<W: AsyncWrite + Unpin + Send> FrameSink for PipeSender<W> {
    fn send(&mut self, message: Value) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move { PipeSender::send(self, message).await })
    }
}

struct ConnectionParts {
    sink: Box<dyn FrameSink>,
    inbound_rx: mpsc::UnboundedReceiver<Value>,
}

/// Handle to one live peer (a spawned host process, or a test pipe pair).
///
/// The handle is cheap to clone; all clones refer to the same underlying
/// connection, which is how [`MessageBus::wrap`] keeps wrapping idempotent.
#[derive(Clone)]
pub struct PeerConnection {
    id: u64,
    parts: Arc<Mutex<Option<ConnectionParts>>>,
}

impl PeerConnection {
    /// Builds a connection over a raw byte stream pair and spawns its read
    /// loop. Must be called from within a tokio runtime.
    pub fn from_io<W, R>(writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        let (transport, inbound_rx) = PipeTransport::new(writer, reader);
        let (sender, mut receiver) = transport.into_parts();

        tokio::spawn(async move {
            if let Err(e) = receiver.run().await {
                tracing::debug!("transport reader exited: {e}");
            }
        });

        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            parts: Arc::new(Mutex::new(Some(ConnectionParts {
                sink: Box::new(sender),
                inbound_rx,
            }))),
        }
    }

    /// Unique id of this connection within the process.
    pub fn id(&self) -> u64 {
        self.id
    }
}

type Listener = Arc<dyn Fn(&[Value]) + Send + Sync>;
type CloseListener = Arc<dyn Fn() + Send + Sync>;

fn bus_cache() -> &'static Mutex<HashMap<u64, Arc<MessageBus>>> {
    static CACHE: OnceLock<Mutex<HashMap<u64, Arc<MessageBus>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Typed event emitter over a peer connection.
///
/// There is exactly one bus per connection handle, cached for the life of
/// the process; wrapping the same handle again returns the same `Arc`.
pub struct MessageBus {
    outbound_tx: Option<mpsc::UnboundedSender<Value>>,
    listeners: Mutex<HashMap<String, Vec<Listener>>>,
    close_listeners: Mutex<Vec<CloseListener>>,
    closed: AtomicBool,
    connection_id: Option<u64>,
}

impl MessageBus {
    /// Creates a bus with no peer. Emitted events fire local listeners
    /// in-process, which is the mode unit tests run in.
    pub fn local() -> Arc<Self> {
        Arc::new(Self {
            outbound_tx: None,
            listeners: Mutex::new(HashMap::new()),
            close_listeners: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            connection_id: None,
        })
    }

    /// Wraps a peer connection, spawning its writer and dispatch tasks.
    ///
    /// Idempotent per connection: repeated calls with clones of the same
    /// handle return the identical bus instance, for as long as that bus
    /// stays open.
    pub fn wrap(connection: &PeerConnection) -> Arc<Self> {
        Self::wrap_with(connection, |_| {})
    }

    /// Like [`wrap`], but runs `setup` on the bus before the dispatch task
    /// starts. Listeners registered inside `setup` observe every inbound
    /// frame, including ones the peer sent before the bus existed - the
    /// host's `ready` announcement is the important case.
    ///
    /// `setup` does not run when the connection's bus already exists.
    ///
    /// [`wrap`]: MessageBus::wrap
    pub fn wrap_with<F>(connection: &PeerConnection, setup: F) -> Arc<Self>
    where
        F: FnOnce(&Arc<MessageBus>),
    {
        let mut cache = bus_cache().lock();
        if let Some(existing) = cache.get(&connection.id) {
            return Arc::clone(existing);
        }

        match connection.parts.lock().take() {
            Some(parts) => {
                let bus = Self::attach(connection.id, parts, setup);
                cache.insert(connection.id, Arc::clone(&bus));
                bus
            }
            None => {
                // The connection was wrapped before and its bus has since
                // closed and been evicted. Hand out a dead bus rather than
                // resurrecting the connection.
                let (outbound_tx, _closed_rx) = mpsc::unbounded_channel();
                Arc::new(Self {
                    outbound_tx: Some(outbound_tx),
                    listeners: Mutex::new(HashMap::new()),
                    close_listeners: Mutex::new(Vec::new()),
                    closed: AtomicBool::new(true),
                    connection_id: None,
                })
            }
        }
    }

    fn attach<F>(id: u64, parts: ConnectionParts, setup: F) -> Arc<Self>
    where
        F: FnOnce(&Arc<MessageBus>),
    {
        let ConnectionParts {
            mut sink,
            mut inbound_rx,
        } = parts;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Value>();
        let bus = Arc::new(Self {
            outbound_tx: Some(outbound_tx),
            listeners: Mutex::new(HashMap::new()),
            close_listeners: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            connection_id: Some(id),
        });

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    tracing::error!("transport write error: {e}");
                    break;
                }
            }
        });

        // Early frames wait in the inbound channel until the dispatch task
        // below starts, so listeners installed here cannot miss them.
        setup(&bus);

        let dispatch_bus = Arc::clone(&bus);
        tokio::spawn(async move {
            while let Some(message) = inbound_rx.recv().await {
                dispatch_bus.dispatch_frame(message);
            }
            dispatch_bus.close();
        });

        bus
    }

    /// Registers a listener for one event name.
    pub fn on<F>(&self, event: &str, listener: F)
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        self.listeners
            .lock()
            .entry(event.to_string())
            .or_default()
            .push(Arc::new(listener));
    }

    /// Registers a listener invoked once when the peer connection dies.
    pub fn on_close<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            listener();
            return;
        }
        self.close_listeners.lock().push(Arc::new(listener));
    }

    /// Emits an event.
    ///
    /// With a live peer the tuple `[event, ...args]` is serialized and sent
    /// over the connection instead of firing local listeners; without one it
    /// is dispatched locally.
    pub fn emit(&self, event: &str, args: Vec<Value>) {
        match &self.outbound_tx {
            Some(tx) if !self.closed.load(Ordering::SeqCst) => {
                let mut frame = Vec::with_capacity(args.len() + 1);
                frame.push(Value::String(event.to_string()));
                frame.extend(args);
                if tx.send(Value::Array(frame)).is_err() {
                    self.close();
                }
            }
            Some(_) => {
                tracing::debug!(event, "dropping emit on closed bus");
            }
            None => self.dispatch_local(event, &args),
        }
    }

    /// True once the peer connection has died. Peer-less buses never close.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// True if this bus has a peer connection behind it.
    pub fn has_peer(&self) -> bool {
        self.outbound_tx.is_some()
    }

    fn dispatch_frame(&self, message: Value) {
        let Value::Array(mut frame) = message else {
            tracing::warn!("ignoring non-array frame from peer");
            return;
        };
        if frame.is_empty() {
            tracing::warn!("ignoring empty frame from peer");
            return;
        }
        let Value::String(event) = frame.remove(0) else {
            tracing::warn!("ignoring frame with non-string event name");
            return;
        };
        self.dispatch_local(&event, &frame);
    }

    fn dispatch_local(&self, event: &str, args: &[Value]) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .get(event)
            .map(|entries| entries.to_vec())
            .unwrap_or_default();
        for listener in listeners {
            listener(args);
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dead buses must not accumulate in the process-wide cache.
        if let Some(id) = self.connection_id {
            bus_cache().lock().remove(&id);
        }
        let listeners: Vec<CloseListener> = std::mem::take(&mut *self.close_listeners.lock());
        for listener in listeners {
            listener();
        }
    }
}
