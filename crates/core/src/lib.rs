//! Action-queued browser automation client for an Electron host.
//!
//! The client exposes chainable calls that queue deferred actions; nothing
//! touches the host until [`Client::run`] drains the queue, one action in
//! flight at a time. Each action's host half is reached over a
//! length-prefixed JSON pipe protocol with call/reply/progress correlation
//! (see `nocturne-runtime`).
//!
//! ```no_run
//! use nocturne::{ActionDefinition, ActionRegistry, Client, ClientOptions};
//! use nocturne_runtime::HostConfig;
//! use serde_json::json;
//!
//! # async fn example() -> nocturne::Result<()> {
//! let registry = ActionRegistry::global();
//! registry.register("goto", ActionDefinition::runner("goto"));
//! registry.register("title", ActionDefinition::runner("title"));
//!
//! let client = Client::new(ClientOptions {
//!     host: Some(HostConfig::new("runner.js")),
//!     ..Default::default()
//! });
//! client.queue_action("goto", vec![json!("https://example.com")])?;
//! client.queue_action("title", vec![])?;
//! let title = client.end().run().await?;
//! println!("{title}");
//! # Ok(())
//! # }
//! ```
//!
//! Extension actions are registered up front on an [`ActionRegistry`];
//! registering a namespace twice fails synchronously, before any client is
//! constructed. Actions registered while a session is live are synced to
//! the host before the next queued step runs.

pub mod client;
pub mod events;
pub mod host_runtime;
pub mod queue;
pub mod registry;

pub use client::{
    ActionContext, AttachedConnector, Client, ClientOptions, ClientState, Connector,
    ElectronConnector, Session, DEFAULT_TIMEOUT_MS,
};
pub use events::{EventStream, EventSubscription, EventWaiter, HostEvent};
pub use host_runtime::HostRuntime;
pub use queue::{Done, QueuedAction};
pub use registry::{ActionDefinition, ActionRegistry, ClientInvoker, HostHandler};

pub use nocturne_runtime::{Error, Result};
