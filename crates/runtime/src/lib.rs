//! nocturne runtime - host lifecycle, transport, and remote call protocol
//!
//! This crate provides the low-level plumbing for talking to the
//! browser-hosting Electron process:
//!
//! - **Host management**: locating Electron and spawning the host runner
//! - **Transport**: length-prefixed JSON frames over stdio pipes, surfaced
//!   as an event-emitting message bus
//! - **Remote calls**: request/response/progress correlation by per-call id
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐
//! │  nocturne   │  Client, action queue, registry
//! └──────┬──────┘
//!        │
//! ┌──────▼──────┐
//! │   runtime   │  This crate
//! │  ┌────────┐ │
//! │  │  Rpc   │ │  call/reply/progress correlation
//! │  └────────┘ │
//! │  ┌────────┐ │
//! │  │  Bus   │ │  Pipe transport + event emitter
//! │  └────────┘ │
//! │  ┌────────┐ │
//! │  │  Host  │ │  Process management
//! │  └────────┘ │
//! └─────────────┘
//! ```
//!
//! A bus with no peer dispatches events in-process, so every layer above the
//! framing can be exercised in unit tests without a real child process.

pub mod error;
pub mod host;
pub mod rpc;
pub mod transport;

pub use error::{Error, Result};
pub use host::{HostConfig, HostProcess, find_electron};
pub use rpc::{CallHandle, Handler, Progress, ProgressStream, Responder, RpcChannel};
pub use transport::{FrameSink, MessageBus, PeerConnection, PipeReceiver, PipeSender, PipeTransport};
