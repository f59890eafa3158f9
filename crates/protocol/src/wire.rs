//! Frame payloads for the call/reply/progress protocol.
//!
//! Every frame on the wire is a JSON array `[event, ...args]`. The event
//! names below are the reserved ones used by the remote call layer; anything
//! else is an application event forwarded to client subscribers.

use serde::{Deserialize, Serialize};

/// Reserved bus event carrying a request: `["call", id, name, args]`.
pub const EVENT_CALL: &str = "call";
/// Reserved bus event carrying a terminal success: `["reply", id, value]`.
pub const EVENT_REPLY: &str = "reply";
/// Reserved bus event carrying an intermediate value: `["progress", id, value]`.
pub const EVENT_PROGRESS: &str = "progress";
/// Reserved bus event carrying a terminal failure: `["error", id, payload]`.
pub const EVENT_ERROR: &str = "error";
/// Emitted once by the host when its runtime is initialized.
pub const EVENT_READY: &str = "ready";
/// Host-forwarded application event: `["forward", name, params]`.
pub const EVENT_FORWARD: &str = "forward";

/// Well-known operation names consumed by the scheduler itself.
pub mod ops {
    /// Readiness probe issued between queued host-bound actions.
    pub const CONTINUE: &str = "continue";
    /// First call after `ready`, carrying [`InitializeParams`].
    ///
    /// [`InitializeParams`]: crate::handshake::InitializeParams
    pub const BROWSER_INITIALIZE: &str = "browser-initialize";
    /// Action manifest sync, carrying [`ActionManifest`].
    ///
    /// [`ActionManifest`]: crate::handshake::ActionManifest
    pub const REGISTER_ACTIONS: &str = "register-actions";
    /// Graceful teardown request issued by `end()`.
    pub const QUIT: &str = "quit";
}

/// Error details attached to an `error` frame.
///
/// Mirrors the shape thrown by the host runtime so that remote failures can
/// be rehydrated verbatim on the client side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error message.
    pub message: String,
    /// Error type name (e.g., "TimeoutError", "NoResponderError").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Stack trace from the host, if available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorPayload {
    /// Creates a payload with just a message.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: None,
            stack: None,
        }
    }

    /// Creates a named payload.
    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: Some(name.into()),
            stack: None,
        }
    }
}
