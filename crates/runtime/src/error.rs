//! Error types for the nocturne runtime.

use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the nocturne runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// Electron host binary was not found.
    #[error("Electron host not found. Install with: npm install electron, or set NOCTURNE_ELECTRON")]
    HostNotFound,

    /// Failed to launch the host process.
    #[error("Failed to launch host process: {0}")]
    LaunchFailed(String),

    /// Transport-level error (stdio communication).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Protocol-level error (malformed frames, unexpected payloads).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A remote call was issued for a name with no registered responder.
    #[error("no responder registered for '{0}'")]
    NoResponder(String),

    /// A namespace name was registered twice.
    #[error("namespace '{0}' is already registered")]
    DuplicateNamespace(String),

    /// An action name was queued that no registry knows about.
    #[error("unknown action '{0}'")]
    UnknownAction(String),

    /// Remote host error with full context, propagated verbatim.
    #[error("{name}: {message}")]
    Remote {
        /// Error type name (e.g., "TimeoutError", "EvaluateError").
        name: String,
        /// Human-readable error message.
        message: String,
        /// Stack trace from the host, if available.
        stack: Option<String>,
    },

    /// An operation exceeded its configured timeout.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: String,
        timeout_ms: u64,
    },

    /// The peer connection died while calls were outstanding.
    #[error("Channel closed unexpectedly")]
    ChannelClosed,

    /// `run()` was invoked while a drain was already in progress.
    #[error("a run is already in progress")]
    DrainInProgress,

    /// The client has ended; no further drains are possible.
    #[error("client has ended")]
    Ended,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns the error name if this is a Remote error.
    pub fn error_name(&self) -> Option<&str> {
        match self {
            Error::Remote { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Returns true if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout { .. } => true,
            Error::Remote { name, .. } => name == "TimeoutError",
            _ => false,
        }
    }

    /// Returns true if the error means no responder handled the call.
    pub fn is_no_responder(&self) -> bool {
        match self {
            Error::NoResponder(_) => true,
            Error::Remote { name, .. } => name == "NoResponderError",
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_operation_and_bound() {
        let err = Error::Timeout {
            operation: "wait for selector".to_string(),
            timeout_ms: 30_000,
        };
        let text = err.to_string();
        assert!(text.contains("wait for selector"));
        assert!(text.contains("30000ms"));
        assert!(err.is_timeout());
    }

    #[test]
    fn no_responder_mentions_action_name() {
        let err = Error::NoResponder("goto".to_string());
        assert!(err.to_string().contains("goto"));
        assert!(err.is_no_responder());
    }

    #[test]
    fn remote_timeout_is_recognized() {
        let err = Error::Remote {
            name: "TimeoutError".to_string(),
            message: "navigation timed out".to_string(),
            stack: None,
        };
        assert!(err.is_timeout());
        assert_eq!(err.error_name(), Some("TimeoutError"));
    }
}
