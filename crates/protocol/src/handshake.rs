//! Bootstrap handshake payloads.
//!
//! The host emits `ready` with [`ReadyInfo`] once its runtime is up. The
//! client answers with a `browser-initialize` call carrying
//! [`InitializeParams`], then keeps the host's dispatch table current with
//! `register-actions` calls carrying an [`ActionManifest`] of symbolic names.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version and capability metadata emitted by the host with `ready`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyInfo {
    /// Host runtime version string.
    pub version: String,
    /// Electron version, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub electron: Option<String>,
    /// Chromium version, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chromium: Option<String>,
    /// Names of optional capabilities the host supports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

/// Client options transmitted with the `browser-initialize` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Extra headers applied to every navigation.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Whether the browser window is visible.
    #[serde(default)]
    pub show: bool,
    /// Default navigation timeout in milliseconds.
    pub goto_timeout_ms: u64,
    /// Default wait/poll timeout in milliseconds.
    pub wait_timeout_ms: u64,
    /// Default page-execution timeout in milliseconds.
    pub execution_timeout_ms: u64,
}

/// Symbolic list of action names whose host halves should be live.
///
/// Sent once during bootstrap and again whenever the client-side registry
/// grows, so the currently running instance picks up dynamically added
/// actions before its next runner call. Names are dotted for namespaced
/// actions (`"stats.load"`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionManifest {
    /// Registry generation this manifest was produced from.
    pub generation: u64,
    /// Fully qualified action names.
    pub actions: Vec<String>,
}
