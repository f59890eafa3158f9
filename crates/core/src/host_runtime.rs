//! Host-side dispatch runtime.
//!
//! The production host lives in the Electron process; this module is the
//! same runtime expressed over any [`RpcChannel`], which is what embedding
//! and tests use via [`AttachedConnector`]. It answers the bootstrap
//! operations (`continue`, `browser-initialize`, `register-actions`,
//! `quit`) and keeps its dispatch table in sync with the manifests the
//! client sends.
//!
//! [`AttachedConnector`]: crate::AttachedConnector

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

use nocturne_protocol::{
    ops, ActionManifest, InitializeParams, ReadyInfo, EVENT_FORWARD, EVENT_READY,
};
use nocturne_runtime::RpcChannel;

use crate::registry::ActionRegistry;

/// One side of a connection acting as the automation host.
///
/// Holds the initialize parameters received from the client and the set of
/// action names whose handlers are currently live.
pub struct HostRuntime {
    rpc: Arc<RpcChannel>,
    registry: Arc<ActionRegistry>,
    ready: ReadyInfo,
    initialize_params: Mutex<Option<InitializeParams>>,
    synced_manifest: Mutex<ActionManifest>,
    quit_requested: AtomicBool,
    quit_notify: Notify,
}

impl HostRuntime {
    /// Installs the host runtime on `rpc`, wiring the bootstrap responders.
    ///
    /// Action handlers are not installed here; they arrive with the first
    /// `register-actions` manifest, which the client sends during bootstrap.
    pub fn install(
        rpc: Arc<RpcChannel>,
        registry: Arc<ActionRegistry>,
        ready: ReadyInfo,
    ) -> Arc<Self> {
        let runtime = Arc::new(Self {
            rpc: Arc::clone(&rpc),
            registry,
            ready,
            initialize_params: Mutex::new(None),
            synced_manifest: Mutex::new(ActionManifest::default()),
            quit_requested: AtomicBool::new(false),
            quit_notify: Notify::new(),
        });

        rpc.respond_to(ops::CONTINUE, |_args, done| {
            done.resolve(Value::Null);
        });

        let on_initialize = Arc::clone(&runtime);
        rpc.respond_to(ops::BROWSER_INITIALIZE, move |args, done| {
            let params = args
                .into_iter()
                .next()
                .and_then(|value| serde_json::from_value::<InitializeParams>(value).ok());
            match params {
                Some(params) => {
                    tracing::debug!(show = params.show, "browser initialized");
                    *on_initialize.initialize_params.lock() = Some(params);
                    done.resolve(Value::Null);
                }
                None => {
                    done.reject(nocturne_protocol::ErrorPayload::message(
                        "malformed browser-initialize params",
                    ));
                }
            }
        });

        let on_register = Arc::clone(&runtime);
        rpc.respond_to(ops::REGISTER_ACTIONS, move |args, done| {
            let manifest = args
                .into_iter()
                .next()
                .and_then(|value| serde_json::from_value::<ActionManifest>(value).ok());
            match manifest {
                Some(manifest) => {
                    on_register.apply_manifest(manifest);
                    done.resolve(Value::Null);
                }
                None => {
                    done.reject(nocturne_protocol::ErrorPayload::message(
                        "malformed action manifest",
                    ));
                }
            }
        });

        let on_quit = Arc::clone(&runtime);
        rpc.respond_to(ops::QUIT, move |_args, done| {
            on_quit.quit_requested.store(true, Ordering::SeqCst);
            on_quit.quit_notify.notify_waiters();
            done.resolve(Value::Null);
        });

        runtime
    }

    /// Installs the host handler for every action named in `manifest`.
    ///
    /// Names without a host handler in the registry are skipped with a
    /// diagnostic; the client-side call then fails with the ordinary
    /// no-responder rejection.
    fn apply_manifest(&self, manifest: ActionManifest) {
        for name in &manifest.actions {
            match self.registry.definition(name).and_then(|def| def.host_handler) {
                Some(handler) => {
                    self.rpc
                        .respond_to(name, move |args, done| handler(args, done));
                }
                None => {
                    tracing::warn!(name, "manifest names action with no host handler");
                }
            }
        }
        tracing::debug!(
            generation = manifest.generation,
            actions = manifest.actions.len(),
            "action manifest applied"
        );
        *self.synced_manifest.lock() = manifest;
    }

    /// Emits `ready` with this runtime's version metadata.
    pub fn announce_ready(&self) {
        let info = serde_json::to_value(&self.ready).unwrap_or(Value::Null);
        self.rpc.bus().emit(EVENT_READY, vec![info]);
    }

    /// Forwards an asynchronous host event to the client.
    pub fn forward_event(&self, name: &str, params: Value) {
        self.rpc
            .bus()
            .emit(EVENT_FORWARD, vec![Value::String(name.to_string()), params]);
    }

    /// Parameters received with `browser-initialize`, once it has run.
    pub fn initialize_params(&self) -> Option<InitializeParams> {
        self.initialize_params.lock().clone()
    }

    /// The most recently applied action manifest.
    pub fn synced_manifest(&self) -> ActionManifest {
        self.synced_manifest.lock().clone()
    }

    /// Whether the client has asked the host to quit.
    pub fn quit_requested(&self) -> bool {
        self.quit_requested.load(Ordering::SeqCst)
    }

    /// Resolves once a `quit` call arrives.
    pub async fn quit(&self) {
        while !self.quit_requested() {
            self.quit_notify.notified().await;
        }
    }
}
