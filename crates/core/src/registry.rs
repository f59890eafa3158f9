//! Explicit action registry.
//!
//! Actions extend the client with new named capabilities without touching
//! the core. Each [`ActionDefinition`] pairs an optional host-side handler
//! with the client-side invoker that gets queued when the action is called.
//! Definitions live in an [`ActionRegistry`] consulted by every client at
//! enqueue time, so registration order and timing are explicit state rather
//! than shared mutable prototypes.
//!
//! Namespaces group related actions under one name (`stats.load`); a
//! namespace name may only be registered once.

use crate::client::ActionContext;
use crate::queue::{Done, Invoker};
use nocturne_protocol::ActionManifest;
use nocturne_runtime::{Error, Responder, Result};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Client-side half of an action: queued when the action is invoked.
pub type ClientInvoker = Arc<dyn Fn(ActionContext, Vec<Value>, Done) + Send + Sync>;

/// Host-side half of an action: answers the remote call on the host runtime.
pub type HostHandler = Arc<dyn Fn(Vec<Value>, Responder) + Send + Sync>;

/// One named capability.
#[derive(Clone)]
pub struct ActionDefinition {
    /// Handler installed on the host runtime's dispatch table, if any.
    pub host_handler: Option<HostHandler>,
    /// Invoker queued on the client when the action is called.
    pub client_invoker: ClientInvoker,
}

impl ActionDefinition {
    /// Defines a client-only action.
    pub fn new<F>(client_invoker: F) -> Self
    where
        F: Fn(ActionContext, Vec<Value>, Done) + Send + Sync + 'static,
    {
        Self {
            host_handler: None,
            client_invoker: Arc::new(client_invoker),
        }
    }

    /// Attaches the host-side handler.
    pub fn with_host_handler<F>(mut self, host_handler: F) -> Self
    where
        F: Fn(Vec<Value>, Responder) + Send + Sync + 'static,
    {
        self.host_handler = Some(Arc::new(host_handler));
        self
    }

    /// Defines an action whose client half simply forwards the call to the
    /// host runtime under the same name.
    pub fn runner(name: &str) -> Self {
        let name = name.to_string();
        Self::new(move |ctx, args, done| {
            let name = name.clone();
            tokio::spawn(async move {
                match ctx.invoke_runner(&name, args).await {
                    Ok(value) => done.resolve(value),
                    Err(error) => done.reject(error),
                };
            });
        })
    }
}

/// Registry of action definitions, keyed by flat or dotted name.
pub struct ActionRegistry {
    actions: RwLock<HashMap<String, ActionDefinition>>,
    namespaces: RwLock<BTreeMap<String, Vec<String>>>,
    generation: AtomicU64,
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            actions: RwLock::new(HashMap::new()),
            namespaces: RwLock::new(BTreeMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// The process-wide default registry, shared by clients that are not
    /// given an explicit one.
    pub fn global() -> Arc<ActionRegistry> {
        static GLOBAL: OnceLock<Arc<ActionRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(ActionRegistry::new())))
    }

    /// Registers a flat action. Re-registering a name replaces the previous
    /// definition (last registration wins) with a diagnostic.
    pub fn register(&self, name: &str, definition: ActionDefinition) {
        if self
            .actions
            .write()
            .insert(name.to_string(), definition)
            .is_some()
        {
            tracing::warn!(name, "replacing action definition");
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Registers a namespace of related actions.
    ///
    /// Each entry becomes available under `namespace.key`. Registering the
    /// same namespace name twice fails synchronously.
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateNamespace`] if `namespace` is already registered.
    pub fn register_namespace(
        &self,
        namespace: &str,
        entries: Vec<(String, ActionDefinition)>,
    ) -> Result<()> {
        {
            let mut namespaces = self.namespaces.write();
            if namespaces.contains_key(namespace) {
                return Err(Error::DuplicateNamespace(namespace.to_string()));
            }
            namespaces.insert(
                namespace.to_string(),
                entries.iter().map(|(key, _)| key.clone()).collect(),
            );
        }

        let mut actions = self.actions.write();
        for (key, definition) in entries {
            actions.insert(format!("{namespace}.{key}"), definition);
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Looks up a definition by flat or dotted name.
    pub fn definition(&self, name: &str) -> Option<ActionDefinition> {
        self.actions.read().get(name).cloned()
    }

    /// Returns the invoker for `name`, if registered.
    pub(crate) fn invoker(&self, name: &str) -> Option<Invoker> {
        self.definition(name).map(|def| def.client_invoker)
    }

    /// Lists registered namespace names.
    pub fn list_namespaces(&self) -> Vec<String> {
        self.namespaces.read().keys().cloned().collect()
    }

    /// Monotonic counter bumped on every registration; clients compare it
    /// against the generation they last synced to the host.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Builds the symbolic manifest of actions that carry a host handler.
    pub fn manifest(&self) -> ActionManifest {
        let mut names: Vec<String> = self
            .actions
            .read()
            .iter()
            .filter(|(_, def)| def.host_handler.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        ActionManifest {
            generation: self.generation(),
            actions: names,
        }
    }

    /// Returns every host handler, keyed by fully qualified name.
    pub fn host_handlers(&self) -> Vec<(String, HostHandler)> {
        self.actions
            .read()
            .iter()
            .filter_map(|(name, def)| {
                def.host_handler
                    .as_ref()
                    .map(|handler| (name.clone(), Arc::clone(handler)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop() -> ActionDefinition {
        ActionDefinition::new(|_ctx, _args, done| {
            done.resolve(Value::Null);
        })
    }

    #[test]
    fn duplicate_namespace_fails_synchronously() {
        let registry = ActionRegistry::new();
        registry
            .register_namespace("stats", vec![("load".to_string(), noop())])
            .unwrap();

        let err = registry
            .register_namespace("stats", vec![("reset".to_string(), noop())])
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateNamespace(ref name) if name == "stats"));
    }

    #[test]
    fn namespaced_actions_resolve_by_dotted_path() {
        let registry = ActionRegistry::new();
        registry
            .register_namespace(
                "stats",
                vec![("load".to_string(), noop()), ("reset".to_string(), noop())],
            )
            .unwrap();

        assert!(registry.definition("stats.load").is_some());
        assert!(registry.definition("stats.reset").is_some());
        assert!(registry.definition("stats").is_none());
        assert_eq!(registry.list_namespaces(), vec!["stats".to_string()]);
    }

    #[test]
    fn generation_advances_with_each_registration() {
        let registry = ActionRegistry::new();
        let before = registry.generation();
        registry.register("screenshot", noop());
        registry.register("pdf", noop());
        assert_eq!(registry.generation(), before + 2);
    }

    #[test]
    fn manifest_lists_only_host_backed_actions() {
        let registry = ActionRegistry::new();
        registry.register("local-only", noop());
        registry.register(
            "goto",
            noop().with_host_handler(|_args, done| {
                done.resolve(json!("ok"));
            }),
        );
        registry
            .register_namespace(
                "cookies",
                vec![(
                    "get".to_string(),
                    noop().with_host_handler(|_args, done| {
                        done.resolve(Value::Null);
                    }),
                )],
            )
            .unwrap();

        let manifest = registry.manifest();
        assert_eq!(
            manifest.actions,
            vec!["cookies.get".to_string(), "goto".to_string()]
        );
    }
}
