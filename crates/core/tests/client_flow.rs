//! End-to-end flows: a client driving the host runtime over a duplex pipe
//! pair, the same wiring an embedded host uses via [`AttachedConnector`].

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use nocturne::{
    ActionDefinition, ActionRegistry, AttachedConnector, Client, ClientOptions, ClientState,
    HostRuntime, Session,
};
use nocturne_protocol::ReadyInfo;
use nocturne_runtime::{Error, MessageBus, PeerConnection, Progress, RpcChannel};

fn ready_info() -> ReadyInfo {
    ReadyInfo {
        version: "0.1.0".to_string(),
        electron: Some("12.0.0".to_string()),
        chromium: Some("89.0".to_string()),
        capabilities: Vec::new(),
    }
}

struct Harness {
    client: Client,
    runtime: Arc<HostRuntime>,
}

/// Wires a client and a host runtime to opposite ends of an in-memory pipe.
fn harness(registry: Arc<ActionRegistry>, options: ClientOptions) -> Harness {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    let client_rpc = RpcChannel::new(MessageBus::wrap(&PeerConnection::from_io(a_write, a_read)));
    let host_rpc = RpcChannel::new(MessageBus::wrap(&PeerConnection::from_io(b_write, b_read)));

    let runtime = HostRuntime::install(host_rpc, Arc::clone(&registry), ready_info());
    let session = Session::attached(client_rpc, ready_info());
    let client = Client::with_registry(options, AttachedConnector::new(session), registry);
    Harness { client, runtime }
}

#[tokio::test]
async fn queued_actions_run_fifo_and_round_trip_values() {
    let registry = Arc::new(ActionRegistry::new());
    let visited = Arc::new(Mutex::new(Vec::new()));
    {
        let visited = Arc::clone(&visited);
        registry.register(
            "goto",
            ActionDefinition::runner("goto").with_host_handler(move |args, done| {
                visited
                    .lock()
                    .push(args.first().cloned().unwrap_or(Value::Null));
                done.resolve(Value::Null);
            }),
        );
    }
    registry.register(
        "title",
        ActionDefinition::runner("title").with_host_handler(|_args, done| {
            done.resolve(json!({"title": "Example Domain", "tags": [1, 2, 3]}));
        }),
    );

    let h = harness(registry, ClientOptions::default());
    h.client
        .queue_action("goto", vec![json!("https://example.com")])
        .unwrap();
    h.client.queue_action("title", vec![]).unwrap();

    let result = h.client.run().await.unwrap();
    assert_eq!(result, json!({"title": "Example Domain", "tags": [1, 2, 3]}));
    assert_eq!(*visited.lock(), vec![json!("https://example.com")]);
    assert_eq!(h.client.state(), ClientState::Ready);
}

#[tokio::test]
async fn progress_is_observed_in_order_before_the_terminal() {
    let registry = Arc::new(ActionRegistry::new());
    registry.register(
        "steps",
        ActionDefinition::new(|ctx, args, done| {
            tokio::spawn(async move {
                let mut handle = ctx.invoke("steps", args);
                let mut progress = handle.take_progress().unwrap();
                let result = match handle.await {
                    Ok(value) => value,
                    Err(error) => {
                        done.reject(error);
                        return;
                    }
                };
                let mut observed = Vec::new();
                while let Some(event) = progress.recv().await {
                    match event {
                        Progress::Data(value) => observed.push(value),
                        Progress::End(value) => {
                            assert_eq!(value, result);
                            break;
                        }
                    }
                }
                done.resolve(json!({"observed": observed, "result": result}));
            });
        })
        .with_host_handler(|_args, done| {
            done.progress(json!("one"));
            done.progress(json!("two"));
            done.resolve(json!("done"));
        }),
    );

    let h = harness(registry, ClientOptions::default());
    h.client.queue_action("steps", vec![]).unwrap();

    let result = h.client.run().await.unwrap();
    assert_eq!(
        result,
        json!({"observed": ["one", "two"], "result": "done"})
    );
}

#[tokio::test]
async fn missing_host_half_rejects_with_the_action_name() {
    let registry = Arc::new(ActionRegistry::new());
    // Client half forwards to a host op that was never installed.
    registry.register("phantom", ActionDefinition::runner("phantom"));

    let h = harness(registry, ClientOptions::default());
    h.client.queue_action("phantom", vec![]).unwrap();

    let err = h.client.run().await.unwrap_err();
    assert!(err.is_no_responder());
    assert!(err.to_string().contains("phantom"));
}

#[tokio::test]
async fn headers_and_options_reach_browser_initialize() {
    let registry = Arc::new(ActionRegistry::new());
    let h = harness(
        registry,
        ClientOptions {
            show: true,
            goto_timeout_ms: 10_000,
            ..Default::default()
        },
    );
    h.client
        .header("X-Nocturne", "1")
        .header("Accept-Language", "en");

    // An empty queue still drains the bootstrap step.
    h.client.run().await.unwrap();

    let params = h.runtime.initialize_params().expect("initialize ran");
    assert!(params.show);
    assert_eq!(params.goto_timeout_ms, 10_000);
    assert_eq!(params.headers.get("X-Nocturne").map(String::as_str), Some("1"));
    assert_eq!(
        params.headers.get("Accept-Language").map(String::as_str),
        Some("en")
    );
}

#[tokio::test]
async fn actions_registered_mid_session_sync_before_the_next_step() {
    let registry = Arc::new(ActionRegistry::new());
    let h = harness(Arc::clone(&registry), ClientOptions::default());
    h.client.run().await.unwrap();
    assert!(h.runtime.synced_manifest().actions.is_empty());

    registry.register(
        "screenshot",
        ActionDefinition::runner("screenshot").with_host_handler(|_args, done| {
            done.resolve(json!("image-bytes"));
        }),
    );
    h.client.queue_action("screenshot", vec![]).unwrap();

    let result = h.client.run().await.unwrap();
    assert_eq!(result, json!("image-bytes"));
    assert_eq!(
        h.runtime.synced_manifest().actions,
        vec!["screenshot".to_string()]
    );
}

#[tokio::test]
async fn end_quits_the_host_and_ends_the_client() {
    let registry = Arc::new(ActionRegistry::new());
    registry.register(
        "title",
        ActionDefinition::runner("title").with_host_handler(|_args, done| {
            done.resolve(json!("last value"));
        }),
    );

    let h = harness(registry, ClientOptions::default());
    h.client.queue_action("title", vec![]).unwrap();

    let result = h.client.end().run().await.unwrap();
    assert_eq!(result, json!("last value"));
    assert_eq!(h.client.state(), ClientState::Ended);
    assert!(h.runtime.quit_requested());

    let err = h.client.run().await.unwrap_err();
    assert!(matches!(err, Error::Ended));
}

#[tokio::test]
async fn forwarded_events_reach_waiters_and_streams() {
    let registry = Arc::new(ActionRegistry::new());
    let h = harness(registry, ClientOptions::default());
    h.client.run().await.unwrap();

    let mut stream = h.client.subscribe();
    let waiter = h.client.wait_for_event("did-finish-load");

    h.runtime
        .forward_event("did-start-loading", json!({"url": "https://example.com"}));
    h.runtime
        .forward_event("did-finish-load", json!({"url": "https://example.com"}));

    let matched = waiter.wait().await.unwrap();
    assert_eq!(matched.name, "did-finish-load");
    assert_eq!(matched.params["url"], json!("https://example.com"));

    assert_eq!(stream.recv().await.unwrap().name, "did-start-loading");
    assert_eq!(stream.recv().await.unwrap().name, "did-finish-load");
}

#[tokio::test]
async fn event_wait_timeout_names_the_event() {
    let registry = Arc::new(ActionRegistry::new());
    let h = harness(
        registry,
        ClientOptions {
            wait_timeout_ms: 50,
            ..Default::default()
        },
    );
    h.client.run().await.unwrap();

    let err = h
        .client
        .wait_for_event("did-finish-load")
        .wait()
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(err.to_string().contains("did-finish-load"));
}

#[tokio::test]
async fn callback_handlers_fire_until_unsubscribed() {
    let registry = Arc::new(ActionRegistry::new());
    let h = harness(registry, ClientOptions::default());
    h.client.run().await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let subscription = h.client.on_event("console", move |event| {
        let _ = tx.send(event);
    });

    h.runtime.forward_event("console", json!(["log", "hello"]));
    let event = rx.recv().await.unwrap();
    assert_eq!(event.params, json!(["log", "hello"]));

    subscription.unsubscribe();
    h.runtime.forward_event("console", json!(["log", "dropped"]));
    // The handler task is gone; its sender was dropped with it.
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn namespaced_actions_run_under_dotted_names() {
    let registry = Arc::new(ActionRegistry::new());
    registry
        .register_namespace(
            "cookies",
            vec![(
                "get".to_string(),
                ActionDefinition::runner("cookies.get").with_host_handler(|args, done| {
                    let name = args.first().cloned().unwrap_or(Value::Null);
                    done.resolve(json!({"name": name, "value": "abc"}));
                }),
            )],
        )
        .unwrap();

    let h = harness(registry, ClientOptions::default());
    h.client
        .queue_action("cookies.get", vec![json!("session")])
        .unwrap();

    let result = h.client.run().await.unwrap();
    assert_eq!(result, json!({"name": "session", "value": "abc"}));
}
