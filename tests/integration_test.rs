use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use toolworld::*;

use bridge::{BridgePolicy, Dispatcher};
use error::{ErrorCode, ToolError};
use protocol::DispatchRequest;
use server::RpcServer;
use store::{JsonFileStore, MemoryConfigStore};
use tools::builtin::register_builtin_tools;
use tools::registry::Catalogue;
use tools::{handler_fn, Arguments, HandlerError, ParamSchema, ParamType, ToolDescriptor};
use transport::{Connector, DefaultConnector, LineChannel, RemoteChannel, TransportError};

fn args(v: Value) -> Arguments {
    v.as_object().cloned().unwrap()
}

fn memory_catalogue() -> Arc<Catalogue> {
    let cat = Arc::new(Catalogue::new(Arc::new(MemoryConfigStore::new())));
    register_builtin_tools(&cat).unwrap();
    cat
}

fn dispatcher(cat: Arc<Catalogue>, connector: Arc<dyn Connector>) -> Dispatcher {
    Dispatcher::new(
        cat,
        connector,
        BridgePolicy {
            timeout: Duration::from_secs(5),
            attempts: 3,
            backoff_base: Duration::from_millis(20),
            backoff_max: Duration::from_millis(100),
        },
    )
}

/// Connects every endpoint to an in-process server over a duplex pipe
struct InProcessConnector {
    backend: Arc<RpcServer>,
    connects: AtomicUsize,
}

#[async_trait]
impl Connector for InProcessConnector {
    async fn connect(&self, _endpoint: &str) -> Result<Arc<dyn RemoteChannel>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (client, server_end) = tokio::io::duplex(16 * 1024);
        let (sr, sw) = tokio::io::split(server_end);
        tokio::spawn(self.backend.clone().serve(sr, sw));
        let (cr, cw) = tokio::io::split(client);
        Ok(Arc::new(LineChannel::new(cr, cw)))
    }
}

fn backend() -> Arc<RpcServer> {
    let cat = memory_catalogue();
    cat.register(
        ToolDescriptor::local("add", "math", "Sum two numbers").with_schema(
            ParamSchema::new()
                .required("a", ParamType::Number, "")
                .required("b", ParamType::Number, ""),
        ),
        Some(handler_fn(|a: Arguments| async move {
            let x = a.get("a").and_then(Value::as_f64).unwrap_or(0.0);
            let y = a.get("b").and_then(Value::as_f64).unwrap_or(0.0);
            Ok::<_, HandlerError>(json!({ "sum": x + y }))
        })),
        false,
    )
    .unwrap();
    cat.register(
        ToolDescriptor::local("fail", "math", "Always fails"),
        Some(handler_fn(|_| async {
            Err::<Value, HandlerError>("backend exploded".into())
        })),
        false,
    )
    .unwrap();
    let d = Arc::new(dispatcher(
        cat,
        Arc::new(DefaultConnector::new(Duration::from_millis(100))),
    ));
    Arc::new(RpcServer::new(d, 4))
}

/// Test local dispatch through the public request type
#[tokio::test]
async fn test_echo_dispatch_result() {
    let d = dispatcher(
        memory_catalogue(),
        Arc::new(DefaultConnector::new(Duration::from_millis(100))),
    );
    let mut req = DispatchRequest::new("echo", args(json!({"message": "hi"})));
    req.request_id = "req-1".into();
    let result = d.dispatch(req, None).await;
    assert!(result.is_ok());
    assert_eq!(result.request_id, "req-1");
    assert_eq!(result.payload, Some(json!({"message": "hi"})));
}

/// A disabled tool never reaches its handler
#[tokio::test]
async fn test_disabled_tool_handler_not_invoked() {
    let cat = memory_catalogue();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    cat.register(
        ToolDescriptor::local("count", "utility", ""),
        Some(handler_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, HandlerError>(json!(null)) }
        })),
        false,
    )
    .unwrap();
    cat.set_enabled("count", false, "ops").unwrap();

    let d = dispatcher(cat, Arc::new(DefaultConnector::new(Duration::from_millis(100))));
    let err = d.call("count", Arguments::new(), None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ToolDisabled);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

/// Duplicate registration is rejected unless replacement is requested
#[test]
fn test_duplicate_and_replace_registration() {
    let cat = memory_catalogue();
    let echo = || handler_fn(|a: Arguments| async move { Ok::<_, HandlerError>(Value::Object(a)) });
    let err = cat
        .register(ToolDescriptor::local("echo", "utility", "again"), Some(echo()), false)
        .unwrap_err();
    assert!(matches!(err, ToolError::DuplicateTool(_)));

    cat.register(
        ToolDescriptor::local("echo", "utility", "replaced").with_version("2.0.0"),
        Some(echo()),
        true,
    )
    .unwrap();
    let d = cat.get("echo").unwrap();
    assert_eq!(d.version, "2.0.0");
    assert_eq!(cat.list(None).iter().filter(|t| t.name == "echo").count(), 1);
}

/// Unreachable remote host fails with BridgeUnavailable within the deadline
#[tokio::test]
async fn test_unreachable_remote_is_bounded() {
    let cat = memory_catalogue();
    cat.register(
        ToolDescriptor::remote("weather", "external", "", "tcp://127.0.0.1:1"),
        None,
        false,
    )
    .unwrap();
    let d = dispatcher(cat, Arc::new(DefaultConnector::new(Duration::from_millis(200))));

    let started = Instant::now();
    let err = d
        .call("weather", Arguments::new(), Some(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));
    match err {
        ToolError::BridgeUnavailable { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected BridgeUnavailable, got {:?}", other),
    }
    assert_eq!(d.metrics().retries, 2);
}

/// Remote tools run on another server and errors keep their code
#[tokio::test]
async fn test_remote_dispatch_round_trip() {
    let connector = Arc::new(InProcessConnector {
        backend: backend(),
        connects: AtomicUsize::new(0),
    });
    let cat = memory_catalogue();
    for name in ["add", "fail", "missing"] {
        cat.register(
            ToolDescriptor::remote(name, "math", "", "mem://backend")
                .with_schema(ParamSchema::new().open()),
            None,
            false,
        )
        .unwrap();
    }
    let d = dispatcher(cat, connector.clone());

    let out = d.call("add", args(json!({"a": 2, "b": 3.5})), None).await.unwrap();
    assert_eq!(out["sum"], 5.5);

    let err = d.call("add", args(json!({"a": "x"})), None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);

    let err = d.call("fail", Arguments::new(), None).await.unwrap_err();
    assert_eq!(err, ToolError::Handler("backend exploded".into()));

    let err = d.call("missing", Arguments::new(), None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);

    // One channel serves every call
    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    assert_eq!(d.metrics().remote_calls, 4);
}

/// Concurrent remote calls are correlated to their own callers
#[tokio::test]
async fn test_concurrent_remote_calls() {
    let connector = Arc::new(InProcessConnector {
        backend: backend(),
        connects: AtomicUsize::new(0),
    });
    let cat = memory_catalogue();
    cat.register(
        ToolDescriptor::remote("add", "math", "", "mem://backend")
            .with_schema(ParamSchema::new().open()),
        None,
        false,
    )
    .unwrap();
    let d = Arc::new(dispatcher(cat, connector));

    let mut handles = Vec::new();
    for i in 0..16 {
        let d = d.clone();
        handles.push(tokio::spawn(async move {
            let out = d
                .call("add", args(json!({"a": i, "b": 100})), None)
                .await
                .unwrap();
            (i, out["sum"].as_f64().unwrap())
        }));
    }
    for h in handles {
        let (i, sum) = h.await.unwrap();
        assert_eq!(sum, i as f64 + 100.0);
    }
}

/// Enabled state and audit trail survive a restart
#[test]
fn test_config_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tools.json");

    {
        let cat = Arc::new(Catalogue::new(Arc::new(JsonFileStore::open(&path).unwrap())));
        register_builtin_tools(&cat).unwrap();
        cat.set_enabled("echo", false, "alice").unwrap();
    }

    let cat = Arc::new(Catalogue::new(Arc::new(JsonFileStore::open(&path).unwrap())));
    register_builtin_tools(&cat).unwrap();
    assert!(!cat.get("echo").unwrap().enabled);
    assert!(cat.get("get_current_time").unwrap().enabled);

    let history = cat.history("echo").unwrap();
    let last = history.last().unwrap();
    assert_eq!(last.actor, "alice");
    assert_eq!(last.previous, Some(true));
    assert!(!last.enabled);

    let d = tokio_test::block_on(async {
        let d = dispatcher(cat, Arc::new(DefaultConnector::new(Duration::from_millis(100))));
        d.call("echo", Arguments::new(), None).await
    });
    assert!(matches!(d, Err(ToolError::ToolDisabled(_))));
}

/// Ten seconds of simulated time at 10x takes one real second
#[tokio::test(start_paused = true)]
async fn test_accelerated_world_ageing() {
    let mut config = config::Config::default();
    config.store.in_memory = true;
    config.discovery.roots = vec![];
    config.simulation.seed = Some(11);
    config.simulation.acceleration = 10.0;
    config.simulation.maturity_age = 1_000.0;

    let mut rt = runtime::Runtime::build(config).unwrap();
    let api = rt.api();
    let spawned = api
        .call_tool("spawn_agent", args(json!({"name": "ada"})), None);
    rt.start_world();
    let out = spawned.await.unwrap();
    let id = out["id"].as_u64().unwrap();

    // Ten 100ms ticks fall inside this window on the paused clock
    let before = rt.world().read(|s| s.agents()[0].age);
    tokio::time::sleep(Duration::from_millis(1050)).await;
    let after = rt.world().read(|s| s.agents()[0].age);
    rt.shutdown().await;

    let view = api.entities();
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].id, id);
    assert_eq!(after - before, 10.0);
}

/// The agent tools drive the world through the catalogue
#[tokio::test]
async fn test_agent_tools_through_dispatch() {
    let mut config = config::Config::default();
    config.store.in_memory = true;
    config.discovery.roots = vec![];
    config.simulation.seed = Some(3);
    config.simulation.tick_interval_ms = 10;
    let mut rt = runtime::Runtime::build(config).unwrap();
    rt.start_world();
    let api = rt.api();

    let a = api
        .call_tool("spawn_agent", args(json!({"name": "a"})), None)
        .await
        .unwrap();
    let b = api
        .call_tool("spawn_agent", args(json!({"name": "b"})), None)
        .await
        .unwrap();
    let child = api
        .call_tool(
            "create_offspring",
            args(json!({"parent_a": a["id"], "parent_b": b["id"]})),
            None,
        )
        .await
        .unwrap();
    let lineage = api
        .call_tool("get_lineage", args(json!({"agent_id": child["id"]})), None)
        .await
        .unwrap();
    rt.shutdown().await;

    assert_eq!(lineage["generation"], 1);
    assert_eq!(api.world_status().population, 3);
    assert_eq!(api.metrics().dispatch_ok, 4);
}
