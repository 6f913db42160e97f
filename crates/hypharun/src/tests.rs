//! End-to-end runtime tests over a mock conduit: handshake, registration,
//! dispatch, and the context's ways back out.

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use rmpv::Value as Wire;
use serde_json::json;

use hypharpc::codec;
use hypharpc::metadata::MetadataSnapshot;
use hypharpc::metadata::SnapshotBuilder;
use hypharpc::model::Record;
use hypharpc::model::Scalar;
use hypharpc::model::Value;

use crate::context::Context;
use crate::hooks::Middleware;
use crate::mock_conduit::MockConduit;
use crate::module::Handler;
use crate::module::Module;
use crate::module::Package;
use crate::module::handler;
use crate::registry::HandlerKey;
use crate::registry::RegistryError;
use crate::runtime::RunOptions;
use crate::runtime::Runtime;
use crate::runtime::RuntimeError;
use crate::runtime::run;

// ============================================================================
//  FIXTURES
// ============================================================================

/// Main package with one module `Greeter` (id 1): state schema 1
/// (message, count), a `hello` handler (id 1, request schema 2: name), a
/// declared-but-not-implemented `peer_only` handler (id 2, schema 3), and a
/// declared `Admin` module this process never registers.
fn greeter_snapshot() -> MetadataSnapshot {
    SnapshotBuilder::new()
        .upstream_id("up-1")
        .package(0, "")
        .module(0, 1, "Greeter")
        .module(0, 9, "Admin")
        .schema(0, 1)
        .field(0, 1, 1, "message", "s", false)
        .field(0, 1, 2, "count", "i", false)
        .state_model(0, 1, 1, 1)
        .schema(0, 2)
        .field(0, 2, 1, "name", "s", false)
        .handler(0, 1, 1, "hello", 2)
        .schema(0, 3)
        .field(0, 3, 1, "flag", "b", false)
        .handler(0, 1, 2, "peer_only", 3)
        .build()
}

struct TestModule {
    name: &'static str,
    handlers: Vec<(&'static str, Handler)>,
}

impl Module for TestModule {
    fn name(&self) -> &str {
        self.name
    }

    fn handlers(&self) -> Vec<(&'static str, Handler)> {
        self.handlers.clone()
    }
}

fn noop_handler() -> Handler {
    handler(|_ctx: Arc<Context>| async {})
}

/// `hello` pulls `name` out of the request, logs the greeting, and pushes it
/// back as module state. Note the lowercase module name against the declared
/// `Greeter`.
fn greeter_module(log: &Arc<Mutex<Vec<String>>>) -> TestModule {
    let log = Arc::clone(log);
    let hello = handler(move |ctx: Arc<Context>| {
        let log = Arc::clone(&log);
        async move {
            let name = ctx
                .data
                .get("name")
                .and_then(Value::as_one)
                .and_then(Scalar::as_str)
                .unwrap_or("world")
                .to_string();
            log.lock().unwrap().push(format!("hello {name}"));
            let mut state = ctx.model("Greeter.State").unwrap();
            state.set("message", format!("hello {name}")).unwrap();
            state.set("count", 1).unwrap();
            ctx.render(&state).await.unwrap();
        }
    });
    TestModule {
        name: "greeter",
        handlers: vec![("hello", hello)],
    }
}

fn hello_body(name: &str) -> Vec<u8> {
    codec::encode_multi(&[Wire::from(1u32), Wire::from(name)]).unwrap()
}

fn map_get<'a>(map: &'a [(Wire, Wire)], key: &str) -> Option<&'a Wire> {
    map.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

/// Splits an outbound frame into its addressed package and decoded payload.
fn unwrap_outbound(frame: &[u8]) -> (u32, Vec<Wire>) {
    let items = codec::decode_multi(frame).unwrap();
    assert_eq!(items.len(), 4, "outbound envelope has four items");
    assert_eq!(items[0].as_u64(), Some(0), "outbound kind is zero");
    assert!(items[2].is_map(), "outbound headers are a map");
    let package_id = items[1].as_u64().unwrap() as u32;
    let Wire::Binary(payload) = &items[3] else {
        panic!("outbound payload must be binary");
    };
    (package_id, codec::decode_multi(payload).unwrap())
}

// ============================================================================
//  STARTUP
// ============================================================================

#[test]
fn start_requires_main_package() {
    let (conduit, _handle) = MockConduit::new(&greeter_snapshot());
    let result = Runtime::start(vec![Package::new("extras")], RunOptions::new(), conduit);
    assert!(matches!(result, Err(RuntimeError::MissingMainPackage)));
}

#[test]
fn start_sends_configured_init_request() {
    let (conduit, _handle) = MockConduit::new(&greeter_snapshot());
    let log = Arc::new(Mutex::new(Vec::new()));
    let package = Package::main().module(greeter_module(&log));
    let options = RunOptions::new()
        .dev(true)
        .addr("127.0.0.1:8080")
        .sdk("rust-test");
    Runtime::start(vec![package], options, conduit.clone()).unwrap();

    let request = conduit.init_request().expect("init request captured");
    let Wire::Map(map) = codec::decode_one(&request).unwrap() else {
        panic!("init request must be a map");
    };
    assert_eq!(map_get(&map, "dev"), Some(&Wire::from(true)));
    assert_eq!(map_get(&map, "addr"), Some(&Wire::from("127.0.0.1:8080")));
    assert_eq!(map_get(&map, "sdk"), Some(&Wire::from("rust-test")));
    let Some(Wire::Array(names)) = map_get(&map, "pkg_names") else {
        panic!("pkg_names must be an array");
    };
    assert_eq!(names, &[Wire::from("")]);
}

#[test]
fn default_sdk_names_this_runtime() {
    let options = RunOptions::new();
    assert!(options.sdk.starts_with("rust-"));
}

// ============================================================================
//  REGISTRATION
// ============================================================================

#[test]
fn registration_is_the_declared_implemented_intersection() {
    let (conduit, _handle) = MockConduit::new(&greeter_snapshot());
    let package = Package::main().module(TestModule {
        name: "greeter",
        handlers: vec![("hello", noop_handler()), ("local_only", noop_handler())],
    });
    let runtime = Runtime::start(vec![package], RunOptions::new(), conduit).unwrap();

    let handlers = runtime.handlers();
    assert_eq!(handlers.len(), 1);
    assert!(handlers.contains(&HandlerKey {
        package_id: 0,
        module_id: 1,
        handler_id: 1,
    }));
    // Declared but not implemented here: someone else's handler.
    assert!(!handlers.contains(&HandlerKey {
        package_id: 0,
        module_id: 1,
        handler_id: 2,
    }));
}

#[test]
fn unknown_local_module_registers_nothing() {
    let (conduit, _handle) = MockConduit::new(&greeter_snapshot());
    let package = Package::main().module(TestModule {
        name: "solo",
        handlers: vec![("hello", noop_handler())],
    });
    let runtime = Runtime::start(vec![package], RunOptions::new(), conduit).unwrap();
    assert!(runtime.handlers().is_empty());
}

#[test]
fn implemented_handler_without_request_schema_fails_start() {
    // Handler row points at schema 99, which the snapshot never declares.
    let snapshot = SnapshotBuilder::new()
        .package(0, "")
        .module(0, 1, "Greeter")
        .schema(0, 2)
        .field(0, 2, 1, "name", "s", false)
        .handler(0, 1, 3, "broken", 99)
        .build();
    let (conduit, _handle) = MockConduit::new(&snapshot);
    let package = Package::main().module(TestModule {
        name: "greeter",
        handlers: vec![("broken", noop_handler())],
    });
    let result = Runtime::start(vec![package], RunOptions::new(), conduit);
    assert!(matches!(
        result,
        Err(RuntimeError::Registry(
            RegistryError::MissingRequestSchema { .. }
        ))
    ));
}

// ============================================================================
//  DISPATCH
// ============================================================================

#[tokio::test]
async fn invoke_runs_handler_and_pushes_state() {
    let (conduit, handle) = MockConduit::new(&greeter_snapshot());
    let log = Arc::new(Mutex::new(Vec::new()));
    let package = Package::main().module(greeter_module(&log));
    let runtime = Runtime::start(vec![package], RunOptions::new(), conduit.clone()).unwrap();

    handle.push_invoke(0, "sock-1", 1, 1, Some(hello_body("ada")));
    handle.close();
    runtime.run().await.unwrap();

    assert_eq!(log.lock().unwrap().as_slice(), ["hello ada"]);

    let sent = conduit.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].socket_id, "sock-1");
    let (package_id, inner) = unwrap_outbound(&sent[0].frame);
    assert_eq!(package_id, 0);
    assert_eq!(inner[0].as_u64(), Some(2), "state push tag");
    assert_eq!(inner[1].as_u64(), Some(0), "state package id");
    assert_eq!(inner[2].as_u64(), Some(1), "state module id");
    let Wire::Binary(record_bytes) = &inner[3] else {
        panic!("state record must be binary");
    };

    let schemas = runtime.schemas();
    let mut state = Record::new(
        Arc::clone(schemas.get("Greeter.State").unwrap()),
        Arc::clone(schemas),
    );
    state.decode(record_bytes).unwrap();
    assert_eq!(state.to_object(), json!({"message": "hello ada", "count": 1}));
}

#[tokio::test]
async fn invoke_without_body_gets_an_empty_record() {
    let (conduit, handle) = MockConduit::new(&greeter_snapshot());
    let log = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&log);
    let hello = handler(move |ctx: Arc<Context>| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock().unwrap().push(format!("fields={}", ctx.data.len()));
        }
    });
    let package = Package::main().module(TestModule {
        name: "greeter",
        handlers: vec![("hello", hello)],
    });

    handle.push_invoke(0, "sock-1", 1, 1, None);
    handle.close();
    run(vec![package], RunOptions::new(), conduit).await.unwrap();

    assert_eq!(log.lock().unwrap().as_slice(), ["fields=0"]);
}

#[tokio::test]
async fn unaddressed_invoke_is_dropped_and_the_loop_continues() {
    let (conduit, handle) = MockConduit::new(&greeter_snapshot());
    let log = Arc::new(Mutex::new(Vec::new()));
    let package = Package::main().module(greeter_module(&log));
    let runtime = Runtime::start(vec![package], RunOptions::new(), conduit).unwrap();

    handle.push_invoke(0, "sock-1", 1, 99, None);
    handle.push_invoke(0, "sock-1", 1, 1, Some(hello_body("ada")));
    handle.close();
    runtime.run().await.unwrap();

    assert_eq!(log.lock().unwrap().as_slice(), ["hello ada"]);
}

#[tokio::test]
async fn garbage_frame_is_dropped_and_the_loop_continues() {
    let (conduit, handle) = MockConduit::new(&greeter_snapshot());
    let log = Arc::new(Mutex::new(Vec::new()));
    let package = Package::main().module(greeter_module(&log));
    let runtime = Runtime::start(vec![package], RunOptions::new(), conduit).unwrap();

    // 0xc1 is the one byte msgpack never assigns.
    handle.push_frame(vec![0xc1, 0x00, 0xff]);
    handle.push_invoke(0, "sock-1", 1, 1, None);
    handle.close();
    runtime.run().await.unwrap();

    assert_eq!(log.lock().unwrap().as_slice(), ["hello world"]);
}

#[tokio::test]
async fn unconsumed_message_kinds_are_ignored() {
    let (conduit, handle) = MockConduit::new(&greeter_snapshot());
    let log = Arc::new(Mutex::new(Vec::new()));
    let package = Package::main().module(greeter_module(&log));
    let runtime = Runtime::start(vec![package], RunOptions::new(), conduit.clone()).unwrap();

    let payload = codec::encode_multi(&[Wire::from(9u32), Wire::from("ignored")]).unwrap();
    let frame = codec::encode_multi(&[
        Wire::from(0u32),
        Wire::Map(Vec::new()),
        Wire::Binary(payload),
        Wire::from("sock-1"),
    ])
    .unwrap();
    handle.push_frame(frame);
    handle.push_invoke(0, "sock-1", 1, 1, None);
    handle.close();
    runtime.run().await.unwrap();

    assert_eq!(log.lock().unwrap().as_slice(), ["hello world"]);
    assert_eq!(conduit.sent().len(), 1);
}

#[tokio::test]
async fn mangled_body_still_reaches_the_handler() {
    let (conduit, handle) = MockConduit::new(&greeter_snapshot());
    let log = Arc::new(Mutex::new(Vec::new()));
    let package = Package::main().module(greeter_module(&log));
    let runtime = Runtime::start(vec![package], RunOptions::new(), conduit).unwrap();

    // Field 1 decodes; field 77 is not in the schema, so the rest is dropped.
    let body = codec::encode_multi(&[
        Wire::from(1u32),
        Wire::from("ada"),
        Wire::from(77u32),
        Wire::from("noise"),
    ])
    .unwrap();
    handle.push_invoke(0, "sock-1", 1, 1, Some(body));
    handle.close();
    runtime.run().await.unwrap();

    assert_eq!(log.lock().unwrap().as_slice(), ["hello ada"]);
}

// ============================================================================
//  THE CONTEXT
// ============================================================================

#[tokio::test]
async fn headers_cookies_and_socket_reach_the_context() {
    let (conduit, handle) = MockConduit::new(&greeter_snapshot());
    let log = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&log);
    let echo = handler(move |ctx: Arc<Context>| {
        let log = Arc::clone(&seen);
        async move {
            log.lock().unwrap().push(format!(
                "{}|{}|{}",
                ctx.socket_id,
                ctx.header("agent").unwrap_or("-"),
                ctx.cookie("sid").unwrap_or("-"),
            ));
        }
    });
    let package = Package::main().module(TestModule {
        name: "greeter",
        handlers: vec![("hello", echo)],
    });
    let runtime = Runtime::start(vec![package], RunOptions::new(), conduit).unwrap();

    let payload = codec::encode_multi(&[
        Wire::from(1u32),
        Wire::from(1u32),
        Wire::from(1u32),
        Wire::Map(vec![(Wire::from("sid"), Wire::from("s-42"))]),
        Wire::Nil,
    ])
    .unwrap();
    let frame = codec::encode_multi(&[
        Wire::from(0u32),
        Wire::Map(vec![(Wire::from("agent"), Wire::from("test/1"))]),
        Wire::Binary(payload),
        Wire::from("sock-9"),
    ])
    .unwrap();
    handle.push_frame(frame);
    handle.close();
    runtime.run().await.unwrap();

    assert_eq!(log.lock().unwrap().as_slice(), ["sock-9|test/1|s-42"]);
}

#[tokio::test]
async fn set_cookie_frames_go_back_through_the_conduit() {
    let (conduit, handle) = MockConduit::new(&greeter_snapshot());
    let bake = handler(|ctx: Arc<Context>| async move {
        ctx.set_cookie("session", "tok-1", 3600, true).unwrap();
    });
    let package = Package::main().module(TestModule {
        name: "greeter",
        handlers: vec![("hello", bake)],
    });
    let runtime = Runtime::start(vec![package], RunOptions::new(), conduit.clone()).unwrap();

    handle.push_invoke(0, "sock-1", 1, 1, None);
    handle.close();
    runtime.run().await.unwrap();

    let sent = conduit.sent();
    assert_eq!(sent.len(), 1);
    let (package_id, inner) = unwrap_outbound(&sent[0].frame);
    assert_eq!(package_id, 0);
    assert_eq!(
        inner,
        vec![
            Wire::from(3u32),
            Wire::from("session"),
            Wire::from("tok-1"),
            Wire::from(3600u32),
            Wire::from(true),
        ]
    );
}

#[tokio::test]
async fn pushing_a_non_state_record_is_a_noop() {
    let (conduit, handle) = MockConduit::new(&greeter_snapshot());
    let log = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&log);
    let bounce = handler(move |ctx: Arc<Context>| {
        let log = Arc::clone(&seen);
        async move {
            // The request shape is not any module's state.
            let request = ctx.model("hfn-0-1-1").unwrap();
            ctx.render(&request).await.unwrap();
            log.lock().unwrap().push("survived".to_string());
        }
    });
    let package = Package::main().module(TestModule {
        name: "greeter",
        handlers: vec![("hello", bounce)],
    });
    let runtime = Runtime::start(vec![package], RunOptions::new(), conduit.clone()).unwrap();

    handle.push_invoke(0, "sock-1", 1, 1, None);
    handle.close();
    runtime.run().await.unwrap();

    assert_eq!(log.lock().unwrap().as_slice(), ["survived"]);
    assert!(conduit.sent().is_empty());
}

// ============================================================================
//  HOOKS
// ============================================================================

struct Recorder {
    tag: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Middleware for Recorder {
    async fn before_invoke(&self, _ctx: &Context) {
        self.log.lock().unwrap().push(format!("{}:before", self.tag));
    }

    async fn after_invoke(&self, _ctx: &Context) {
        self.log.lock().unwrap().push(format!("{}:after", self.tag));
    }

    async fn on_set_state(&self, _ctx: &Context, _state: &Record) {
        self.log.lock().unwrap().push(format!("{}:state", self.tag));
    }
}

#[tokio::test]
async fn middleware_runs_in_registration_order_around_the_handler() {
    let (conduit, handle) = MockConduit::new(&greeter_snapshot());
    let log = Arc::new(Mutex::new(Vec::new()));
    let package = Package::main()
        .module(greeter_module(&log))
        .middleware(Recorder {
            tag: "a",
            log: Arc::clone(&log),
        })
        .middleware(Recorder {
            tag: "b",
            log: Arc::clone(&log),
        });
    let runtime = Runtime::start(vec![package], RunOptions::new(), conduit).unwrap();

    handle.push_invoke(0, "sock-1", 1, 1, None);
    handle.close();
    runtime.run().await.unwrap();

    assert_eq!(
        log.lock().unwrap().as_slice(),
        [
            "a:before",
            "b:before",
            "hello world",
            "a:state",
            "b:state",
            "a:after",
            "b:after",
        ]
    );
}

#[tokio::test]
async fn state_hooks_do_not_fire_for_non_state_pushes() {
    let (conduit, handle) = MockConduit::new(&greeter_snapshot());
    let log = Arc::new(Mutex::new(Vec::new()));
    let bounce = handler(|ctx: Arc<Context>| async move {
        let request = ctx.model("hfn-0-1-1").unwrap();
        ctx.render(&request).await.unwrap();
    });
    let package = Package::main()
        .module(TestModule {
            name: "greeter",
            handlers: vec![("hello", bounce)],
        })
        .middleware(Recorder {
            tag: "a",
            log: Arc::clone(&log),
        });
    let runtime = Runtime::start(vec![package], RunOptions::new(), conduit).unwrap();

    handle.push_invoke(0, "sock-1", 1, 1, None);
    handle.close();
    runtime.run().await.unwrap();

    assert_eq!(log.lock().unwrap().as_slice(), ["a:before", "a:after"]);
}

// ============================================================================
//  SHUTDOWN
// ============================================================================

#[tokio::test]
async fn the_loop_ends_cleanly_when_the_stream_does() {
    let (conduit, handle) = MockConduit::new(&greeter_snapshot());
    let log = Arc::new(Mutex::new(Vec::new()));
    let package = Package::main().module(greeter_module(&log));
    let runtime = Runtime::start(vec![package], RunOptions::new(), conduit).unwrap();

    handle.close();
    runtime.run().await.unwrap();
    assert!(log.lock().unwrap().is_empty());
}
