//! End-to-end scenarios over the in-memory adapter: every instance in these
//! tests is a full Nexus stack, and both endpoints of every port pair live
//! in the same test process.

use nexus::error::{NexusError, SerializedError};
use nexus::net::memory::MemoryHub;
use nexus::prelude::*;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn calc_token() -> ServiceToken {
    ServiceToken::new("calc")
}

fn host_descriptor() -> Descriptor {
    identity_from(vec![("context", json!("host"))])
}

async fn pump() {
    for _ in 0..40 {
        tokio::task::yield_now().await;
    }
}

/// A host instance listening on the hub under `{"context": "host"}`.
async fn spawn_host(hub: &Arc<MemoryHub>, services: Vec<(ServiceToken, Value)>) -> Arc<Nexus> {
    let identity = identity_from(vec![("context", json!("host"))]);
    let mut config = NexusConfig::new()
        .endpoint(hub.endpoint(identity.clone()))
        .identity(identity);

    for (token, root) in services {
        config = config.expose(&token, root);
    }

    let host = Nexus::new();
    host.configure(config);
    host.ready().await.unwrap();
    host
}

/// A client instance connected to the host, optionally exposing services.
async fn spawn_client(
    hub: &Arc<MemoryHub>,
    identity: Identity,
    services: Vec<(ServiceToken, Value)>,
) -> Arc<Nexus> {
    let mut config = NexusConfig::new()
        .endpoint(hub.endpoint(identity.clone()))
        .identity(identity)
        .connect_to(host_descriptor());

    for (token, root) in services {
        config = config.expose(&token, root);
    }

    let client = Nexus::new();
    client.configure(config);
    client.ready().await.unwrap();
    client
}

fn calc_service() -> Value {
    Value::object(vec![(
        "add",
        Value::callback(|args| match (&args[0], &args[1]) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
            _ => Err(SerializedError::new("TypeError", "ERR_ARGS", "numbers required")),
        }),
    )])
}

#[tokio::test]
async fn scenario_basic_unicast_rpc() {
    let hub = MemoryHub::new();
    let _host = spawn_host(&hub, vec![(calc_token(), calc_service())]).await;

    let client = spawn_client(
        &hub,
        identity_from(vec![("context", json!("popup"))]),
        vec![],
    )
    .await;

    let api = client
        .create(
            &calc_token(),
            CreateOptions::target(TargetSpec::descriptor(host_descriptor())),
        )
        .await
        .unwrap();

    let sum = api.at("add").call(vec![Value::from(1), Value::from(2)]).await.unwrap();
    assert_eq!(sum, Value::from(3));
}

#[tokio::test]
async fn scenario_host_to_client_callback() {
    let hub = MemoryHub::new();

    let subscriber: Arc<Mutex<Option<ResourceProxy>>> = Arc::new(Mutex::new(None));
    let subscriber_slot = subscriber.clone();

    let events_token = ServiceToken::new("events");
    let events_service = Value::object(vec![(
        "subscribe",
        Value::callback(move |mut args| match args.pop() {
            Some(Value::Proxy(proxy)) => {
                *subscriber_slot.lock().unwrap() = Some(proxy);
                Ok(Value::Undefined)
            }
            _ => Err(SerializedError::new("TypeError", "ERR_ARGS", "callback required")),
        }),
    )]);

    let _host = spawn_host(&hub, vec![(events_token.clone(), events_service)]).await;

    let received = Arc::new(Mutex::new(Vec::<Value>::new()));
    let received_sink = received.clone();
    let on_event = Value::callback(move |mut args| {
        received_sink.lock().unwrap().push(args.pop().unwrap_or(Value::Undefined));
        Ok(Value::Undefined)
    });

    let client = spawn_client(
        &hub,
        identity_from(vec![("context", json!("popup"))]),
        vec![],
    )
    .await;

    let api = client.create(&events_token, CreateOptions::default()).await.unwrap();
    api.at("subscribe").call(vec![on_event]).await.unwrap();

    // The host invokes the revived callback proxy exactly once.
    let proxy = subscriber.lock().unwrap().clone().expect("subscriber registered");
    proxy
        .call(vec![Value::object(vec![("id", Value::from("x"))])])
        .await
        .unwrap();

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0], Value::object(vec![("id", Value::from("x"))]));
}

#[tokio::test]
async fn scenario_pass_by_reference() {
    let hub = MemoryHub::new();

    let events = Arc::new(Mutex::new(Vec::<String>::new()));

    let add_events = events.clone();
    let process_events = events.clone();
    let processor = Value::object(vec![
        (
            "addEvent",
            Value::callback(move |mut args| match args.pop() {
                Some(Value::String(event)) => {
                    add_events.lock().unwrap().push(event);
                    Ok(Value::Undefined)
                }
                _ => Err(SerializedError::new("TypeError", "ERR_ARGS", "event name required")),
            }),
        ),
        (
            "process",
            Value::callback(move |_| {
                let events = process_events.lock().unwrap();
                Ok(Value::object(vec![
                    ("eventCount", Value::from(events.len() as i32)),
                    (
                        "firstEvent",
                        events.first().map(|event| Value::from(event.as_str())).unwrap_or(Value::Undefined),
                    ),
                ]))
            }),
        ),
    ]);

    let factory_token = ServiceToken::new("factory");
    let shared = Value::reference(processor);
    let factory_service = Value::object(vec![(
        "getProcessor",
        Value::callback(move |_| Ok(shared.clone())),
    )]);

    let _host = spawn_host(&hub, vec![(factory_token.clone(), factory_service)]).await;
    let client = spawn_client(
        &hub,
        identity_from(vec![("context", json!("popup"))]),
        vec![],
    )
    .await;

    let api = client.create(&factory_token, CreateOptions::default()).await.unwrap();

    let processor = match api.at("getProcessor").call(vec![]).await.unwrap() {
        Value::Proxy(proxy) => proxy,
        other => panic!("Expected proxy, got {:?}", other),
    };

    processor.at("addEvent").call(vec![Value::from("a")]).await.unwrap();
    processor.at("addEvent").call(vec![Value::from("b")]).await.unwrap();

    let report = processor.at("process").call(vec![]).await.unwrap();
    assert_eq!(
        report,
        Value::object(vec![
            ("eventCount", Value::from(2)),
            ("firstEvent", Value::from("a")),
        ])
    );
}

#[tokio::test]
async fn scenario_disconnection_cleanup() {
    let hub = MemoryHub::new();

    let subscriber: Arc<Mutex<Option<ResourceProxy>>> = Arc::new(Mutex::new(None));
    let subscriber_slot = subscriber.clone();

    let events_token = ServiceToken::new("events");
    let events_service = Value::object(vec![(
        "subscribe",
        Value::callback(move |mut args| match args.pop() {
            Some(Value::Proxy(proxy)) => {
                *subscriber_slot.lock().unwrap() = Some(proxy);
                Ok(Value::Undefined)
            }
            _ => Err(SerializedError::new("TypeError", "ERR_ARGS", "callback required")),
        }),
    )]);

    let host = spawn_host(&hub, vec![(events_token.clone(), events_service)]).await;
    let client = spawn_client(
        &hub,
        identity_from(vec![("context", json!("popup"))]),
        vec![],
    )
    .await;

    let api = client.create(&events_token, CreateOptions::default()).await.unwrap();
    api.at("subscribe").call(vec![Value::callback(|_| Ok(Value::Undefined))]).await.unwrap();

    let client_engine = client.engine().await.unwrap();
    let host_engine = host.engine().await.unwrap();

    // The callback is interned on the client, mirrored on the host.
    assert_eq!(client_engine.resources().counts().1, 1);
    assert_eq!(host_engine.resources().counts().2, 1);

    // A host-side call is in flight when the client goes away.
    let proxy = subscriber.lock().unwrap().clone().unwrap();
    let in_flight = tokio::spawn(async move { proxy.call(vec![]).await });

    client.shutdown();
    pump().await;

    // Both endpoints' registries shed every entry for the connection, and
    // the pending call is rejected with a disconnected error.
    assert_eq!(client_engine.resources().counts().1, 0);
    assert_eq!(host_engine.resources().counts().2, 0);
    assert_eq!(host_engine.pending().outstanding(), 0);

    match in_flight.await.unwrap() {
        Err(NexusError::Disconnected { .. }) => (),
        other => panic!("Expected disconnected error, got {:?}", other),
    }
}

#[tokio::test]
async fn scenario_broadcast_all() {
    let hub = MemoryHub::new();
    let host = spawn_host(&hub, vec![]).await;

    let cs_token = ServiceToken::new("cs");
    let spies = [Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0))];

    let mut clients = Vec::new();
    for (index, spy) in spies.iter().enumerate() {
        let spy = spy.clone();
        let service = Value::object(vec![(
            "refresh",
            Value::callback(move |_| {
                spy.fetch_add(1, Ordering::SeqCst);
                Ok(Value::from("refreshed"))
            }),
        )]);

        clients.push(
            spawn_client(
                &hub,
                identity_from(vec![("context", json!("content-script")), ("tab_id", json!(index as i32))]),
                vec![(cs_token.clone(), service)],
            )
            .await,
        );
    }
    pump().await;

    let broadcast = host
        .create_multicast(
            &cs_token,
            MulticastOptions::target(TargetSpec::matcher(Matcher::new(|identity| {
                identity.get("context") == Some(&json!("content-script"))
            }))),
        )
        .await
        .unwrap();

    let settled = broadcast.at("refresh").call(vec![]).await.unwrap();

    assert_eq!(settled.len(), 2);
    assert!(settled.iter().all(SettledResult::is_fulfilled));
    assert_eq!(spies[0].load(Ordering::SeqCst), 1);
    assert_eq!(spies[1].load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn scenario_stream_with_partial_failure() {
    use futures::StreamExt;

    let hub = MemoryHub::new();
    let host = spawn_host(&hub, vec![]).await;

    let cs_token = ServiceToken::new("cs");

    let ok_service = Value::object(vec![(
        "getTitle",
        Value::callback(|_| Ok(Value::from("The Title"))),
    )]);
    let failing_service = Value::object(vec![(
        "getTitle",
        Value::callback(|_| Err(SerializedError::new("Error", "ERR_NO_TITLE", "detached frame"))),
    )]);

    let _cs_ok = spawn_client(
        &hub,
        identity_from(vec![("context", json!("content-script")), ("tab_id", json!(0))]),
        vec![(cs_token.clone(), ok_service)],
    )
    .await;
    let _cs_failing = spawn_client(
        &hub,
        identity_from(vec![("context", json!("content-script")), ("tab_id", json!(1))]),
        vec![(cs_token.clone(), failing_service)],
    )
    .await;
    pump().await;

    let broadcast = host
        .create_multicast(
            &cs_token,
            MulticastOptions::target(TargetSpec::matcher(Matcher::new(|identity| {
                identity.get("context") == Some(&json!("content-script"))
            }))),
        )
        .await
        .unwrap();

    let settled: Vec<SettledResult> = broadcast.at("getTitle").stream(vec![]).unwrap().collect().await;

    assert_eq!(settled.len(), 2);

    let fulfilled: Vec<&SettledResult> = settled.iter().filter(|entry| entry.is_fulfilled()).collect();
    assert_eq!(fulfilled.len(), 1);
    match fulfilled[0] {
        SettledResult::Fulfilled { value, .. } => assert_eq!(value, &Value::from("The Title")),
        _ => unreachable!(),
    }

    let rejected: Vec<&SettledResult> = settled.iter().filter(|entry| !entry.is_fulfilled()).collect();
    assert_eq!(rejected.len(), 1);
    match rejected[0] {
        SettledResult::Rejected { reason, .. } => assert_eq!(reason.code, "ERR_NO_TITLE"),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn dropping_a_proxy_releases_the_remote_resource() {
    let hub = MemoryHub::new();

    let factory_token = ServiceToken::new("factory");
    let shared = Value::reference(Value::object(vec![("alive", Value::from(true))]));
    let factory_service = Value::object(vec![(
        "getHandle",
        Value::callback(move |_| Ok(shared.clone())),
    )]);

    let host = spawn_host(&hub, vec![(factory_token.clone(), factory_service)]).await;
    let client = spawn_client(
        &hub,
        identity_from(vec![("context", json!("popup"))]),
        vec![],
    )
    .await;

    let api = client.create(&factory_token, CreateOptions::default()).await.unwrap();
    let handle = api.at("getHandle").call(vec![]).await.unwrap();

    let host_engine = host.engine().await.unwrap();
    assert_eq!(host_engine.resources().counts().1, 1);

    drop(handle);
    pump().await;

    assert_eq!(host_engine.resources().counts().1, 0);
}

#[tokio::test]
async fn explicit_release_is_idempotent() {
    let hub = MemoryHub::new();

    let factory_token = ServiceToken::new("factory");
    let shared = Value::reference(Value::object(vec![("alive", Value::from(true))]));
    let factory_service = Value::object(vec![(
        "getHandle",
        Value::callback(move |_| Ok(shared.clone())),
    )]);

    let host = spawn_host(&hub, vec![(factory_token.clone(), factory_service)]).await;
    let client = spawn_client(
        &hub,
        identity_from(vec![("context", json!("popup"))]),
        vec![],
    )
    .await;

    let api = client.create(&factory_token, CreateOptions::default()).await.unwrap();
    let handle = match api.at("getHandle").call(vec![]).await.unwrap() {
        Value::Proxy(proxy) => proxy,
        other => panic!("Expected proxy, got {:?}", other),
    };

    client.release(&handle);
    client.release(&handle);
    pump().await;

    let host_engine = host.engine().await.unwrap();
    assert_eq!(host_engine.resources().counts().1, 0);

    // Later use of the released handle fails at the owner.
    match handle.at("alive").get().await {
        Err(NexusError::Remote(err)) => assert_eq!(err.code, "ERR_RESOURCE_NOT_FOUND"),
        other => panic!("Expected resource error, got {:?}", other),
    }
}

#[tokio::test]
async fn oversize_payloads_chunk_transparently() {
    let hub = MemoryHub::new();

    let echo_token = ServiceToken::new("echo");
    let echo_service = Value::object(vec![(
        "echo",
        Value::callback(|mut args| Ok(args.pop().unwrap_or(Value::Undefined))),
    )]);

    let identity = identity_from(vec![("context", json!("host"))]);
    let host = Nexus::new();
    host.configure(
        NexusConfig::new()
            .endpoint(hub.endpoint(identity.clone()))
            .identity(identity)
            .chunk_size(512)
            .expose(&echo_token, echo_service),
    );
    host.ready().await.unwrap();

    let identity = identity_from(vec![("context", json!("popup"))]);
    let client = Nexus::new();
    client.configure(
        NexusConfig::new()
            .endpoint(hub.endpoint(identity.clone()))
            .identity(identity)
            .chunk_size(512)
            .connect_to(host_descriptor()),
    );
    client.ready().await.unwrap();

    let api = client.create(&echo_token, CreateOptions::default()).await.unwrap();

    let big = "chunked payload ".repeat(1000);
    let result = api.at("echo").call(vec![Value::from(big.clone())]).await.unwrap();

    assert_eq!(result, Value::from(big));
}

#[tokio::test]
async fn binary_transport_round_trips() {
    let hub = MemoryHub::new();

    let echo_token = ServiceToken::new("echo");
    let echo_service = Value::object(vec![(
        "echo",
        Value::callback(|mut args| Ok(args.pop().unwrap_or(Value::Undefined))),
    )]);

    let identity = identity_from(vec![("context", json!("host"))]);
    let host = Nexus::new();
    host.configure(
        NexusConfig::new()
            .endpoint(hub.endpoint_with(identity.clone(), true))
            .identity(identity)
            .expose(&echo_token, echo_service),
    );
    host.ready().await.unwrap();

    let identity = identity_from(vec![("context", json!("popup"))]);
    let client = Nexus::new();
    client.configure(
        NexusConfig::new()
            .endpoint(hub.endpoint_with(identity.clone(), true))
            .identity(identity)
            .connect_to(host_descriptor()),
    );
    client.ready().await.unwrap();

    let api = client.create(&echo_token, CreateOptions::default()).await.unwrap();

    let probe = Value::object(vec![
        ("text", Value::from("binary path")),
        ("big", Value::BigInt("987654321987654321".to_string())),
        ("missing", Value::Undefined),
    ]);
    let result = api.at("echo").call(vec![probe.clone()]).await.unwrap();

    assert_eq!(result, probe);
}

#[tokio::test]
async fn identity_updates_retarget_matchers() {
    let hub = MemoryHub::new();
    let host = spawn_host(&hub, vec![]).await;

    let cs_token = ServiceToken::new("cs");
    let service = Value::object(vec![("ping", Value::callback(|_| Ok(Value::from("pong"))))]);

    let client = spawn_client(
        &hub,
        identity_from(vec![("context", json!("content-script")), ("is_active", json!(false))]),
        vec![(cs_token.clone(), service)],
    )
    .await;
    pump().await;

    let active_only = host
        .create_multicast(
            &cs_token,
            MulticastOptions::target(TargetSpec::matcher(Matcher::new(|identity| {
                identity.get("is_active") == Some(&json!(true))
            }))),
        )
        .await
        .unwrap();

    assert!(active_only.at("ping").call(vec![]).await.unwrap().is_empty());

    client.update_identity(&identity_from(vec![("is_active", json!(true))]));
    pump().await;

    let settled = active_only.at("ping").call(vec![]).await.unwrap();
    assert_eq!(settled.len(), 1);
    assert!(settled[0].is_fulfilled());
}

#[tokio::test]
async fn create_fails_fast_without_a_target() {
    let hub = MemoryHub::new();
    let _host = spawn_host(&hub, vec![(calc_token(), calc_service())]).await;

    let identity = identity_from(vec![("context", json!("popup"))]);
    let client = Nexus::new();
    client.configure(
        NexusConfig::new()
            .endpoint(hub.endpoint(identity.clone()))
            .identity(identity),
    );
    client.ready().await.unwrap();

    match client.create(&calc_token(), CreateOptions::default()).await {
        Err(NexusError::Configuration(_)) => (),
        other => panic!("Expected configuration error, got {:?}", other),
    }
}

#[tokio::test]
async fn named_targets_resolve_through_the_registry() {
    let hub = MemoryHub::new();
    let _host = spawn_host(&hub, vec![(calc_token(), calc_service())]).await;

    let identity = identity_from(vec![("context", json!("popup"))]);
    let client = Nexus::new();
    client.configure(
        NexusConfig::new()
            .endpoint(hub.endpoint(identity.clone()))
            .identity(identity)
            .named_descriptor("the-host", host_descriptor()),
    );
    client.ready().await.unwrap();

    let api = client
        .create(&calc_token(), CreateOptions::target(TargetSpec::named_descriptor("the-host")))
        .await
        .unwrap();

    let sum = api.at("add").call(vec![Value::from(20), Value::from(22)]).await.unwrap();
    assert_eq!(sum, Value::from(42));

    match client
        .create(&calc_token(), CreateOptions::target(TargetSpec::named_descriptor("nope")))
        .await
    {
        Err(NexusError::Configuration(_)) => (),
        other => panic!("Expected configuration error, got {:?}", other),
    }
}

#[tokio::test]
async fn token_default_target_applies() {
    let hub = MemoryHub::new();
    let _host = spawn_host(&hub, vec![(calc_token(), calc_service())]).await;

    let token = ServiceToken::new("calc")
        .with_default_target(TargetSpec::descriptor(host_descriptor()));

    let identity = identity_from(vec![("context", json!("popup"))]);
    let client = Nexus::new();
    client.configure(
        NexusConfig::new()
            .endpoint(hub.endpoint(identity.clone()))
            .identity(identity),
    );
    client.ready().await.unwrap();

    let api = client.create(&token, CreateOptions::default()).await.unwrap();
    let sum = api.at("add").call(vec![Value::from(2), Value::from(2)]).await.unwrap();
    assert_eq!(sum, Value::from(4));
}
