//! Demonstration harness: a host and two peer contexts wired over the
//! in-memory hub, exercising unicast calls, callbacks, pass-by-reference
//! and broadcast delivery in one process.

use clap::Parser;
use futures::StreamExt;
use lattice::logging;
use nexus::net::memory::MemoryHub;
use nexus::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "loopback", about = "Runs the in-process demonstration mesh.")]
struct Args {
    /// Packet size above which messages are chunked.
    #[arg(long, default_value_t = 65536)]
    chunk_size: usize,

    /// Number of broadcast rounds to run.
    #[arg(long, default_value_t = 3)]
    rounds: u32,

    /// Call timeout in milliseconds.
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
}

fn calc_service(log: logging::Logger) -> Value {
    Value::object(vec![(
        "add",
        Value::callback(move |args| match (&args[0], &args[1]) {
            (Value::Number(a), Value::Number(b)) => {
                logging::debug!(log, "add invoked"; "a" => *a, "b" => *b);
                Ok(Value::Number(a + b))
            }
            _ => Err(SerializedError::new("TypeError", "ERR_ARGS", "numbers required")),
        }),
    )])
}

fn tab_service(tab_id: i32) -> Value {
    Value::object(vec![(
        "describe",
        Value::callback(move |_| {
            Ok(Value::object(vec![
                ("tab_id", Value::from(tab_id)),
                ("title", Value::from(format!("tab {}", tab_id))),
            ]))
        }),
    )])
}

async fn spawn_host(hub: &Arc<MemoryHub>, args: &Args, log: &logging::Logger) -> Arc<Nexus> {
    let identity = identity_from(vec![("context", json!("host"))]);

    let host = Nexus::new();
    host.configure(
        NexusConfig::new()
            .endpoint(hub.endpoint(identity.clone()))
            .identity(identity)
            .chunk_size(args.chunk_size)
            .call_timeout(Duration::from_millis(args.timeout_ms))
            .logger(log.new(logging::o!("side" => "host")))
            .expose(&ServiceToken::new("calc"), calc_service(log.clone())),
    );

    host.ready().await.expect("Host failed to initialize");
    host
}

async fn spawn_tab(hub: &Arc<MemoryHub>, args: &Args, log: &logging::Logger, tab_id: i32) -> Arc<Nexus> {
    let identity = identity_from(vec![("context", json!("tab")), ("tab_id", json!(tab_id))]);

    let tab = Nexus::new();
    tab.configure(
        NexusConfig::new()
            .endpoint(hub.endpoint(identity.clone()))
            .identity(identity)
            .chunk_size(args.chunk_size)
            .call_timeout(Duration::from_millis(args.timeout_ms))
            .logger(log.new(logging::o!("side" => "tab", "tab_id" => tab_id)))
            .connect_to(identity_from(vec![("context", json!("host"))]))
            .expose(&ServiceToken::new("tab"), tab_service(tab_id)),
    );

    tab.ready().await.expect("Tab failed to initialize");
    tab
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let log = logging::init();

    logging::info!(log, "starting loopback mesh";
                   "chunk_size" => args.chunk_size,
                   "rounds" => args.rounds);

    let hub = MemoryHub::new();
    let host = spawn_host(&hub, &args, &log).await;
    let _tabs = vec![
        spawn_tab(&hub, &args, &log, 1).await,
        spawn_tab(&hub, &args, &log, 2).await,
    ];

    // Unicast: a tab-side proxy against the host's calc service.
    let calc = _tabs[0]
        .create(
            &ServiceToken::new("calc"),
            CreateOptions::default(),
        )
        .await
        .expect("calc proxy");

    let sum = calc
        .at("add")
        .call(vec![Value::from(19), Value::from(23)])
        .await
        .expect("add call");
    logging::info!(log, "unicast result"; "sum" => format!("{:?}", sum));

    // Pass-by-reference: a shared counter owned by the host, mutated
    // through a tab-held proxy.
    let counter = Value::reference(Value::object(vec![("count", Value::from(0))]));
    let handle = counter.clone();
    host.engine()
        .await
        .expect("host engine")
        .resources()
        .register_service(
            "state",
            Value::object(vec![(
                "counter",
                Value::callback(move |_| Ok(handle.clone())),
            )]),
        );

    let state = _tabs[1]
        .create(&ServiceToken::new("state"), CreateOptions::default())
        .await
        .expect("state proxy");

    let shared = match state.at("counter").call(vec![]).await.expect("counter handle") {
        Value::Proxy(proxy) => proxy,
        other => panic!("Expected a proxy, got {:?}", other),
    };

    shared.at("count").set(Value::from(7)).await.expect("counter set");
    let count = shared.at("count").get().await.expect("counter get");
    logging::info!(log, "shared counter"; "count" => format!("{:?}", count));

    // The remote assignment is visible through the host's own handle.
    if let Value::Ref(cell) = &counter {
        let local_view = cell.snapshot();
        logging::info!(log, "host-side counter";
                       "count" => format!("{:?}", local_view.walk(&["count".to_string()])));
    }
    shared.release();

    // Broadcast: the host fans a call out to every tab, collecting one
    // round and streaming the next.
    let tabs_proxy = host
        .create_multicast(
            &ServiceToken::new("tab"),
            MulticastOptions::target(TargetSpec::matcher(Matcher::new(|identity| {
                identity.get("context") == Some(&json!("tab"))
            }))),
        )
        .await
        .expect("broadcast proxy");

    for round in 0..args.rounds {
        let settled = tabs_proxy
            .at("describe")
            .call(vec![])
            .await
            .expect("broadcast call");
        logging::info!(log, "broadcast round settled";
                       "round" => round,
                       "responses" => settled.len());

        let mut stream = tabs_proxy.at("describe").stream(vec![]).expect("broadcast stream");
        while let Some(settled) = stream.next().await {
            logging::debug!(log, "stream item";
                            "round" => round,
                            "fulfilled" => settled.is_fulfilled(),
                            "from" => settled.from());
        }
    }

    logging::info!(log, "loopback mesh finished");
}
