//! Multi-node scenarios over real loopback TCP with the in-process
//! cluster backend.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use switchboard::{Body, BusConfig, BusError, EventBus, JsonCodec, Message, ReplyError, ReplyResult};
use switchboard_cluster::LocalCluster;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);
const SILENCE: Duration = Duration::from_millis(300);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

async fn start_bus(cluster: &LocalCluster) -> EventBus {
    EventBus::start_clustered(BusConfig::local_network(), cluster.manager())
        .await
        .expect("bus start")
}

fn send_collect(
    bus: &EventBus,
    address: &str,
    body: impl Into<Body>,
    reply_timeout: Duration,
) -> oneshot::Receiver<ReplyResult> {
    let (tx, rx) = oneshot::channel();
    bus.send_with_timeout(address, body, reply_timeout, move |result| {
        let _ = tx.send(result);
    })
    .unwrap();
    rx
}

#[tokio::test(flavor = "multi_thread")]
async fn two_node_send_and_reply() {
    init_tracing();
    let cluster = LocalCluster::new();
    let a = start_bus(&cluster).await;
    let b = start_bus(&cluster).await;

    let registration = a
        .register_handler("a.greet", |msg: Message| {
            msg.reply(msg.body().clone());
        })
        .unwrap();
    registration.completion().await.unwrap();

    let rx = send_collect(&b, "a.greet", "hello", Duration::from_millis(1000));
    let reply = timeout(WAIT, rx).await.unwrap().unwrap().expect("reply");
    assert_eq!(reply.body().as_str(), Some("hello"));

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn lone_node_send_to_missing_address_fails_fast() {
    init_tracing();
    let cluster = LocalCluster::new();
    let a = start_bus(&cluster).await;

    let started = Instant::now();
    let rx = send_collect(&a, "missing", "x", Duration::from_millis(200));
    let result = timeout(WAIT, rx).await.unwrap().unwrap();
    assert_eq!(result.unwrap_err(), ReplyError::NoHandlers);
    assert!(
        started.elapsed() < Duration::from_millis(150),
        "expected NO_HANDLERS well before the reply timeout"
    );

    a.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn publish_fans_out_to_every_node_exactly_once() {
    init_tracing();
    let cluster = LocalCluster::new();
    let a = start_bus(&cluster).await;
    let b = start_bus(&cluster).await;
    let c = start_bus(&cluster).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    for (name, bus) in [("a", &a), ("b", &b)] {
        let tx = tx.clone();
        let registration = bus
            .register_handler("news", move |msg: Message| {
                let _ = tx.send((name, msg.body().as_str().unwrap().to_string()));
            })
            .unwrap();
        registration.completion().await.unwrap();
    }

    c.publish("news", "v1").unwrap();

    let mut seen = Vec::new();
    for _ in 0..2 {
        seen.push(timeout(WAIT, rx.recv()).await.unwrap().unwrap());
    }
    seen.sort();
    assert_eq!(seen, vec![("a", "v1".to_string()), ("b", "v1".to_string())]);
    assert!(
        timeout(SILENCE, rx.recv()).await.is_err(),
        "a handler received the publish twice"
    );

    for bus in [a, b, c] {
        bus.close().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn send_rotates_across_nodes_hosting_the_address() {
    init_tracing();
    let cluster = LocalCluster::new();
    let a = start_bus(&cluster).await;
    let b = start_bus(&cluster).await;
    let c = start_bus(&cluster).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    for (name, bus) in [("a", &a), ("b", &b)] {
        let tx = tx.clone();
        let registration = bus
            .register_handler("work", move |_msg: Message| {
                let _ = tx.send(name);
            })
            .unwrap();
        registration.completion().await.unwrap();
    }

    for _ in 0..4 {
        c.send("work", "job").unwrap();
    }

    let mut counts = std::collections::HashMap::new();
    for _ in 0..4 {
        *counts
            .entry(timeout(WAIT, rx.recv()).await.unwrap().unwrap())
            .or_insert(0) += 1;
    }
    assert_eq!(counts.get("a"), Some(&2), "sends did not rotate: {counts:?}");
    assert_eq!(counts.get("b"), Some(&2), "sends did not rotate: {counts:?}");

    for bus in [a, b, c] {
        bus.close().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn messages_from_one_sender_arrive_in_order() {
    init_tracing();
    let cluster = LocalCluster::new();
    let a = start_bus(&cluster).await;
    let b = start_bus(&cluster).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let registration = b
        .register_handler("seq", move |msg: Message| {
            let _ = tx.send(msg.body().as_i64().unwrap());
        })
        .unwrap();
    registration.completion().await.unwrap();

    for i in 0..50i64 {
        a.send("seq", i).unwrap();
    }
    let mut got = Vec::new();
    for _ in 0..50 {
        got.push(timeout(WAIT, rx.recv()).await.unwrap().unwrap());
    }
    assert_eq!(got, (0..50).collect::<Vec<_>>());

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u64,
}

struct Unencodable;

#[tokio::test(flavor = "multi_thread")]
async fn object_bodies_cross_the_wire_through_codecs() {
    init_tracing();
    let cluster = LocalCluster::new();
    let a = start_bus(&cluster).await;
    let b = start_bus(&cluster).await;
    a.register_codec::<Order>(JsonCodec::<Order>::new());
    b.register_codec::<Order>(JsonCodec::<Order>::new());

    let registration = a
        .register_handler("orders", |msg: Message| {
            let order = msg.body().downcast_ref::<Order>().expect("order body");
            msg.reply(order.id as i64);
        })
        .unwrap();
    registration.completion().await.unwrap();

    let rx = send_collect(
        &b,
        "orders",
        Body::object(Order { id: 9 }),
        Duration::from_secs(1),
    );
    let reply = timeout(WAIT, rx).await.unwrap().unwrap().expect("reply");
    assert_eq!(reply.body().as_i64(), Some(9));

    // Clustered sends of un-codec'd types fail synchronously.
    assert!(matches!(
        b.send("orders", Body::object(Unencodable)),
        Err(BusError::NoCodec(_))
    ));

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn local_registration_is_visible_before_cluster_propagation() {
    init_tracing();
    let cluster = LocalCluster::new();
    let a = start_bus(&cluster).await;

    // Deliberately no completion() await: a same-node send must still find
    // the handler.
    a.register_handler("early", |msg: Message| {
        msg.reply("here");
    })
    .unwrap();

    let rx = send_collect(&a, "early", "ping", Duration::from_secs(1));
    let reply = timeout(WAIT, rx).await.unwrap().unwrap().expect("reply");
    assert_eq!(reply.body().as_str(), Some("here"));

    a.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn dead_peer_subscriptions_are_purged_after_failure() {
    init_tracing();
    let cluster = LocalCluster::new();
    let a = start_bus(&cluster).await;
    let b = start_bus(&cluster).await;

    let registration = b
        .register_handler("t", |msg: Message| {
            msg.reply("alive");
        })
        .unwrap();
    registration.completion().await.unwrap();

    // Kill B without unregistering: its subscription stays behind.
    b.close().await.unwrap();

    // First send still routes to the dead node; the connect failure purges
    // the stale subscription and the message is lost, so the reply times
    // out.
    let rx = send_collect(&a, "t", "x", Duration::from_millis(500));
    let result = timeout(WAIT, rx).await.unwrap().unwrap();
    assert_eq!(result.unwrap_err(), ReplyError::Timeout);

    // With the subscription purged, the next send fails fast.
    let rx = send_collect(&a, "t", "x", Duration::from_secs(5));
    let result = timeout(WAIT, rx).await.unwrap().unwrap();
    assert_eq!(result.unwrap_err(), ReplyError::NoHandlers);

    a.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn sends_reconnect_transparently_after_peer_restart() {
    init_tracing();
    let cluster = LocalCluster::new();
    let a = start_bus(&cluster).await;
    let b1 = start_bus(&cluster).await;
    let b_port = b1.node_id().port();

    let (tx1, mut rx1) = mpsc::unbounded_channel();
    let registration = b1
        .register_handler("t", move |msg: Message| {
            let _ = tx1.send(msg.body().as_str().unwrap().to_string());
        })
        .unwrap();
    registration.completion().await.unwrap();

    a.send("t", "one").unwrap();
    assert_eq!(
        timeout(WAIT, rx1.recv()).await.unwrap().unwrap(),
        "one".to_string()
    );

    // Restart the peer on the same port, giving A's side of the dead
    // connection time to notice and finish its cleanup first.
    b1.close().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let b2 = EventBus::start_clustered(
        BusConfig::local_network().with_port(b_port),
        cluster.manager(),
    )
    .await
    .expect("restart on same port");
    let (tx2, mut rx2) = mpsc::unbounded_channel();
    let registration = b2
        .register_handler("t", move |msg: Message| {
            let _ = tx2.send(msg.body().as_str().unwrap().to_string());
        })
        .unwrap();
    registration.completion().await.unwrap();

    // Let the broken connection drain out of the pool.
    tokio::time::sleep(Duration::from_millis(500)).await;

    a.send("t", "two").unwrap();
    assert_eq!(
        timeout(WAIT, rx2.recv()).await.unwrap().unwrap(),
        "two".to_string()
    );

    a.close().await.unwrap();
    b2.close().await.unwrap();
}
