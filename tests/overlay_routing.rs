//! Integration tests for discovery, routing, delivery and liveness across
//! several nodes on an in-memory network.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{connect, fast_config, spawn_node, spawn_nodes, wait_until, TEST_TIMEOUT};
use groupmesh::{AppEvent, ChannelApplication, Config, Keypair, MemoryNetwork, Node, OverlayError, UdpTransport};

#[tokio::test]
async fn bootstrap_discovers_the_seed_neighbourhood() {
    let net = MemoryNetwork::new();
    let nodes = spawn_nodes(&net, &["b", "c", "d"], fast_config()).await;
    let (b, c, d) = (&nodes[0], &nodes[1], &nodes[2]);
    connect(b, c).await;
    connect(b, d).await;
    assert!(wait_until(TEST_TIMEOUT, || async move { b.knows(c.id()).await && b.knows(d.id()).await }).await);

    let a = spawn_node(&net, "a", fast_config()).await;
    let known = a.node.bootstrap(vec!["b".to_string()]).await.expect("bootstrap");
    assert!(known >= 3, "bootstrap left only {known} contacts");

    for peer in [b, c, d] {
        assert!(a.knows(peer.id()).await, "a did not learn {}", peer.addr);
    }
    // nodes queried during the lookup learn the newcomer
    assert!(wait_until(TEST_TIMEOUT, || c.knows(a.id())).await);
}

#[tokio::test]
async fn lookup_reaches_nodes_beyond_direct_contacts() {
    let net = MemoryNetwork::new();
    let nodes = spawn_nodes(&net, &["a", "b", "c"], fast_config()).await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    connect(a, b).await;
    connect(b, c).await;
    // both ends answer each other's challenge before either admits the other
    assert!(wait_until(TEST_TIMEOUT, || a.knows(b.id())).await);
    assert!(wait_until(TEST_TIMEOUT, || b.knows(c.id())).await);
    assert!(!a.knows(c.id()).await);

    let found = a.node.lookup(c.id()).await.expect("lookup");
    assert_eq!(found.first().map(|contact| contact.id), Some(c.id()));
    assert!(a.knows(c.id()).await);
}

#[tokio::test]
async fn messages_are_relayed_along_advertised_routes() {
    let config = Config {
        advert_interval: Duration::from_millis(100),
        ..fast_config()
    };
    let net = MemoryNetwork::new();
    let mut nodes = spawn_nodes(&net, &["a", "b", "c"], config).await;
    connect(&nodes[0], &nodes[1]).await;
    connect(&nodes[1], &nodes[2]).await;

    let (a, c_id) = (&nodes[0], nodes[2].id());
    // a holds routes to b (its neighbour) and to c (via b)
    assert!(
        wait_until(TEST_TIMEOUT, || async move { a.node.telemetry().await.is_ok_and(|t| t.routes >= 2) }).await,
        "routes never propagated"
    );
    assert!(!a.knows(c_id).await);

    let a_id = a.id();
    let message_id = a.node.send(c_id, b"through b".to_vec()).await.expect("send");

    let c = &mut nodes[2];
    let event = c.expect_event(|e| matches!(e, AppEvent::Delivered { .. })).await;
    assert_eq!(
        event,
        AppEvent::Delivered {
            sender: a_id,
            plaintext: b"through b".to_vec()
        }
    );

    let a = &nodes[0];
    assert!(
        wait_until(TEST_TIMEOUT, || async move {
            a.node.telemetry().await.is_ok_and(|t| t.delivered == 1 && t.pending_deliveries == 0)
        })
        .await,
        "ack for {message_id} never arrived"
    );
}

#[tokio::test]
async fn buffered_message_is_sent_once_a_route_is_found() {
    let net = MemoryNetwork::new();
    let mut nodes = spawn_nodes(&net, &["a", "b", "c"], fast_config()).await;
    connect(&nodes[0], &nodes[1]).await;
    connect(&nodes[1], &nodes[2]).await;
    let (b, c_id) = (&nodes[1], nodes[2].id());
    assert!(wait_until(TEST_TIMEOUT, || b.knows(c_id)).await);

    // no table entry and no route yet: the message waits for a lookup
    let a_id = nodes[0].id();
    nodes[0].node.send(c_id, b"eventually".to_vec()).await.expect("send");

    let event = nodes[2].expect_event(|e| matches!(e, AppEvent::Delivered { .. })).await;
    assert_eq!(
        event,
        AppEvent::Delivered {
            sender: a_id,
            plaintext: b"eventually".to_vec()
        }
    );
    assert!(nodes[0].knows(c_id).await);
}

#[tokio::test]
async fn silent_peer_is_evicted_and_readmitted_when_heard_again() {
    let net = MemoryNetwork::new();
    let nodes = spawn_nodes(&net, &["a", "b"], fast_config()).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    connect(a, b).await;
    assert!(wait_until(TEST_TIMEOUT, || a.knows(b.id())).await);

    net.isolate("b");
    assert!(
        wait_until(TEST_TIMEOUT, || async move { !a.knows(b.id()).await }).await,
        "b was never evicted"
    );
    let telemetry = a.node.telemetry().await.expect("telemetry");
    assert_eq!(telemetry.down, 1);
    assert_eq!(telemetry.contacts, 0);

    net.heal("b");
    connect(b, a).await;
    assert!(
        wait_until(TEST_TIMEOUT, || async move {
            a.knows(b.id()).await && a.node.telemetry().await.is_ok_and(|t| t.down == 0)
        })
        .await
    );
}

#[tokio::test]
async fn unacknowledged_message_is_reported_exhausted() {
    let config = Config {
        retry_base: Duration::from_millis(20),
        retry_cap: Duration::from_millis(40),
        max_retries: 2,
        ..Config::default()
    };
    let net = MemoryNetwork::new();
    let mut nodes = spawn_nodes(&net, &["a", "b"], config).await;
    connect(&nodes[0], &nodes[1]).await;
    let b_id = nodes[1].id();
    assert!(wait_until(TEST_TIMEOUT, || nodes[0].knows(b_id)).await);

    net.isolate("b");
    let sent = nodes[0].node.send(b_id, b"into the void".to_vec()).await.expect("send");

    let event = nodes[0].expect_event(|e| matches!(e, AppEvent::Failed { .. })).await;
    let AppEvent::Failed { message_id, reason } = event else {
        unreachable!()
    };
    assert_eq!(message_id, sent);
    assert!(matches!(reason, OverlayError::DeliveryExhausted { message_id, .. } if message_id == sent));

    let telemetry = nodes[0].node.telemetry().await.expect("telemetry");
    assert_eq!(telemetry.exhausted, 1);
    assert_eq!(telemetry.pending_deliveries, 0);
    assert_eq!(telemetry.delivered, 0);
}

#[tokio::test]
async fn sending_to_self_is_refused() {
    let net = MemoryNetwork::new();
    let a = spawn_node(&net, "a", fast_config()).await;
    let result = a.node.send(a.id(), b"me".to_vec()).await;
    assert!(matches!(result, Err(OverlayError::NotPermitted(_))));
}

#[tokio::test]
async fn udp_nodes_exchange_messages() {
    let mut started = Vec::new();
    for _ in 0..2 {
        let (transport, inbound) = UdpTransport::bind("127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("bind");
        let (app, events) = ChannelApplication::new();
        let node = Node::spawn(fast_config(), Keypair::generate(), transport, inbound, Arc::new(app))
            .await
            .expect("spawn");
        started.push((node, events));
    }
    let (bob, mut bob_events) = started.pop().expect("bob");
    let (alice, _alice_events) = started.pop().expect("alice");

    alice.add_peer(bob.contact().clone()).await.expect("add peer");
    alice.send(bob.id(), b"over udp".to_vec()).await.expect("send");

    let event = tokio::time::timeout(TEST_TIMEOUT, bob_events.recv())
        .await
        .expect("timed out")
        .expect("channel open");
    assert_eq!(
        event,
        AppEvent::Delivered {
            sender: alice.id(),
            plaintext: b"over udp".to_vec()
        }
    );
}
