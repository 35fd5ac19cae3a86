//! Shared helpers for the integration tests: nodes on an in-memory network
//! with short timers, plus polling and event-matching utilities.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use groupmesh::{AppEvent, ChannelApplication, Config, Keypair, MemoryNetwork, Node, NodeId, OverlayError};
use tokio::sync::mpsc::UnboundedReceiver;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestNode {
    pub node: Node,
    pub events: UnboundedReceiver<AppEvent>,
    pub addr: String,
}

impl TestNode {
    pub fn id(&self) -> NodeId {
        self.node.id()
    }

    pub async fn knows(&self, peer: NodeId) -> bool {
        match self.node.closest(peer, 64).await {
            Ok(contacts) => contacts.iter().any(|c| c.id == peer),
            Err(OverlayError::EmptyTable) => false,
            Err(e) => panic!("closest failed: {e}"),
        }
    }

    /// Next event satisfying `pred`, skipping others.
    pub async fn expect_event(&mut self, pred: impl Fn(&AppEvent) -> bool) -> AppEvent {
        let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
        loop {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) if pred(&event) => return event,
                Ok(Some(_)) => continue,
                Ok(None) => panic!("event channel closed"),
                Err(_) => panic!("timed out waiting for event on {}", self.addr),
            }
        }
    }

    /// Every event that arrives within `window`.
    pub async fn drain_for(&mut self, window: Duration) -> Vec<AppEvent> {
        let deadline = tokio::time::Instant::now() + window;
        let mut seen = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, self.events.recv()).await {
            seen.push(event);
        }
        seen
    }
}

/// Short timers so liveness and retry behaviour shows up within a test.
pub fn fast_config() -> Config {
    Config {
        heartbeat_interval: Duration::from_millis(100),
        heartbeat_timeout: Duration::from_millis(100),
        retry_base: Duration::from_millis(50),
        retry_cap: Duration::from_millis(400),
        rpc_timeout: Duration::from_millis(300),
        lookup_query_timeout: Duration::from_millis(300),
        lookup_total_timeout: Duration::from_secs(2),
        ..Config::default()
    }
}

pub async fn spawn_node(net: &MemoryNetwork, addr: &str, config: Config) -> TestNode {
    let (transport, inbound) = net.attach(addr);
    let (app, events) = ChannelApplication::new();
    let node = Node::spawn(config, Keypair::generate(), transport, inbound, Arc::new(app))
        .await
        .expect("spawn node");
    TestNode {
        node,
        events,
        addr: addr.to_string(),
    }
}

pub async fn spawn_nodes(net: &MemoryNetwork, names: &[&str], config: Config) -> Vec<TestNode> {
    let mut nodes = Vec::new();
    for name in names {
        nodes.push(spawn_node(net, name, config.clone()).await);
    }
    nodes
}

/// `a` adds `b`; the challenge ping introduces `a`, and each side admits the
/// other once it has answered a challenge.
pub async fn connect(a: &TestNode, b: &TestNode) {
    a.node.add_peer(b.node.contact().clone()).await.expect("add peer");
}

pub async fn full_mesh(nodes: &[TestNode]) {
    for (i, a) in nodes.iter().enumerate() {
        for b in &nodes[i + 1..] {
            connect(a, b).await;
        }
    }
    for a in nodes {
        for b in nodes {
            if a.id() != b.id() {
                assert!(wait_until(TEST_TIMEOUT, || a.knows(b.id())).await, "{} never learned {}", a.addr, b.addr);
            }
        }
    }
}

/// Poll `check` until it holds or `limit` passes.
pub async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
