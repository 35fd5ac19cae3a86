//! # Discovery
//!
//! Two ways of finding peers:
//!
//! - **Iterative lookup** ([`iterative_lookup`]): query the α closest
//!   unqueried contacts in parallel, merge what they return into a
//!   distance-sorted shortlist of size k, and repeat until a round brings
//!   nothing closer, the iteration cap is hit or the total timeout expires.
//!   Bootstrap is a lookup for our own id seeded with the seed contacts.
//! - **Local-segment beacon** ([`beacon_loop`] / [`recv_loop`]): a signed
//!   `Beacon` envelope multicast on the LAN at a fixed interval. Received
//!   datagrams are handed to the node together with their source address;
//!   the announcer may only know its wildcard bind address, so the node
//!   reaches it at the source IP and the announced port
//!   ([`reachable_addr`]) and answers with a unicast `BeaconReply`.
//!
//! Lookups run outside the node worker and only report what they saw; the
//! worker decides what enters the routing table.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::identity::{distance_cmp, Contact, NodeId};
use crate::messages::MAX_DATAGRAM_SIZE;
use crate::protocols::DiscoveryRpc;

// ============================================================================
// Iterative lookup
// ============================================================================

#[derive(Clone, Copy, Debug)]
pub struct LookupLimits {
    pub k: usize,
    pub alpha: usize,
    pub max_iterations: usize,
    pub query_timeout: Duration,
    pub total_timeout: Duration,
}

impl LookupLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            k: config.k,
            alpha: config.alpha,
            max_iterations: config.max_lookup_iterations,
            query_timeout: config.lookup_query_timeout,
            total_timeout: config.lookup_total_timeout,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LookupOutcome {
    /// Up to k contacts, closest to the target first.
    pub closest: Vec<Contact>,
    /// Contacts that answered, with their round-trip time.
    pub responded: Vec<(Contact, Duration)>,
    /// Contacts returned by others, paired with who returned them.
    pub learned: Vec<(Contact, NodeId)>,
    pub failed: Vec<NodeId>,
}

fn sort_by_distance(contacts: &mut [Contact], target: &NodeId) {
    contacts.sort_by(|a, b| distance_cmp(&a.id.xor_distance(target), &b.id.xor_distance(target)));
}

pub async fn iterative_lookup<R: DiscoveryRpc>(
    rpc: Arc<R>,
    self_id: NodeId,
    target: NodeId,
    seeds: Vec<Contact>,
    limits: LookupLimits,
) -> LookupOutcome {
    let started = Instant::now();
    let mut outcome = LookupOutcome::default();
    let mut seen: HashSet<NodeId> = HashSet::new();
    let mut queried: HashSet<NodeId> = HashSet::new();

    let mut shortlist: Vec<Contact> = Vec::new();
    for contact in seeds {
        if contact.id != self_id && seen.insert(contact.id) {
            shortlist.push(contact);
        }
    }
    sort_by_distance(&mut shortlist, &target);

    let mut best = shortlist
        .first()
        .map(|c| c.id.xor_distance(&target))
        .unwrap_or([0xff; 32]);
    let mut iteration = 0;

    loop {
        iteration += 1;
        if iteration > limits.max_iterations {
            warn!(target = %target.short(), iterations = iteration, "lookup exceeded max iterations");
            break;
        }
        if started.elapsed() > limits.total_timeout {
            debug!(target = %target.short(), found = shortlist.len(), "lookup timed out, returning current results");
            break;
        }

        let candidates: Vec<Contact> = shortlist
            .iter()
            .filter(|c| !queried.contains(&c.id))
            .take(limits.alpha)
            .cloned()
            .collect();
        if candidates.is_empty() {
            break;
        }
        for c in &candidates {
            queried.insert(c.id);
        }

        let remaining = limits.total_timeout.saturating_sub(started.elapsed());
        let per_query = limits.query_timeout.min(remaining);
        let mut join_set = JoinSet::new();
        for contact in candidates {
            let rpc = rpc.clone();
            join_set.spawn(async move {
                let sent = Instant::now();
                let result = match tokio::time::timeout(per_query, rpc.find_node(&contact, target)).await {
                    Ok(r) => r,
                    Err(_) => Err(anyhow::anyhow!("query timeout")),
                };
                (contact, sent.elapsed(), result)
            });
        }

        let mut any_closer = false;
        while let Some(joined) = join_set.join_next().await {
            let Ok((contact, elapsed, result)) = joined else {
                continue;
            };
            match result {
                Ok(nodes) => {
                    trace!(peer = %contact.id.short(), returned = nodes.len(), "lookup response");
                    let from = contact.id;
                    outcome.responded.push((contact, elapsed));
                    for node in nodes.into_iter().take(limits.k.max(1) * 2) {
                        if node.id == self_id {
                            continue;
                        }
                        outcome.learned.push((node.clone(), from));
                        if seen.insert(node.id) {
                            shortlist.push(node);
                        }
                    }
                }
                Err(e) => {
                    trace!(peer = %contact.id.short(), error = %e, "lookup query failed");
                    outcome.failed.push(contact.id);
                }
            }
        }

        let failed: HashSet<NodeId> = outcome.failed.iter().copied().collect();
        shortlist.retain(|c| !failed.contains(&c.id));
        sort_by_distance(&mut shortlist, &target);
        shortlist.truncate(limits.k);

        if let Some(first) = shortlist.first() {
            let candidate = first.id.xor_distance(&target);
            if distance_cmp(&candidate, &best) == std::cmp::Ordering::Less {
                best = candidate;
                any_closer = true;
            }
        }
        // keep going while closer contacts appear or unqueried ones remain
        if !any_closer && shortlist.iter().all(|c| queried.contains(&c.id)) {
            break;
        }
    }

    debug!(
        target = %target.short(),
        found = shortlist.len(),
        queried = queried.len(),
        "iterative lookup completed"
    );
    outcome.closest = shortlist;
    outcome
}

// ============================================================================
// Local-segment beacon
// ============================================================================

/// Bind a UDP socket joined to the beacon multicast group.
pub async fn bind_multicast(port: u16, group: &str) -> std::io::Result<UdpSocket> {
    let group: Ipv4Addr = group
        .parse()
        .map_err(|e: std::net::AddrParseError| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket)
}

/// Announce `frame` to `dest` every `interval` until aborted.
pub async fn beacon_loop(socket: Arc<UdpSocket>, frame: Vec<u8>, dest: SocketAddr, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if let Err(e) = socket.send_to(&frame, dest).await {
            trace!(error = %e, %dest, "beacon send failed");
        }
    }
}

/// Address to reach a peer that announced `announced` in a datagram sent
/// from `seen`: the source IP with the announced port. Announcements that
/// are not `ip:port` are kept as they are.
pub fn reachable_addr(announced: &str, seen: IpAddr) -> String {
    match announced.parse::<SocketAddr>() {
        Ok(addr) => SocketAddr::new(seen, addr.port()).to_string(),
        Err(_) => announced.to_string(),
    }
}

/// Hand every received datagram to `sink` until it returns `false`.
pub async fn recv_loop<F>(socket: Arc<UdpSocket>, mut sink: F)
where
    F: FnMut(SocketAddr, Vec<u8>) -> bool,
{
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                if !sink(from, buf[..len].to_vec()) {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "beacon receive failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use anyhow::anyhow;
    use async_trait::async_trait;

    /// Registry-backed lookup double: each id answers with a fixed contact list.
    #[derive(Default)]
    struct TestNetwork {
        answers: HashMap<NodeId, Vec<Contact>>,
        failing: HashSet<NodeId>,
        queries: Mutex<Vec<NodeId>>,
    }

    #[async_trait]
    impl DiscoveryRpc for TestNetwork {
        async fn find_node(&self, to: &Contact, _target: NodeId) -> anyhow::Result<Vec<Contact>> {
            self.queries.lock().unwrap().push(to.id);
            if self.failing.contains(&to.id) {
                return Err(anyhow!("injected failure"));
            }
            Ok(self.answers.get(&to.id).cloned().unwrap_or_default())
        }

        async fn ping(&self, to: &Contact) -> anyhow::Result<Contact> {
            Ok(to.clone())
        }
    }

    fn contact(id: NodeId) -> Contact {
        Contact::new(id, format!("10.0.0.{}:4000", id.as_bytes()[0]))
    }

    fn limits() -> LookupLimits {
        LookupLimits {
            k: 20,
            alpha: 3,
            max_iterations: 20,
            query_timeout: Duration::from_millis(500),
            total_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn bootstrap_lookup_learns_seed_neighbours() {
        let (a, b, c, d) = (NodeId::random(), NodeId::random(), NodeId::random(), NodeId::random());
        let mut net = TestNetwork::default();
        net.answers.insert(b, vec![contact(c), contact(d), contact(a)]);
        net.answers.insert(c, vec![contact(b), contact(d)]);
        net.answers.insert(d, vec![contact(b), contact(c)]);

        let outcome = iterative_lookup(Arc::new(net), a, a, vec![contact(b)], limits()).await;

        let found: HashSet<NodeId> = outcome.closest.iter().map(|c| c.id).collect();
        assert_eq!(found, [b, c, d].into_iter().collect());
        let responded: HashSet<NodeId> = outcome.responded.iter().map(|(c, _)| c.id).collect();
        assert_eq!(responded, [b, c, d].into_iter().collect());
        assert!(outcome.learned.iter().all(|(c, _)| c.id != a));
    }

    #[tokio::test]
    async fn results_are_sorted_and_failures_dropped() {
        let me = NodeId::random();
        let target = NodeId::random();
        let seeds: Vec<NodeId> = (0..6).map(|_| NodeId::random()).collect();
        let mut net = TestNetwork::default();
        net.failing.insert(seeds[0]);
        net.failing.insert(seeds[1]);
        let net = Arc::new(net);

        let outcome = iterative_lookup(net.clone(), me, target, seeds.iter().copied().map(contact).collect(), limits()).await;

        assert_eq!(outcome.closest.len(), 4);
        assert!(outcome.closest.iter().all(|c| c.id != seeds[0] && c.id != seeds[1]));
        let distances: Vec<[u8; 32]> = outcome.closest.iter().map(|c| c.id.xor_distance(&target)).collect();
        assert!(distances.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(outcome.failed.len(), 2);
        assert_eq!(net.queries.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn empty_seed_list_finishes_immediately() {
        let outcome = iterative_lookup(Arc::new(TestNetwork::default()), NodeId::random(), NodeId::random(), Vec::new(), limits()).await;
        assert!(outcome.closest.is_empty());
        assert!(outcome.responded.is_empty());
    }

    #[tokio::test]
    async fn beacon_frames_reach_receiver() {
        let listener = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let dest = listener.local_addr().unwrap();
        let sender = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let beacon = tokio::spawn(beacon_loop(sender, b"beacon".to_vec(), dest, Duration::from_millis(20)));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let receiver = tokio::spawn(recv_loop(listener, move |from, bytes| tx.send((from, bytes)).is_ok()));

        for _ in 0..2 {
            let (_, bytes) = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
            assert_eq!(bytes, b"beacon");
        }
        beacon.abort();
        receiver.abort();
    }

    #[test]
    fn beacon_peers_are_reached_at_their_source_ip() {
        let seen: IpAddr = "192.168.1.7".parse().unwrap();
        assert_eq!(reachable_addr("0.0.0.0:4000", seen), "192.168.1.7:4000");
        assert_eq!(reachable_addr("10.9.9.9:4000", seen), "192.168.1.7:4000");
        assert_eq!(reachable_addr("node-b", seen), "node-b");
        let v6: IpAddr = "fe80::1".parse().unwrap();
        assert_eq!(reachable_addr("[::]:4000", v6), "[fe80::1]:4000");
    }
}
