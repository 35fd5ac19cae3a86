//! # Overlay Node
//!
//! [`Node`] is the public handle; `NodeActor` owns every piece of mutable
//! state (routing table, router, delivery tracker, group engine, failure
//! detector, pending calls) and processes one input at a time:
//!
//! - commands from [`Node`] handles,
//! - datagrams from the transport,
//! - internal events posted by spawned work (timers, lookups, probes, sends),
//! - periodic ticks (heartbeat, bucket refresh, route adverts, maintenance).
//!
//! Nothing inside the actor awaits network I/O. Lookups, liveness probes
//! and bootstrap pings run in spawned tasks and post their results back as
//! events; outbound datagrams go through a send pump. Every such task is
//! bounded by a timeout.
//!
//! A peer enters the routing table only after answering a fresh challenge:
//! every ping and find-node carries one, and the answer is checked with
//! [`Security::authenticate`] before the call completes. Traffic from an
//! unknown peer starts such a ping; the peer is admitted when it answers.
//!
//! Refresh ticks advance a refresh epoch. Lookup results carry the epoch
//! they started in and are discarded (the caller sees
//! [`OverlayError::LookupCancelled`]) when it has moved on.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::Context;
use lru::LruCache;
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::delivery::{Armed, DeliveryTracker, TimerOutcome};
use crate::discovery::{
    beacon_loop, bind_multicast, iterative_lookup, reachable_addr, recv_loop, LookupLimits, LookupOutcome,
};
use crate::error::{OverlayError, Result};
use crate::failure::FailureDetector;
use crate::group::{GroupEngine, GroupEvent, GroupId, GroupPolicy, Role};
use crate::identity::{now_ms, Capability, Contact, Keypair, NodeId};
use crate::messages::{
    serialize, Challenge, ChatBody, ControlBody, DiscoveryBody, Envelope, GroupBody, MessageId, MessageKind, Payload, RoutingBody,
    Target, MAX_CONTACTS_PER_RESPONSE,
};
use crate::protocols::{Application, DiscoveryRpc, Security, Transport};
use crate::router::{BufferOutcome, Destination, Forwarding, RouteAdvert, Router};
use crate::rpc::{CallKind, CallReply, CallRequest, OverlayRpc, PendingCalls};
use crate::security::SigningSecurity;
use crate::table::{InsertionLimiter, PendingReplacement, ProbeResolution, RoutingTable, TouchOutcome};
use crate::transport::Inbound;

/// Depth of the command queue between handles and the actor.
const COMMAND_QUEUE_DEPTH: usize = 256;

/// Period of route expiry, buffer expiry, call sweeping and dedup expiry.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Reliable message ids remembered for duplicate suppression.
const SEEN_UNICAST_CAPACITY: usize = 4096;

/// Adverts accepted from a single routing message.
const MAX_ADVERTS_PER_MESSAGE: usize = 64;

/// Unknown peers challenged at once.
const MAX_HANDSHAKES: usize = 256;

#[derive(Clone, Debug, Default)]
pub struct TelemetrySnapshot {
    pub contacts: usize,
    pub routes: usize,
    pub pending_deliveries: usize,
    pub buffered: usize,
    pub groups: usize,
    pub down: usize,
    pub suspended: usize,
    pub refresh_epoch: u64,
    pub sent: u64,
    pub received: u64,
    pub rejected: u64,
    pub delivered: u64,
    pub exhausted: u64,
    pub duplicates: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sent: u64,
    received: u64,
    rejected: u64,
    delivered: u64,
    exhausted: u64,
    duplicates: u64,
}

// ============================================================================
// Handle
// ============================================================================

/// Cheap-to-clone handle to a running node.
#[derive(Clone)]
pub struct Node {
    cmd_tx: mpsc::Sender<Command>,
    id: NodeId,
    contact: Contact,
}

enum Command {
    Bootstrap(Vec<String>, oneshot::Sender<Result<usize>>),
    Lookup(NodeId, oneshot::Sender<Result<Vec<Contact>>>),
    Send(NodeId, Vec<u8>, oneshot::Sender<Result<MessageId>>),
    Closest(NodeId, usize, oneshot::Sender<Result<Vec<Contact>>>),
    AddPeer(Contact),
    Receive(String, Vec<u8>),
    Beacon(SocketAddr, Vec<u8>),
    Telemetry(oneshot::Sender<TelemetrySnapshot>),

    // Groups
    CreateGroup(String, Vec<NodeId>, oneshot::Sender<Result<GroupId>>),
    Invite(GroupId, NodeId, oneshot::Sender<Result<()>>),
    RemoveMember(GroupId, NodeId, oneshot::Sender<Result<()>>),
    SetRole(GroupId, NodeId, Role, oneshot::Sender<Result<()>>),
    SetPolicy(GroupId, GroupPolicy, oneshot::Sender<Result<()>>),
    LeaveGroup(GroupId, oneshot::Sender<Result<()>>),
    DissolveGroup(GroupId, oneshot::Sender<Result<()>>),
    SendGroup(GroupId, Vec<u8>, oneshot::Sender<Result<MessageId>>),
    SyncGroup(GroupId, oneshot::Sender<Result<()>>),
    GroupMembers(GroupId, oneshot::Sender<Option<BTreeMap<NodeId, Role>>>),

    Quit,
}

impl Node {
    /// Start a node with the default signing security collaborator.
    pub async fn spawn(
        config: Config,
        keypair: Keypair,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<Inbound>,
        app: Arc<dyn Application>,
    ) -> Result<Node> {
        let id = keypair.node_id();
        let security = Arc::new(SigningSecurity::new(keypair));
        Self::spawn_with_security(config, id, transport, inbound, security, app).await
    }

    /// Start a node with a caller-supplied security collaborator. `id` must
    /// be the identity `security` signs as.
    pub async fn spawn_with_security(
        config: Config,
        id: NodeId,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<Inbound>,
        security: Arc<dyn Security>,
        app: Arc<dyn Application>,
    ) -> Result<Node> {
        config.validate()?;

        let mut contact = Contact::new(id, transport.local_addr());
        if config.beacon.enabled {
            contact.capabilities.insert(Capability::Beacon);
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let pump = tokio::spawn(outbound_pump(transport, outbound_rx, events_tx.clone()));

        let mut actor = NodeActor {
            id,
            contact: contact.clone(),
            table: RoutingTable::new(id, config.k),
            limiter: InsertionLimiter::new(),
            router: Router::new(id, config.advert_ttl, config.max_paths, config.buffer_capacity),
            delivery: DeliveryTracker::new(config.retry_base, config.retry_cap, config.max_retries),
            groups: GroupEngine::new(id, config.tree_fanout, config.dedup_capacity, config.dedup_ttl),
            failure: FailureDetector::new(
                config.heartbeat_interval,
                config.heartbeat_timeout,
                config.missed_heartbeats,
                config.partition_threshold,
                config.partition_window,
            ),
            calls: PendingCalls::new(),
            rpc: Arc::new(OverlayRpc::new(calls_tx, config.rpc_timeout)),
            limits: LookupLimits::from_config(&config),
            seen_unicast: LruCache::new(NonZeroUsize::new(SEEN_UNICAST_CAPACITY).unwrap_or(NonZeroUsize::MIN)),
            refresh_epoch: 0,
            probing: HashSet::new(),
            looking_up: HashSet::new(),
            authenticating: HashSet::new(),
            counters: Counters::default(),
            background: vec![pump],
            security,
            app,
            outbound: outbound_tx,
            events_tx,
            cmd_rx,
            events_rx,
            calls_rx,
            inbound,
            config,
        };

        if actor.config.beacon.enabled {
            match actor.start_beacon().await {
                Ok(handles) => actor.background.extend(handles),
                Err(e) => warn!(error = %e, "local beacon unavailable"),
            }
        }

        tokio::spawn(actor.run());
        info!(node = %id.short(), addr = %contact.addr, "node started");

        Ok(Node { cmd_tx, id, contact })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(build(tx)).await.map_err(|_| OverlayError::Shutdown)?;
        rx.await.map_err(|_| OverlayError::Shutdown)
    }

    /// Join the overlay through `seeds` (configured seeds when empty).
    /// Returns the number of contacts known afterwards.
    pub async fn bootstrap(&self, seeds: Vec<String>) -> Result<usize> {
        self.request(|tx| Command::Bootstrap(seeds, tx)).await?
    }

    /// Iterative lookup of the k contacts closest to `target`.
    pub async fn lookup(&self, target: NodeId) -> Result<Vec<Contact>> {
        self.request(|tx| Command::Lookup(target, tx)).await?
    }

    /// Reliable direct message. Failure after acceptance is reported through
    /// [`Application::on_delivery_failed`].
    pub async fn send(&self, target: NodeId, plaintext: Vec<u8>) -> Result<MessageId> {
        self.request(|tx| Command::Send(target, plaintext, tx)).await?
    }

    pub async fn closest(&self, target: NodeId, n: usize) -> Result<Vec<Contact>> {
        self.request(|tx| Command::Closest(target, n, tx)).await?
    }

    /// Challenge a known peer; it is admitted once it answers. The challenge
    /// also introduces us to it.
    pub async fn add_peer(&self, contact: Contact) -> Result<()> {
        self.cmd_tx
            .send(Command::AddPeer(contact))
            .await
            .map_err(|_| OverlayError::Shutdown)
    }

    /// Feed a datagram received outside the node's own transport.
    pub async fn on_receive(&self, from: String, bytes: Vec<u8>) -> Result<()> {
        self.cmd_tx
            .send(Command::Receive(from, bytes))
            .await
            .map_err(|_| OverlayError::Shutdown)
    }

    /// Feed a local beacon frame received from `seen` outside the node's own
    /// beacon socket.
    pub async fn on_beacon(&self, seen: SocketAddr, bytes: Vec<u8>) -> Result<()> {
        self.cmd_tx
            .send(Command::Beacon(seen, bytes))
            .await
            .map_err(|_| OverlayError::Shutdown)
    }

    pub async fn telemetry(&self) -> Result<TelemetrySnapshot> {
        self.request(Command::Telemetry).await
    }

    pub async fn create_group(&self, name: &str, members: Vec<NodeId>) -> Result<GroupId> {
        let name = name.to_string();
        self.request(|tx| Command::CreateGroup(name, members, tx)).await?
    }

    pub async fn invite(&self, group: GroupId, member: NodeId) -> Result<()> {
        self.request(|tx| Command::Invite(group, member, tx)).await?
    }

    pub async fn remove_member(&self, group: GroupId, member: NodeId) -> Result<()> {
        self.request(|tx| Command::RemoveMember(group, member, tx)).await?
    }

    pub async fn set_role(&self, group: GroupId, member: NodeId, role: Role) -> Result<()> {
        self.request(|tx| Command::SetRole(group, member, role, tx)).await?
    }

    pub async fn set_policy(&self, group: GroupId, policy: GroupPolicy) -> Result<()> {
        self.request(|tx| Command::SetPolicy(group, policy, tx)).await?
    }

    pub async fn leave_group(&self, group: GroupId) -> Result<()> {
        self.request(|tx| Command::LeaveGroup(group, tx)).await?
    }

    pub async fn dissolve_group(&self, group: GroupId) -> Result<()> {
        self.request(|tx| Command::DissolveGroup(group, tx)).await?
    }

    /// Broadcast to the group over its spanning tree. Best effort.
    pub async fn send_group(&self, group: GroupId, plaintext: Vec<u8>) -> Result<MessageId> {
        self.request(|tx| Command::SendGroup(group, plaintext, tx)).await?
    }

    /// Announce our clock to every member so divergent replicas reconcile.
    pub async fn sync_group(&self, group: GroupId) -> Result<()> {
        self.request(|tx| Command::SyncGroup(group, tx)).await?
    }

    pub async fn group_members(&self, group: GroupId) -> Result<Option<BTreeMap<NodeId, Role>>> {
        self.request(|tx| Command::GroupMembers(group, tx)).await
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Actor
// ============================================================================

enum LookupPurpose {
    User(oneshot::Sender<Result<Vec<Contact>>>),
    Bootstrap {
        reached: usize,
        reply: Option<oneshot::Sender<Result<usize>>>,
    },
    Refresh,
    /// Looking for a path to a destination with buffered traffic.
    Route(NodeId),
}

enum Event {
    DeliveryTimer { message_id: MessageId, generation: u64 },
    SendFailed { addr: String, peer: Option<NodeId>, error: OverlayError },
    ProbeResult(PendingReplacement, bool),
    LookupDone { epoch: u64, outcome: LookupOutcome, purpose: LookupPurpose },
    /// Challenge ping to a new contact finished; `answered` holds its
    /// authenticated record.
    Handshake { peer: NodeId, answered: Option<Contact> },
    Beacon(SocketAddr, Vec<u8>),
}

struct Outbound {
    addr: String,
    peer: Option<NodeId>,
    bytes: Vec<u8>,
}

async fn outbound_pump(
    transport: Arc<dyn Transport>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<Event>,
) {
    while let Some(out) = rx.recv().await {
        if let Err(error) = transport.send(&out.addr, out.bytes).await {
            let failed = Event::SendFailed {
                addr: out.addr,
                peer: out.peer,
                error,
            };
            if events.send(failed).is_err() {
                break;
            }
        }
    }
}

struct NodeActor {
    id: NodeId,
    contact: Contact,
    config: Config,
    table: RoutingTable,
    limiter: InsertionLimiter,
    router: Router,
    delivery: DeliveryTracker,
    groups: GroupEngine,
    failure: FailureDetector,
    calls: PendingCalls,
    rpc: Arc<OverlayRpc>,
    limits: LookupLimits,
    seen_unicast: LruCache<MessageId, ()>,
    refresh_epoch: u64,
    /// Oldest contacts with a liveness probe in flight.
    probing: HashSet<NodeId>,
    /// Destinations with a route lookup in flight.
    looking_up: HashSet<NodeId>,
    /// Unknown peers with a challenge ping in flight.
    authenticating: HashSet<NodeId>,
    counters: Counters,
    background: Vec<JoinHandle<()>>,
    security: Arc<dyn Security>,
    app: Arc<dyn Application>,
    outbound: mpsc::UnboundedSender<Outbound>,
    events_tx: mpsc::UnboundedSender<Event>,
    cmd_rx: mpsc::Receiver<Command>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    calls_rx: mpsc::UnboundedReceiver<CallRequest>,
    inbound: mpsc::Receiver<Inbound>,
}

impl NodeActor {
    async fn run(mut self) {
        let now = Instant::now();
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        // the first refresh waits a full period; bootstrap covers startup
        let mut refresh = tokio::time::interval_at(now + self.config.refresh_interval, self.config.refresh_interval);
        let mut adverts = tokio::time::interval(self.config.advert_interval);
        let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);
        for ticker in [&mut heartbeat, &mut refresh, &mut adverts, &mut maintenance] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Quit) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                Some((from, bytes)) = self.inbound.recv() => self.handle_datagram(from, &bytes),
                Some(call) = self.calls_rx.recv() => self.start_call(call),
                _ = heartbeat.tick() => self.on_heartbeat_tick(),
                _ = refresh.tick() => self.on_refresh_tick(),
                _ = adverts.tick() => self.on_advert_tick(),
                _ = maintenance.tick() => self.on_maintenance_tick(),
            }
        }

        for handle in self.background.drain(..) {
            handle.abort();
        }
        info!(node = %self.id.short(), "node stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Bootstrap(seeds, reply) => {
                let seeds = if seeds.is_empty() { self.config.seeds.clone() } else { seeds };
                if seeds.is_empty() {
                    let _ = reply.send(Err(OverlayError::Config("no bootstrap seeds".into())));
                } else {
                    self.start_bootstrap(seeds, Some(reply));
                }
            }
            Command::Lookup(target, reply) => self.spawn_lookup(target, LookupPurpose::User(reply)),
            Command::Send(target, plaintext, reply) => {
                let _ = reply.send(self.send_direct(target, plaintext));
            }
            Command::Closest(target, n, reply) => {
                let _ = reply.send(self.table.closest(&target, n));
            }
            Command::AddPeer(contact) => self.observe(contact, Instant::now()),
            Command::Receive(from, bytes) => self.handle_datagram(from, &bytes),
            Command::Beacon(seen, bytes) => self.handle_beacon(seen, &bytes),
            Command::Telemetry(reply) => {
                let _ = reply.send(self.telemetry());
            }
            Command::CreateGroup(name, members, reply) => {
                let _ = reply.send(self.create_group(&name, &members));
            }
            Command::Invite(group, member, reply) => {
                let _ = reply.send(self.invite_member(group, member));
            }
            Command::RemoveMember(group, member, reply) => {
                let _ = reply.send(self.remove_member(group, member));
            }
            Command::SetRole(group, member, role, reply) => {
                let result = self
                    .groups
                    .set_role(&group, member, role, now_ms())
                    .and_then(|event| self.publish_change(group, event));
                let _ = reply.send(result);
            }
            Command::SetPolicy(group, policy, reply) => {
                let result = self
                    .groups
                    .set_policy(&group, policy, now_ms())
                    .and_then(|event| self.publish_change(group, event));
                let _ = reply.send(result);
            }
            Command::LeaveGroup(group, reply) => {
                let _ = reply.send(self.leave_group(group));
            }
            Command::DissolveGroup(group, reply) => {
                let _ = reply.send(self.dissolve_group(group));
            }
            Command::SendGroup(group, plaintext, reply) => {
                let _ = reply.send(self.send_group(group, plaintext));
            }
            Command::SyncGroup(group, reply) => {
                let _ = reply.send(self.sync_group(group));
            }
            Command::GroupMembers(group, reply) => {
                let _ = reply.send(self.groups.get(&group).map(|g| g.members()));
            }
            Command::Quit => {}
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::DeliveryTimer { message_id, generation } => self.on_delivery_timer(message_id, generation),
            Event::SendFailed { addr, peer, error } => {
                debug!(%addr, error = %error, "send failed");
                if let Some(peer) = peer {
                    self.router.record_outcome(peer, false, None);
                }
            }
            Event::ProbeResult(pending, alive) => self.on_probe_result(pending, alive),
            Event::LookupDone { epoch, outcome, purpose } => self.on_lookup_done(epoch, outcome, purpose),
            Event::Handshake { peer, answered } => self.on_handshake(peer, answered),
            Event::Beacon(seen, bytes) => self.handle_beacon(seen, &bytes),
        }
    }

    fn telemetry(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            contacts: self.table.len(),
            routes: self.router.route_count(),
            pending_deliveries: self.delivery.len(),
            buffered: self.router.buffered_count(),
            groups: self.groups.len(),
            down: self.failure.down_count(),
            suspended: self.failure.suspended().len(),
            refresh_epoch: self.refresh_epoch,
            sent: self.counters.sent,
            received: self.counters.received,
            rejected: self.counters.rejected,
            delivered: self.counters.delivered,
            exhausted: self.counters.exhausted,
            duplicates: self.counters.duplicates,
        }
    }

    fn self_contact(&self) -> Contact {
        let mut contact = self.contact.clone();
        contact.last_seen = now_ms();
        contact
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    fn seal<B: Serialize>(&self, kind: MessageKind, target: Target, ttl: u8, body: &B) -> Result<Envelope> {
        let payload = Payload {
            encrypted: kind == MessageKind::Chat && self.security.confidential(),
            bytes: serialize(body)?,
        };
        let mut envelope = Envelope::new(kind, self.id, target, now_ms(), ttl, payload);
        envelope.header.signature = self.security.sign(&envelope.signing_bytes()?)?;
        Ok(envelope)
    }

    fn transmit(&mut self, addr: &str, peer: Option<NodeId>, envelope: &Envelope) {
        match envelope.encode() {
            Ok(bytes) => {
                self.counters.sent += 1;
                let _ = self.outbound.send(Outbound {
                    addr: addr.to_string(),
                    peer,
                    bytes,
                });
            }
            Err(e) => warn!(error = %e, "dropping unencodable envelope"),
        }
    }

    /// Seal a neighbour-scoped message and send it to `addr`.
    fn send_hop<B: Serialize>(&mut self, to: NodeId, addr: &str, kind: MessageKind, body: &B) {
        match self.seal(kind, Target::Node(to), 1, body) {
            Ok(envelope) => self.transmit(addr, Some(to), &envelope),
            Err(e) => debug!(error = %e, "failed to seal message"),
        }
    }

    fn dispatch_toward(&mut self, target: NodeId, envelope: Envelope) {
        match self.router.decide(Destination::Node(target), &self.table) {
            Forwarding::Direct(contact) | Forwarding::Forward(contact) => {
                self.transmit(&contact.addr, Some(contact.id), &envelope);
            }
            // a failed lookup is retried by the next retransmission
            Forwarding::Buffer => match self.router.buffer(target, envelope, Instant::now()) {
                BufferOutcome::Queued { .. } => self.lookup_route(target),
                BufferOutcome::Full => debug!(target = %target.short(), "route buffer full; message dropped"),
            },
            Forwarding::Multicast(_) => {}
        }
    }

    fn flush_buffered(&mut self, target: NodeId) {
        let waiting = self.router.take_buffered(&target);
        if waiting.is_empty() {
            return;
        }
        debug!(target = %target.short(), count = waiting.len(), "path found; flushing buffered messages");
        for envelope in waiting {
            self.dispatch_toward(target, envelope);
        }
    }

    fn send_reliable<B: Serialize>(&mut self, target: NodeId, kind: MessageKind, body: &B) -> Result<MessageId> {
        let envelope = self.seal(kind, Target::Node(target), self.config.message_ttl, body)?;
        let message_id = envelope.id();
        let armed = self.delivery.register(target, envelope.clone(), Instant::now());
        self.arm(armed);
        self.dispatch_toward(target, envelope);
        Ok(message_id)
    }

    fn arm(&self, armed: Armed) {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(armed.delay).await;
            let _ = events.send(Event::DeliveryTimer {
                message_id: armed.message_id,
                generation: armed.generation,
            });
        });
    }

    fn on_delivery_timer(&mut self, message_id: MessageId, generation: u64) {
        match self.delivery.on_timer(&message_id, generation, Instant::now()) {
            TimerOutcome::Retransmit { target, envelope, armed } => {
                trace!(message = %message_id, target = %target.short(), "retransmitting");
                self.arm(armed);
                self.dispatch_toward(target, envelope);
            }
            TimerOutcome::Exhausted { message_id, target, retries } => {
                self.router.drop_buffered(&message_id);
                if self.table.contains(&target) {
                    self.router.record_outcome(target, false, None);
                }
                self.counters.exhausted += 1;
                warn!(message = %message_id, target = %target.short(), retries, "delivery exhausted");
                self.app
                    .on_delivery_failed(message_id, OverlayError::DeliveryExhausted { message_id, retries });
            }
            TimerOutcome::Ignored => {}
        }
    }

    fn send_ack(&mut self, to: NodeId, message_id: MessageId) {
        match self.seal(MessageKind::Control, Target::Node(to), self.config.message_ttl, &ControlBody::Ack { message_id }) {
            Ok(ack) => self.dispatch_toward(to, ack),
            Err(e) => debug!(error = %e, "failed to seal ack"),
        }
    }

    fn send_direct(&mut self, target: NodeId, plaintext: Vec<u8>) -> Result<MessageId> {
        if target == self.id {
            return Err(OverlayError::NotPermitted("cannot send to self".into()));
        }
        let key = self.security.pairwise_key(&target)?;
        let ciphertext = self.security.encrypt(&plaintext, &key)?;
        self.send_reliable(target, MessageKind::Chat, &ChatBody::Direct { ciphertext })
    }

    fn broadcast_adverts(&mut self, adverts: Vec<RouteAdvert>, except: Option<NodeId>) {
        let envelope = match self.seal(MessageKind::Routing, Target::Broadcast, 1, &RoutingBody::Adverts(adverts)) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "failed to seal adverts");
                return;
            }
        };
        let neighbours: Vec<(NodeId, String)> = self
            .table
            .contacts()
            .filter(|c| Some(c.id) != except)
            .map(|c| (c.id, c.addr.clone()))
            .collect();
        for (id, addr) in neighbours {
            self.transmit(&addr, Some(id), &envelope);
        }
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    /// Decode and verify a datagram. `None` for garbage, forgeries and our
    /// own frames.
    fn open(&mut self, bytes: &[u8]) -> Option<Envelope> {
        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                trace!(error = %e, "undecodable datagram");
                self.counters.rejected += 1;
                return None;
            }
        };
        let source = envelope.header.source;
        if source == self.id {
            return None;
        }
        let verified = envelope
            .signing_bytes()
            .and_then(|signed| Ok(self.security.verify(&source, &signed, &envelope.header.signature)?));
        if let Err(e) = verified {
            debug!(source = %source.short(), error = %e, "rejecting envelope");
            self.counters.rejected += 1;
            return None;
        }
        self.counters.received += 1;
        Some(envelope)
    }

    fn handle_datagram(&mut self, from: String, bytes: &[u8]) {
        let Some(envelope) = self.open(bytes) else {
            return;
        };
        let now = Instant::now();
        let neighbour = envelope.routing.path.last().copied().unwrap_or(envelope.header.source);
        self.heard_from(neighbour, &from, now);

        match envelope.header.target {
            Target::Node(target) if target != self.id => self.relay(target, envelope),
            Target::Group(group) => self.handle_group_copy(group, envelope, now),
            _ => self.handle_local(envelope, &from, now),
        }
    }

    fn heard_from(&mut self, neighbour: NodeId, addr: &str, now: Instant) {
        if self.table.touch(&neighbour, addr, now_ms(), now) {
            self.failure.track(neighbour, now);
        } else {
            let mut contact = Contact::new(neighbour, addr);
            contact.last_seen = now_ms();
            self.observe(contact, now);
        }
        if self.failure.resume(&neighbour) {
            info!(peer = %neighbour.short(), "suspended peer reachable again");
            let set = BTreeSet::from([neighbour]);
            for (group, reachable) in self.groups.affected_by(&set) {
                self.app.on_group_event(group, GroupEvent::Resumed { reachable });
            }
        }
    }

    fn relay(&mut self, target: NodeId, envelope: Envelope) {
        if envelope.routing.path.contains(&self.id) {
            trace!(target = %target.short(), "relay loop; dropping");
            return;
        }
        match envelope.relayed(self.id) {
            Some(next) => self.dispatch_toward(target, next),
            None => trace!(target = %target.short(), "hop budget spent; dropping"),
        }
    }

    fn handle_local(&mut self, envelope: Envelope, from: &str, now: Instant) {
        match envelope.header.kind {
            MessageKind::Discovery => self.handle_discovery(&envelope, from),
            MessageKind::Routing => self.handle_routing(&envelope, now),
            MessageKind::Control => self.handle_control(&envelope, from, now),
            MessageKind::Chat | MessageKind::Group => {
                if envelope.header.target == Target::Node(self.id) {
                    self.handle_reliable(&envelope);
                }
            }
        }
    }

    fn handle_discovery(&mut self, envelope: &Envelope, from: &str) {
        let body: DiscoveryBody = match envelope.body() {
            Ok(body) => body,
            Err(e) => {
                debug!(error = %e, "bad discovery body");
                return;
            }
        };
        let source = envelope.header.source;
        if body.sender().id != source {
            debug!(source = %source.short(), "discovery sender does not match signer");
            return;
        }

        match body {
            DiscoveryBody::Ping { request_id, challenge, .. } => {
                let Some(response) = self.respond(&challenge) else {
                    return;
                };
                let pong = DiscoveryBody::Pong {
                    from: self.self_contact(),
                    request_id,
                    response,
                };
                self.send_hop(source, from, MessageKind::Discovery, &pong);
            }
            DiscoveryBody::FindNode {
                target,
                request_id,
                challenge,
                ..
            } => {
                let Some(response) = self.respond(&challenge) else {
                    return;
                };
                let mut contacts = self.table.closest(&target, self.config.k).unwrap_or_default();
                contacts.truncate(MAX_CONTACTS_PER_RESPONSE);
                let nodes = DiscoveryBody::Nodes {
                    from: self.self_contact(),
                    request_id,
                    contacts,
                    response,
                };
                self.send_hop(source, from, MessageKind::Discovery, &nodes);
            }
            DiscoveryBody::Pong {
                from: mut contact,
                request_id,
                response,
            } => {
                contact.addr = from.to_string();
                self.answer_call(request_id, source, &response, CallReply::Pong(contact));
            }
            DiscoveryBody::Nodes {
                request_id,
                contacts,
                response,
                ..
            } => {
                self.answer_call(request_id, source, &response, CallReply::Nodes(contacts));
            }
            DiscoveryBody::Beacon { .. } => {
                trace!(source = %source.short(), "beacon over unicast; ignored");
            }
            DiscoveryBody::BeaconReply { from: mut contact } => {
                // announced address may be a wildcard bind; the reply came from the real one
                contact.addr = from.to_string();
                contact.last_seen = now_ms();
                self.observe(contact, Instant::now());
            }
        }
    }

    fn respond(&self, challenge: &Challenge) -> Option<Vec<u8>> {
        match self.security.respond(challenge) {
            Ok(response) => Some(response),
            Err(e) => {
                debug!(error = %e, "cannot answer challenge");
                None
            }
        }
    }

    /// Complete a call once the responder has proven its identity.
    fn answer_call(&mut self, request_id: u64, source: NodeId, response: &[u8], reply: CallReply) {
        let Some(challenge) = self.calls.challenge(request_id, &source) else {
            trace!(request_id, source = %source.short(), "answer to no pending call");
            return;
        };
        let authentic = match self.security.authenticate(&source, &challenge, response) {
            Ok(authentic) => authentic,
            Err(e) => {
                debug!(source = %source.short(), error = %e, "authentication failed");
                false
            }
        };
        if authentic {
            self.calls.complete(request_id, &source, reply);
        } else {
            debug!(source = %source.short(), "challenge response rejected");
            self.counters.rejected += 1;
            self.calls.abandon(request_id);
        }
    }

    /// Local beacon frame received from `seen`.
    fn handle_beacon(&mut self, seen: SocketAddr, bytes: &[u8]) {
        let Some(envelope) = self.open(bytes) else {
            return;
        };
        let source = envelope.header.source;
        let mut contact = match envelope.body::<DiscoveryBody>() {
            Ok(DiscoveryBody::Beacon { from }) if from.id == source => from,
            Ok(_) => {
                trace!(source = %source.short(), "unexpected frame on the beacon socket");
                return;
            }
            Err(e) => {
                debug!(error = %e, "bad beacon body");
                return;
            }
        };
        contact.addr = reachable_addr(&contact.addr, seen.ip());
        contact.last_seen = now_ms();
        if !self.table.contains(&source) {
            debug!(peer = %source.short(), addr = %contact.addr, "peer found by beacon");
            let reply = DiscoveryBody::BeaconReply { from: self.self_contact() };
            let addr = contact.addr.clone();
            self.send_hop(source, &addr, MessageKind::Discovery, &reply);
        }
        self.observe(contact, Instant::now());
    }

    fn handle_routing(&mut self, envelope: &Envelope, now: Instant) {
        let RoutingBody::Adverts(adverts) = match envelope.body() {
            Ok(body) => body,
            Err(e) => {
                debug!(error = %e, "bad routing body");
                return;
            }
        };
        let from = envelope.header.source;
        let mut echoes = Vec::new();
        for advert in adverts.iter().take(MAX_ADVERTS_PER_MESSAGE) {
            match self.router.apply_advert(from, advert, now) {
                Ok(echo) => {
                    echoes.extend(echo);
                    self.flush_buffered(advert.destination);
                }
                Err(e) => trace!(destination = %advert.destination.short(), error = %e, "advert not applied"),
            }
        }
        if !echoes.is_empty() {
            self.broadcast_adverts(echoes, Some(from));
        }
    }

    fn handle_control(&mut self, envelope: &Envelope, from: &str, now: Instant) {
        let body: ControlBody = match envelope.body() {
            Ok(body) => body,
            Err(e) => {
                debug!(error = %e, "bad control body");
                return;
            }
        };
        let source = envelope.header.source;
        match body {
            ControlBody::Ack { message_id } => {
                if !self.delivery.get(&message_id).is_some_and(|p| p.target == source) {
                    return;
                }
                if let Some(delivered) = self.delivery.on_ack(&message_id, now) {
                    self.counters.delivered += 1;
                    if self.table.contains(&delivered.target) {
                        let rtt = (delivered.retries == 0).then_some(delivered.elapsed);
                        self.router.record_outcome(delivered.target, true, rtt);
                    }
                    trace!(message = %message_id, retries = delivered.retries, "delivered");
                }
            }
            ControlBody::Heartbeat { nonce } => {
                self.send_hop(source, from, MessageKind::Control, &ControlBody::HeartbeatAck { nonce });
            }
            ControlBody::HeartbeatAck { nonce } => {
                self.failure.on_ack(&source, nonce);
            }
        }
    }

    /// Chat and group-control unicasts addressed to us. Acked once handled;
    /// duplicates are acked again but not handled twice.
    fn handle_reliable(&mut self, envelope: &Envelope) {
        let source = envelope.header.source;
        let message_id = envelope.id();
        if self.seen_unicast.contains(&message_id) {
            self.counters.duplicates += 1;
            self.send_ack(source, message_id);
            return;
        }
        let handled = match envelope.header.kind {
            MessageKind::Chat => self.accept_chat(envelope),
            _ => self.accept_group_control(envelope),
        };
        match handled {
            Ok(()) => {
                self.seen_unicast.put(message_id, ());
                self.send_ack(source, message_id);
            }
            Err(e) => debug!(source = %source.short(), error = %e, "discarding message"),
        }
    }

    fn accept_chat(&mut self, envelope: &Envelope) -> Result<()> {
        let source = envelope.header.source;
        match envelope.body::<ChatBody>()? {
            ChatBody::Direct { ciphertext } => {
                let key = self.security.pairwise_key(&source)?;
                let plaintext = self.security.decrypt(&ciphertext, &key)?;
                self.app.on_message_delivered(source, plaintext);
                Ok(())
            }
            ChatBody::Group { .. } => Err(OverlayError::Codec("group chat addressed to a node".into())),
        }
    }

    fn accept_group_control(&mut self, envelope: &Envelope) -> Result<()> {
        let source = envelope.header.source;
        match envelope.body::<GroupBody>()? {
            GroupBody::Invite {
                group_id,
                name,
                owner,
                sealed_key,
                updates,
                clock,
                ..
            } => {
                let key = self.security.open_key(&source, &sealed_key)?;
                let events = self.groups.accept_invite(source, group_id, name, owner, key, updates, &clock);
                self.emit(group_id, events);
            }
            GroupBody::SyncRequest { group_id, clock } => {
                for reply in self.groups.on_sync_request(source, &group_id, &clock)? {
                    self.send_reliable(reply.to, MessageKind::Group, &reply.body)?;
                }
            }
            GroupBody::SyncDelta { group_id, updates, clock } => {
                let (events, resolved) = self.groups.on_sync_delta(source, &group_id, updates, &clock)?;
                self.emit(group_id, events);
                if resolved {
                    let others: Vec<NodeId> = self.groups.peers(&group_id)?.into_iter().filter(|p| *p != source).collect();
                    self.announce_group(&group_id, others)?;
                }
            }
        }
        Ok(())
    }

    fn handle_group_copy(&mut self, group_id: GroupId, envelope: Envelope, now: Instant) {
        if let Some(next_hop) = envelope.routing.next_hop
            && next_hop != self.id
        {
            self.relay(next_hop, envelope);
            return;
        }
        if envelope.header.kind != MessageKind::Chat {
            return;
        }
        let source = envelope.header.source;
        let Some(group) = self.groups.get(&group_id) else {
            trace!(group = %group_id, "copy for a group we do not hold");
            return;
        };
        if group.role_of(&source).is_none() {
            debug!(group = %group_id, source = %source.short(), "group message from non-member");
            return;
        }
        let key = group.key.clone();
        if !self.groups.first_sighting(group_id, envelope.id(), now) {
            self.counters.duplicates += 1;
            return;
        }

        self.fan_out(group_id, &envelope, source);

        let plaintext = match envelope.body::<ChatBody>() {
            Ok(ChatBody::Group { ciphertext }) => self.security.decrypt(&ciphertext, &key),
            Ok(ChatBody::Direct { .. }) => return,
            Err(e) => {
                debug!(error = %e, "bad group chat body");
                return;
            }
        };
        match plaintext {
            Ok(plaintext) => self.app.on_group_event(group_id, GroupEvent::Message { sender: source, plaintext }),
            Err(e) => debug!(group = %group_id, error = %e, "undecryptable group message"),
        }
    }

    /// Forward a group copy to our children in the tree rooted at `root`.
    fn fan_out(&mut self, group_id: GroupId, envelope: &Envelope, root: NodeId) {
        let children = match self.groups.children(&group_id, root, &self.failure.down()) {
            Ok(children) => children,
            Err(e) => {
                trace!(error = %e, "no broadcast tree");
                return;
            }
        };
        let Forwarding::Multicast(children) = self.router.decide(Destination::Group { children }, &self.table) else {
            return;
        };
        for child in children {
            let copy = if root == self.id {
                Some(envelope.clone())
            } else {
                envelope.relayed(self.id)
            };
            if let Some(mut copy) = copy {
                copy.routing.next_hop = Some(child);
                self.dispatch_toward(child, copy);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Routing table maintenance
    // ------------------------------------------------------------------------

    /// A sighting of `contact`. Known contacts are refreshed; unknown ones
    /// are challenged first.
    fn observe(&mut self, contact: Contact, now: Instant) {
        if self.table.contains(&contact.id) {
            self.admit(contact, now);
        } else {
            self.challenge(contact);
        }
    }

    /// Insert or refresh an authenticated contact.
    fn admit(&mut self, contact: Contact, now: Instant) {
        let id = contact.id;
        match self.table.update(contact, now) {
            TouchOutcome::Ignored => {}
            TouchOutcome::Inserted => {
                debug!(peer = %id.short(), contacts = self.table.len(), "contact added");
                self.failure.track(id, now);
                self.flush_buffered(id);
            }
            TouchOutcome::Refreshed => self.failure.track(id, now),
            TouchOutcome::Full(pending) => self.probe_oldest(pending),
        }
    }

    /// Ping an unknown peer; its answer is authenticated before the ping
    /// completes.
    fn challenge(&mut self, contact: Contact) {
        let peer = contact.id;
        if peer == self.id || self.authenticating.contains(&peer) {
            return;
        }
        if self.authenticating.len() >= MAX_HANDSHAKES {
            trace!(peer = %peer.short(), "too many handshakes in flight");
            return;
        }
        self.authenticating.insert(peer);
        trace!(peer = %peer.short(), addr = %contact.addr, "challenging new contact");
        let rpc = self.rpc.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let answered = match rpc.ping(&contact).await {
                Ok(answered) => Some(answered),
                Err(e) => {
                    debug!(peer = %peer.short(), error = %e, "new contact did not authenticate");
                    None
                }
            };
            let _ = events.send(Event::Handshake { peer, answered });
        });
    }

    fn on_handshake(&mut self, peer: NodeId, answered: Option<Contact>) {
        self.authenticating.remove(&peer);
        if let Some(mut contact) = answered {
            contact.last_seen = now_ms();
            self.admit(contact, Instant::now());
        }
    }

    fn probe_oldest(&mut self, pending: PendingReplacement) {
        if !self.probing.insert(pending.oldest.id) {
            return;
        }
        let rpc = self.rpc.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let alive = rpc.ping(&pending.oldest).await.is_ok();
            let _ = events.send(Event::ProbeResult(pending, alive));
        });
    }

    fn on_probe_result(&mut self, pending: PendingReplacement, alive: bool) {
        self.probing.remove(&pending.oldest.id);
        let candidate = pending.candidate.id;
        match self.table.apply_probe_result(pending, alive) {
            ProbeResolution::Kept | ProbeResolution::Unchanged => {}
            ProbeResolution::Replaced { evicted } => {
                debug!(evicted = %evicted.id.short(), replacement = %candidate.short(), "stale contact replaced");
                self.forget_contact(&evicted.id);
                self.failure.track(candidate, Instant::now());
                self.flush_buffered(candidate);
            }
            ProbeResolution::Evicted { evicted } => self.forget_contact(&evicted.id),
        }
    }

    fn forget_contact(&mut self, id: &NodeId) {
        self.failure.untrack(id);
        for destination in self.router.invalidate_next_hop(id) {
            if destination != *id {
                self.lookup_route(destination);
            }
        }
    }

    fn start_call(&mut self, call: CallRequest) {
        let CallRequest {
            addr,
            expected,
            kind,
            reply,
        } = call;
        let deadline = Instant::now() + self.config.rpc_timeout;
        let Some((request_id, challenge)) = self.calls.register(expected, reply, deadline) else {
            debug!("too many outstanding calls; dropping");
            return;
        };
        let from = self.self_contact();
        let body = match kind {
            CallKind::Ping => DiscoveryBody::Ping {
                from,
                request_id,
                challenge,
            },
            CallKind::FindNode(target) => DiscoveryBody::FindNode {
                from,
                target,
                request_id,
                challenge,
            },
        };
        let target = expected.map_or(Target::Broadcast, Target::Node);
        match self.seal(MessageKind::Discovery, target, 1, &body) {
            Ok(envelope) => self.transmit(&addr, expected, &envelope),
            Err(e) => debug!(error = %e, "failed to seal call"),
        }
    }

    // ------------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------------

    fn spawn_lookup(&mut self, target: NodeId, purpose: LookupPurpose) {
        let seeds = match self.table.closest(&target, self.config.k) {
            Ok(seeds) => seeds,
            Err(e) => {
                self.fail_lookup(purpose, e);
                return;
            }
        };
        let rpc = self.rpc.clone();
        let events = self.events_tx.clone();
        let (id, limits, epoch) = (self.id, self.limits, self.refresh_epoch);
        tokio::spawn(async move {
            let outcome = iterative_lookup(rpc, id, target, seeds, limits).await;
            let _ = events.send(Event::LookupDone { epoch, outcome, purpose });
        });
    }

    fn lookup_route(&mut self, target: NodeId) {
        if target == self.id || !self.looking_up.insert(target) {
            return;
        }
        trace!(target = %target.short(), "looking up route");
        self.spawn_lookup(target, LookupPurpose::Route(target));
    }

    fn start_bootstrap(&mut self, seeds: Vec<String>, reply: Option<oneshot::Sender<Result<usize>>>) {
        let rpc = self.rpc.clone();
        let events = self.events_tx.clone();
        let (id, limits, epoch) = (self.id, self.limits, self.refresh_epoch);
        let known = self.table.closest(&id, self.config.k).unwrap_or_default();
        info!(seeds = seeds.len(), "bootstrapping");
        tokio::spawn(async move {
            let mut pings = JoinSet::new();
            for addr in seeds {
                let rpc = rpc.clone();
                pings.spawn(async move {
                    let result = rpc.ping_addr(&addr).await;
                    (addr, result)
                });
            }
            let mut reached = Vec::new();
            while let Some(joined) = pings.join_next().await {
                match joined {
                    Ok((_, Ok(contact))) => reached.push(contact),
                    Ok((addr, Err(e))) => debug!(%addr, error = %e, "seed did not answer"),
                    Err(e) => debug!(error = %e, "seed ping task failed"),
                }
            }
            let count = reached.len();
            let outcome = if reached.is_empty() {
                LookupOutcome::default()
            } else {
                let mut seeds = known;
                seeds.extend(reached);
                iterative_lookup(rpc, id, id, seeds, limits).await
            };
            let purpose = LookupPurpose::Bootstrap { reached: count, reply };
            let _ = events.send(Event::LookupDone { epoch, outcome, purpose });
        });
    }

    fn fail_lookup(&mut self, purpose: LookupPurpose, error: OverlayError) {
        match purpose {
            LookupPurpose::User(reply) => {
                let _ = reply.send(Err(error));
            }
            LookupPurpose::Bootstrap { reply, .. } => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(error));
                }
            }
            LookupPurpose::Refresh => {}
            LookupPurpose::Route(target) => {
                self.looking_up.remove(&target);
            }
        }
    }

    fn on_lookup_done(&mut self, epoch: u64, outcome: LookupOutcome, purpose: LookupPurpose) {
        if epoch != self.refresh_epoch {
            debug!(epoch, current = self.refresh_epoch, "discarding lookup from an earlier refresh epoch");
            self.fail_lookup(purpose, OverlayError::LookupCancelled);
            return;
        }
        let now = Instant::now();
        let LookupOutcome {
            closest,
            responded,
            learned,
            failed,
        } = outcome;
        // responders answered an authenticated call
        for (contact, rtt) in responded {
            self.router.record_outcome(contact.id, true, Some(rtt));
            self.admit(contact, now);
        }
        for (contact, from) in learned {
            if contact.id == self.id || self.table.contains(&contact.id) {
                continue;
            }
            if self.limiter.allow(&from, now) {
                self.observe(contact, now);
            } else {
                trace!(from = %from.short(), "insertion limit reached");
            }
        }
        for id in failed {
            self.router.record_outcome(id, false, None);
        }

        match purpose {
            LookupPurpose::User(reply) => {
                let _ = reply.send(Ok(closest));
            }
            LookupPurpose::Bootstrap { reached, reply } => {
                let result = if reached == 0 {
                    warn!("no bootstrap seed answered");
                    Err(OverlayError::Unreachable("no bootstrap seed answered".into()))
                } else {
                    info!(contacts = self.table.len(), "bootstrap complete");
                    Ok(self.table.len())
                };
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            LookupPurpose::Refresh => {}
            LookupPurpose::Route(target) => {
                self.looking_up.remove(&target);
                if self.table.contains(&target) || self.router.route(&target).is_some() {
                    self.flush_buffered(target);
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Periodic work
    // ------------------------------------------------------------------------

    fn on_heartbeat_tick(&mut self) {
        let now = Instant::now();
        let outcome = self.failure.tick(now);
        for peer in outcome.dead {
            self.declare_dead(peer, now);
        }
        for probe in outcome.probes {
            let Some(addr) = self.table.get(&probe.peer).map(|c| c.addr.clone()) else {
                self.failure.untrack(&probe.peer);
                continue;
            };
            self.send_hop(probe.peer, &addr, MessageKind::Control, &ControlBody::Heartbeat { nonce: probe.nonce });
        }
    }

    fn declare_dead(&mut self, peer: NodeId, now: Instant) {
        let was_contact = self.table.remove(&peer).is_some();
        let orphaned = self.router.invalidate_next_hop(&peer);
        info!(peer = %peer.short(), was_contact, orphaned = orphaned.len(), "peer unreachable; evicted");

        if let Some(suspended) = self.failure.record_death(peer, now) {
            let set: BTreeSet<NodeId> = suspended.into_iter().collect();
            let partition = OverlayError::PartitionDetected { unreachable: set.len() };
            warn!(error = %partition, "suspending group members");
            for (group, unreachable) in self.groups.affected_by(&set) {
                self.app.on_group_event(group, GroupEvent::Partitioned { unreachable });
            }
        }
        for destination in orphaned {
            if destination != peer {
                self.lookup_route(destination);
            }
        }
    }

    fn on_refresh_tick(&mut self) {
        self.refresh_epoch += 1;
        let now = Instant::now();
        if self.table.is_empty() {
            if !self.config.seeds.is_empty() {
                debug!("routing table empty; bootstrapping again");
                self.start_bootstrap(self.config.seeds.clone(), None);
            }
            return;
        }
        let mut buckets: Vec<usize> = self.table.stale_buckets(self.config.refresh_interval, now);
        for bucket in self.table.underpopulated_buckets() {
            if !buckets.contains(&bucket) {
                buckets.push(bucket);
            }
        }
        buckets.shuffle(&mut rand::thread_rng());
        buckets.truncate(self.config.refresh_fanout);
        trace!(epoch = self.refresh_epoch, buckets = buckets.len(), "refreshing buckets");
        for bucket in buckets {
            let target = self.table.random_id_for_bucket(bucket);
            self.table.mark_bucket_refreshed(bucket, now);
            self.spawn_lookup(target, LookupPurpose::Refresh);
        }
    }

    fn on_advert_tick(&mut self) {
        if self.table.is_empty() {
            return;
        }
        let own = self.router.originate();
        self.broadcast_adverts(vec![own], None);
    }

    fn on_maintenance_tick(&mut self) {
        let now = Instant::now();
        let expired = self.router.expire(now, self.config.route_staleness);
        if !expired.is_empty() {
            trace!(count = expired.len(), "routes expired");
        }
        let dropped = self.router.expire_buffer(now, self.config.buffer_timeout);
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "buffered messages timed out waiting for a route");
        }
        self.calls.sweep(now);
        self.groups.expire_dedup(now);
        let forgotten = self.failure.expire_down(now);
        if forgotten > 0 {
            trace!(count = forgotten, "dead peers forgotten");
        }
        for target in self.router.buffered_targets() {
            if self.table.contains(&target) || self.router.route(&target).is_some() {
                self.flush_buffered(target);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------------

    fn emit(&self, group: GroupId, events: Vec<GroupEvent>) {
        for event in events {
            self.app.on_group_event(group, event);
        }
    }

    /// Push our full replica state to `recipients`.
    fn announce_group(&mut self, group: &GroupId, recipients: Vec<NodeId>) -> Result<()> {
        let body = self.groups.announce(group)?;
        for peer in recipients {
            self.send_reliable(peer, MessageKind::Group, &body)?;
        }
        Ok(())
    }

    fn publish_change(&mut self, group: GroupId, event: GroupEvent) -> Result<()> {
        self.app.on_group_event(group, event);
        let peers = self.groups.peers(&group)?;
        self.announce_group(&group, peers)
    }

    fn send_invite(&mut self, group: &GroupId, member: NodeId) -> Result<()> {
        let key = self.groups.get(group).ok_or(OverlayError::UnknownGroup(*group))?.key.clone();
        let sealed = self.security.seal_key_for(&member, &key)?;
        let body = self.groups.invite_body(group, &member, sealed)?;
        self.send_reliable(member, MessageKind::Group, &body)?;
        Ok(())
    }

    fn create_group(&mut self, name: &str, members: &[NodeId]) -> Result<GroupId> {
        let key = self.security.generate_group_key()?;
        let group = self.groups.create(name, key, members, now_ms());
        self.app.on_group_event(group, GroupEvent::Created);
        for member in self.groups.peers(&group)? {
            self.send_invite(&group, member)?;
        }
        Ok(group)
    }

    fn invite_member(&mut self, group: GroupId, member: NodeId) -> Result<()> {
        let event = self.groups.invite(&group, member, now_ms())?;
        self.app.on_group_event(group, event);
        self.send_invite(&group, member)?;
        let others: Vec<NodeId> = self.groups.peers(&group)?.into_iter().filter(|p| *p != member).collect();
        self.announce_group(&group, others)
    }

    fn remove_member(&mut self, group: GroupId, member: NodeId) -> Result<()> {
        let event = self.groups.remove_member(&group, member, now_ms())?;
        self.app.on_group_event(group, event);
        let mut recipients = self.groups.peers(&group)?;
        recipients.push(member);
        self.announce_group(&group, recipients)
    }

    fn leave_group(&mut self, group: GroupId) -> Result<()> {
        let (notify, body) = self.groups.leave(&group, now_ms())?;
        self.app.on_group_event(group, GroupEvent::MemberRemoved { member: self.id });
        let self_id = self.id;
        for peer in notify.into_iter().filter(|p| *p != self_id) {
            self.send_reliable(peer, MessageKind::Group, &body)?;
        }
        Ok(())
    }

    fn dissolve_group(&mut self, group: GroupId) -> Result<()> {
        let event = self.groups.dissolve(&group, now_ms())?;
        self.app.on_group_event(group, event);
        let peers = self.groups.peers(&group)?;
        let announced = self.announce_group(&group, peers);
        self.groups.forget(&group);
        announced
    }

    fn sync_group(&mut self, group: GroupId) -> Result<()> {
        let body = self.groups.sync_request(&group)?;
        for peer in self.groups.peers(&group)? {
            self.send_reliable(peer, MessageKind::Group, &body)?;
        }
        Ok(())
    }

    fn send_group(&mut self, group_id: GroupId, plaintext: Vec<u8>) -> Result<MessageId> {
        let group = self.groups.get(&group_id).ok_or(OverlayError::UnknownGroup(group_id))?;
        if group.role_of(&self.id).is_none() {
            return Err(OverlayError::NotPermitted("not a member".into()));
        }
        let ciphertext = self.security.encrypt(&plaintext, &group.key)?;
        let envelope = self.seal(
            MessageKind::Chat,
            Target::Group(group_id),
            self.config.message_ttl,
            &ChatBody::Group { ciphertext },
        )?;
        let message_id = envelope.id();
        self.groups.first_sighting(group_id, message_id, Instant::now());
        self.fan_out(group_id, &envelope, self.id);
        Ok(message_id)
    }

    // ------------------------------------------------------------------------
    // Beacon
    // ------------------------------------------------------------------------

    async fn start_beacon(&self) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let beacon = &self.config.beacon;
        let group: Ipv4Addr = beacon.group.parse().context("parsing beacon group address")?;
        let socket = Arc::new(
            bind_multicast(beacon.port, &beacon.group)
                .await
                .context("binding beacon socket")?,
        );
        let dest = SocketAddr::new(IpAddr::V4(group), beacon.port);
        let frame = self
            .seal(
                MessageKind::Discovery,
                Target::Broadcast,
                1,
                &DiscoveryBody::Beacon { from: self.self_contact() },
            )?
            .encode()?;

        let events = self.events_tx.clone();
        let announcer = tokio::spawn(beacon_loop(socket.clone(), frame, dest, beacon.interval));
        let listener = tokio::spawn(recv_loop(socket, move |seen, bytes| {
            events.send(Event::Beacon(seen, bytes)).is_ok()
        }));
        debug!(%dest, "local beacon running");
        Ok(vec![announcer, listener])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CryptoError;
    use crate::protocols::{AppEvent, ChannelApplication};
    use crate::security::KeyHandle;
    use crate::transport::MemoryNetwork;

    fn quick_config() -> Config {
        Config {
            retry_base: Duration::from_millis(50),
            retry_cap: Duration::from_millis(200),
            rpc_timeout: Duration::from_millis(500),
            ..Config::default()
        }
    }

    async fn start(net: &MemoryNetwork, addr: &str) -> (Node, mpsc::UnboundedReceiver<AppEvent>) {
        let (transport, inbound) = net.attach(addr);
        let (app, events) = ChannelApplication::new();
        let node = Node::spawn(quick_config(), Keypair::generate(), transport, inbound, Arc::new(app))
            .await
            .unwrap();
        (node, events)
    }

    #[tokio::test]
    async fn direct_message_is_delivered_and_acked() {
        let net = MemoryNetwork::new();
        let (alice, _alice_events) = start(&net, "alice").await;
        let (bob, mut bob_events) = start(&net, "bob").await;

        alice.add_peer(bob.contact().clone()).await.unwrap();
        alice.send(bob.id(), b"hello bob".to_vec()).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), bob_events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            AppEvent::Delivered { sender, plaintext } => {
                assert_eq!(sender, alice.id());
                assert_eq!(plaintext, b"hello bob");
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut acked = false;
        for _ in 0..40 {
            let t = alice.telemetry().await.unwrap();
            if t.pending_deliveries == 0 && t.delivered == 1 {
                acked = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(acked);
        assert!(bob.closest(alice.id(), 1).await.unwrap().iter().any(|c| c.id == alice.id()));
    }

    #[tokio::test]
    async fn empty_table_and_missing_seeds_are_errors() {
        let net = MemoryNetwork::new();
        let (node, _events) = start(&net, "lonely").await;
        assert!(matches!(node.closest(NodeId::random(), 5).await, Err(OverlayError::EmptyTable)));
        assert!(matches!(node.lookup(NodeId::random()).await, Err(OverlayError::EmptyTable)));
        assert!(matches!(node.bootstrap(Vec::new()).await, Err(OverlayError::Config(_))));
    }

    #[tokio::test]
    async fn unanswered_seeds_fail_bootstrap() {
        let net = MemoryNetwork::new();
        let (node, _events) = start(&net, "a").await;
        let result = node.bootstrap(vec!["nobody-home".to_string()]).await;
        assert!(matches!(result, Err(OverlayError::Unreachable(_))));
    }

    #[tokio::test]
    async fn forged_datagrams_are_rejected() {
        let net = MemoryNetwork::new();
        let (node, _events) = start(&net, "a").await;
        node.on_receive("x".into(), vec![0xde, 0xad, 0xbe, 0xef]).await.unwrap();

        let impostor = Keypair::generate();
        let mut envelope = Envelope::new(
            MessageKind::Control,
            NodeId::random(),
            Target::Node(node.id()),
            now_ms(),
            1,
            Payload {
                encrypted: false,
                bytes: serialize(&ControlBody::Heartbeat { nonce: 1 }).unwrap(),
            },
        );
        envelope.header.signature = impostor.sign(&envelope.signing_bytes().unwrap()).to_vec();
        node.on_receive("x".into(), envelope.encode().unwrap()).await.unwrap();

        let t = node.telemetry().await.unwrap();
        assert_eq!(t.rejected, 2);
        assert_eq!(t.received, 0);
        assert_eq!(t.contacts, 0);
    }

    /// Signs honestly but answers every challenge with garbage.
    struct WrongAnswers(SigningSecurity);

    impl Security for WrongAnswers {
        fn sign(&self, data: &[u8]) -> std::result::Result<Vec<u8>, CryptoError> {
            self.0.sign(data)
        }

        fn verify(&self, signer: &NodeId, data: &[u8], signature: &[u8]) -> std::result::Result<(), CryptoError> {
            self.0.verify(signer, data, signature)
        }

        fn encrypt(&self, plaintext: &[u8], key: &KeyHandle) -> std::result::Result<Vec<u8>, CryptoError> {
            self.0.encrypt(plaintext, key)
        }

        fn decrypt(&self, ciphertext: &[u8], key: &KeyHandle) -> std::result::Result<Vec<u8>, CryptoError> {
            self.0.decrypt(ciphertext, key)
        }

        fn respond(&self, _challenge: &[u8]) -> std::result::Result<Vec<u8>, CryptoError> {
            Ok(vec![7u8; 64])
        }

        fn authenticate(&self, peer: &NodeId, challenge: &[u8], response: &[u8]) -> std::result::Result<bool, CryptoError> {
            self.0.authenticate(peer, challenge, response)
        }

        fn generate_group_key(&self) -> std::result::Result<KeyHandle, CryptoError> {
            self.0.generate_group_key()
        }

        fn pairwise_key(&self, peer: &NodeId) -> std::result::Result<KeyHandle, CryptoError> {
            self.0.pairwise_key(peer)
        }

        fn seal_key_for(&self, recipient: &NodeId, key: &KeyHandle) -> std::result::Result<Vec<u8>, CryptoError> {
            self.0.seal_key_for(recipient, key)
        }

        fn open_key(&self, sender: &NodeId, sealed: &[u8]) -> std::result::Result<KeyHandle, CryptoError> {
            self.0.open_key(sender, sealed)
        }

        fn confidential(&self) -> bool {
            false
        }
    }

    async fn knows(node: &Node, peer: NodeId) -> Option<Contact> {
        node.closest(peer, 64).await.ok()?.into_iter().find(|c| c.id == peer)
    }

    /// Poll for up to two seconds until `node` holds `peer` in its table.
    async fn learned(node: &Node, peer: NodeId) -> Option<Contact> {
        for _ in 0..80 {
            if let Some(contact) = knows(node, peer).await {
                return Some(contact);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        None
    }

    #[tokio::test]
    async fn peers_failing_the_challenge_are_not_admitted() {
        let net = MemoryNetwork::new();
        let (alice, _alice_events) = start(&net, "alice").await;

        let keys = Keypair::generate();
        let (transport, inbound) = net.attach("mallory");
        let (app, _mallory_events) = ChannelApplication::new();
        let security = Arc::new(WrongAnswers(SigningSecurity::new(keys.clone())));
        let mallory = Node::spawn_with_security(quick_config(), keys.node_id(), transport, inbound, security, Arc::new(app))
            .await
            .unwrap();

        mallory.add_peer(alice.contact().clone()).await.unwrap();
        // alice answers correctly, so mallory admits her
        assert!(learned(&mallory, alice.id()).await.is_some());

        let mut refused = false;
        for _ in 0..40 {
            if alice.telemetry().await.unwrap().rejected >= 1 {
                refused = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(refused);
        assert_eq!(alice.telemetry().await.unwrap().contacts, 0);
        assert!(knows(&alice, mallory.id()).await.is_none());
    }

    fn beacon_frame(keys: &Keypair, from: Contact) -> Vec<u8> {
        let security = SigningSecurity::new(keys.clone());
        let mut envelope = Envelope::new(
            MessageKind::Discovery,
            keys.node_id(),
            Target::Broadcast,
            now_ms(),
            1,
            Payload {
                encrypted: false,
                bytes: serialize(&DiscoveryBody::Beacon { from }).unwrap(),
            },
        );
        envelope.header.signature = security.sign(&envelope.signing_bytes().unwrap()).unwrap();
        envelope.encode().unwrap()
    }

    #[tokio::test]
    async fn beacon_announcing_wildcard_address_is_reached_at_its_source() {
        let net = MemoryNetwork::new();
        let (alice, _alice_events) = start(&net, "10.1.0.1:7000").await;

        let keys = Keypair::generate();
        let (transport, inbound) = net.attach("10.1.0.2:7000");
        let (app, _bob_events) = ChannelApplication::new();
        let bob = Node::spawn(quick_config(), keys.clone(), transport, inbound, Arc::new(app))
            .await
            .unwrap();

        // bound to the wildcard address, bob can only announce that
        let mut announced = bob.contact().clone();
        announced.addr = "0.0.0.0:7000".into();
        let frame = beacon_frame(&keys, announced);
        alice.on_beacon("10.1.0.2:5353".parse().unwrap(), frame).await.unwrap();

        let contact = learned(&alice, bob.id()).await.expect("bob admitted");
        assert_eq!(contact.addr, "10.1.0.2:7000");
        // the beacon reply reached bob, who admits alice at her real address
        let back = learned(&bob, alice.id()).await.expect("alice admitted");
        assert_eq!(back.addr, "10.1.0.1:7000");
    }

    #[tokio::test]
    async fn failed_route_lookup_is_retried_on_retransmission() {
        let net = MemoryNetwork::new();
        let (alice, _alice_events) = start(&net, "alice").await;
        let (bob, _bob_events) = start(&net, "bob").await;
        let (carol, mut carol_events) = start(&net, "carol").await;
        bob.add_peer(carol.contact().clone()).await.unwrap();
        assert!(learned(&bob, carol.id()).await.is_some());

        // alice knows nobody yet, so the first route lookup fails at once
        alice.send(carol.id(), b"late route".to_vec()).await.unwrap();
        assert_eq!(alice.telemetry().await.unwrap().buffered, 1);
        alice.add_peer(bob.contact().clone()).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(3), carol_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            AppEvent::Delivered {
                sender: alice.id(),
                plaintext: b"late route".to_vec()
            }
        );
    }

    #[tokio::test]
    async fn quit_stops_the_actor() {
        let net = MemoryNetwork::new();
        let (node, _events) = start(&net, "a").await;
        node.quit().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(node.telemetry().await, Err(OverlayError::Shutdown)));
    }
}
