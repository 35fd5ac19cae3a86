//! # Adaptive Router & Forwarder
//!
//! Distance-vector route entries for destinations that are not (or no longer)
//! direct contacts, plus the forwarding decision for every outbound or
//! transit message.
//!
//! ## Route replacement
//!
//! An advertisement replaces the current entry for its destination iff its
//! sequence number is newer, or the sequence number is equal and the
//! candidate ranks strictly better. Rank is `(score, hop_count, next_hop)`
//! with [`RouteEntry::score`] lower-is-better. Rejected equal-sequence
//! candidates through a different neighbour are kept as backup paths.
//!
//! ## Forwarding
//!
//! [`Router::decide`] evaluates, in order: direct contact, group multicast,
//! known route (rotating across disjoint next hops), otherwise buffer.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};
use tracing::trace;

use crate::error::OverlayError;
use crate::identity::{distance_cmp, Contact, NodeId};
use crate::messages::{Envelope, MessageId};
use crate::table::RoutingTable;

/// Score weight per hop.
pub const W_HOPS: f64 = 1.0;
/// Score weight per 100ms of latency.
pub const W_LATENCY: f64 = 0.5;
/// Score credit for a fully reliable path.
pub const W_RELIABILITY: f64 = 2.0;

/// Smoothing factor for link reliability and latency samples.
const LINK_EWMA_ALPHA: f64 = 0.2;

/// A route announcement as carried on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteAdvert {
    pub destination: NodeId,
    pub hop_count: u8,
    pub reliability: f64,
    pub latency_ms: u32,
    pub seq: u64,
    pub ttl: u8,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RouteEntry {
    pub destination: NodeId,
    pub next_hop: NodeId,
    pub hop_count: u8,
    /// Delivery probability estimate in `[0, 1]`.
    pub reliability: f64,
    pub latency: Duration,
    pub seq: u64,
    pub refreshed_at: Instant,
}

impl RouteEntry {
    /// Lower is better.
    pub fn score(&self) -> f64 {
        W_HOPS * f64::from(self.hop_count) + W_LATENCY * (self.latency.as_secs_f64() * 10.0)
            - W_RELIABILITY * self.reliability
    }

    fn rank_cmp(&self, other: &RouteEntry) -> std::cmp::Ordering {
        self.score()
            .total_cmp(&other.score())
            .then(self.hop_count.cmp(&other.hop_count))
            .then(self.next_hop.cmp(&other.next_hop))
    }
}

#[derive(Clone, Copy, Debug)]
struct LinkStats {
    reliability: f64,
    latency: Duration,
}

impl Default for LinkStats {
    fn default() -> Self {
        Self {
            reliability: 1.0,
            latency: Duration::ZERO,
        }
    }
}

/// Where a message goes next.
#[derive(Clone, Debug, PartialEq)]
pub enum Forwarding {
    Direct(Contact),
    /// Tree children to forward a group message to.
    Multicast(Vec<NodeId>),
    Forward(Contact),
    /// No path known yet; queue and look the target up.
    Buffer,
}

#[derive(Clone, Debug)]
pub enum Destination {
    Node(NodeId),
    Group { children: Vec<NodeId> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferOutcome {
    /// Queued; `first` is set when nothing else was waiting for this target.
    Queued { first: bool },
    Full,
}

#[derive(Clone, Debug)]
struct Buffered {
    envelope: Envelope,
    queued_at: Instant,
}

pub struct Router {
    self_id: NodeId,
    own_seq: u64,
    advert_ttl: u8,
    max_paths: usize,
    buffer_capacity: usize,
    routes: HashMap<NodeId, RouteEntry>,
    backups: HashMap<NodeId, Vec<RouteEntry>>,
    links: HashMap<NodeId, LinkStats>,
    rotation: HashMap<NodeId, usize>,
    buffer: HashMap<NodeId, VecDeque<Buffered>>,
    buffered: usize,
}

impl Router {
    pub fn new(self_id: NodeId, advert_ttl: u8, max_paths: usize, buffer_capacity: usize) -> Self {
        Self {
            self_id,
            own_seq: 0,
            advert_ttl,
            max_paths: max_paths.max(1),
            buffer_capacity,
            routes: HashMap::new(),
            backups: HashMap::new(),
            links: HashMap::new(),
            rotation: HashMap::new(),
            buffer: HashMap::new(),
            buffered: 0,
        }
    }

    pub fn route(&self, destination: &NodeId) -> Option<&RouteEntry> {
        self.routes.get(destination)
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn buffered_count(&self) -> usize {
        self.buffered
    }

    /// Announcement of ourselves with a fresh sequence number.
    pub fn originate(&mut self) -> RouteAdvert {
        self.own_seq += 1;
        RouteAdvert {
            destination: self.self_id,
            hop_count: 0,
            reliability: 1.0,
            latency_ms: 0,
            seq: self.own_seq,
            ttl: self.advert_ttl,
        }
    }

    /// Apply an advertisement heard from neighbour `from`.
    ///
    /// Returns the advertisement to echo onward (TTL and hop count adjusted),
    /// `None` when accepted with no hop budget left, or `StaleUpdate` when
    /// the local entry stays.
    pub fn apply_advert(
        &mut self,
        from: NodeId,
        advert: &RouteAdvert,
        now: Instant,
    ) -> Result<Option<RouteAdvert>, OverlayError> {
        if advert.destination == self.self_id || from == self.self_id {
            return Ok(None);
        }
        let link = self.links.get(&from).copied().unwrap_or_default();
        let candidate = RouteEntry {
            destination: advert.destination,
            next_hop: from,
            hop_count: advert.hop_count.saturating_add(1),
            reliability: (advert.reliability * link.reliability).clamp(0.0, 1.0),
            latency: Duration::from_millis(u64::from(advert.latency_ms)) + link.latency,
            seq: advert.seq,
            refreshed_at: now,
        };

        let (accept, keep_as_backup) = match self.routes.get(&advert.destination) {
            None => (true, false),
            Some(current) if candidate.seq > current.seq => (true, false),
            Some(current) if candidate.seq == current.seq => (
                candidate.rank_cmp(current) == std::cmp::Ordering::Less,
                current.next_hop != from,
            ),
            Some(_) => (false, false),
        };

        if !accept {
            if keep_as_backup {
                self.note_backup(candidate);
            }
            return Err(OverlayError::StaleUpdate(format!(
                "route to {} seq {}",
                advert.destination.short(),
                advert.seq
            )));
        }

        trace!(
            destination = %advert.destination.short(),
            next_hop = %from.short(),
            seq = advert.seq,
            hops = candidate.hop_count,
            "route accepted"
        );

        let echo = (advert.ttl > 1).then(|| RouteAdvert {
            destination: candidate.destination,
            hop_count: candidate.hop_count,
            reliability: candidate.reliability,
            latency_ms: candidate.latency.as_millis().min(u128::from(u32::MAX)) as u32,
            seq: candidate.seq,
            ttl: advert.ttl - 1,
        });

        if let Some(previous) = self.routes.insert(candidate.destination, candidate.clone())
            && previous.next_hop != candidate.next_hop
        {
            self.note_backup(previous);
        }
        if let Some(backups) = self.backups.get_mut(&candidate.destination) {
            backups.retain(|b| b.next_hop != candidate.next_hop && b.seq >= candidate.seq);
        }
        Ok(echo)
    }

    fn note_backup(&mut self, entry: RouteEntry) {
        let limit = self.max_paths.saturating_sub(1);
        if limit == 0 {
            return;
        }
        let backups = self.backups.entry(entry.destination).or_default();
        backups.retain(|b| b.next_hop != entry.next_hop);
        backups.push(entry);
        backups.sort_by(|a, b| b.seq.cmp(&a.seq).then(a.rank_cmp(b)));
        backups.truncate(limit);
    }

    /// Up to `max_paths` next hops toward `target` with no shared first hop.
    ///
    /// Route entries come first (primary, then backups). When at least one is
    /// known, the remainder is padded with direct contacts strictly closer to
    /// the target than we are.
    pub fn alternative_paths(&self, target: &NodeId, table: &RoutingTable) -> Vec<Contact> {
        let mut used: HashSet<NodeId> = HashSet::new();
        let mut paths = Vec::new();

        let entries = self
            .routes
            .get(target)
            .into_iter()
            .chain(self.backups.get(target).into_iter().flatten());
        for entry in entries {
            if paths.len() >= self.max_paths {
                break;
            }
            if !used.insert(entry.next_hop) {
                continue;
            }
            if let Some(contact) = table.get(&entry.next_hop) {
                paths.push(contact.clone());
            }
        }

        if !paths.is_empty() && paths.len() < self.max_paths {
            let own_distance = self.self_id.xor_distance(target);
            if let Ok(closest) = table.closest(target, self.max_paths + used.len()) {
                for contact in closest {
                    if paths.len() >= self.max_paths {
                        break;
                    }
                    let closer = distance_cmp(&contact.id.xor_distance(target), &own_distance)
                        == std::cmp::Ordering::Less;
                    if closer && used.insert(contact.id) {
                        paths.push(contact);
                    }
                }
            }
        }
        paths
    }

    pub fn decide(&mut self, destination: Destination, table: &RoutingTable) -> Forwarding {
        match destination {
            Destination::Node(target) => {
                if let Some(contact) = table.get(&target) {
                    return Forwarding::Direct(contact.clone());
                }
                let paths = self.alternative_paths(&target, table);
                if paths.is_empty() {
                    return Forwarding::Buffer;
                }
                let turn = self.rotation.entry(target).or_insert(0);
                let choice = paths[*turn % paths.len()].clone();
                *turn = turn.wrapping_add(1);
                Forwarding::Forward(choice)
            }
            Destination::Group { children } => Forwarding::Multicast(children),
        }
    }

    /// Drop every entry whose next hop is `peer`; backups are promoted where
    /// available. Returns destinations left without a route.
    pub fn invalidate_next_hop(&mut self, peer: &NodeId) -> Vec<NodeId> {
        self.links.remove(peer);
        for backups in self.backups.values_mut() {
            backups.retain(|b| &b.next_hop != peer);
        }
        self.backups.retain(|_, b| !b.is_empty());

        let via_peer: Vec<NodeId> = self
            .routes
            .values()
            .filter(|r| &r.next_hop == peer || &r.destination == peer)
            .map(|r| r.destination)
            .collect();

        let mut orphaned = Vec::new();
        for destination in via_peer {
            self.routes.remove(&destination);
            self.rotation.remove(&destination);
            let promoted = if &destination == peer {
                None
            } else {
                self.backups.get_mut(&destination).and_then(|b| {
                    if b.is_empty() { None } else { Some(b.remove(0)) }
                })
            };
            match promoted {
                Some(entry) => {
                    self.routes.insert(destination, entry);
                }
                None => {
                    self.backups.remove(&destination);
                    orphaned.push(destination);
                }
            }
        }
        orphaned
    }

    /// Remove entries not refreshed within `staleness`. Returns expired destinations.
    pub fn expire(&mut self, now: Instant, staleness: Duration) -> Vec<NodeId> {
        let fresh = |entry: &RouteEntry| now.saturating_duration_since(entry.refreshed_at) <= staleness;
        for backups in self.backups.values_mut() {
            backups.retain(|b| fresh(b));
        }
        self.backups.retain(|_, b| !b.is_empty());

        let expired: Vec<NodeId> = self
            .routes
            .values()
            .filter(|r| !fresh(r))
            .map(|r| r.destination)
            .collect();
        for destination in &expired {
            self.routes.remove(destination);
            self.rotation.remove(destination);
        }
        expired
    }

    /// Fold a delivery outcome over the link to `peer` into its estimates.
    pub fn record_outcome(&mut self, peer: NodeId, success: bool, rtt: Option<Duration>) {
        let link = self.links.entry(peer).or_default();
        let sample = if success { 1.0 } else { 0.0 };
        link.reliability = (1.0 - LINK_EWMA_ALPHA) * link.reliability + LINK_EWMA_ALPHA * sample;
        if let Some(rtt) = rtt {
            link.latency = if link.latency.is_zero() {
                rtt
            } else {
                link.latency.mul_f64(1.0 - LINK_EWMA_ALPHA) + rtt.mul_f64(LINK_EWMA_ALPHA)
            };
        }
    }

    pub fn link_reliability(&self, peer: &NodeId) -> f64 {
        self.links.get(peer).map_or(1.0, |l| l.reliability)
    }

    // ------------------------------------------------------------------------
    // Buffer for messages without a route
    // ------------------------------------------------------------------------

    pub fn buffer(&mut self, target: NodeId, envelope: Envelope, now: Instant) -> BufferOutcome {
        let queue = self.buffer.entry(target).or_default();
        let first = queue.is_empty();
        if let Some(existing) = queue.iter_mut().find(|b| b.envelope.id() == envelope.id()) {
            existing.envelope = envelope;
            return BufferOutcome::Queued { first };
        }
        if self.buffered >= self.buffer_capacity {
            if queue.is_empty() {
                self.buffer.remove(&target);
            }
            return BufferOutcome::Full;
        }
        queue.push_back(Buffered { envelope, queued_at: now });
        self.buffered += 1;
        BufferOutcome::Queued { first }
    }

    pub fn buffered_targets(&self) -> Vec<NodeId> {
        self.buffer.keys().copied().collect()
    }

    pub fn take_buffered(&mut self, target: &NodeId) -> Vec<Envelope> {
        let taken: Vec<Envelope> = self
            .buffer
            .remove(target)
            .map(|q| q.into_iter().map(|b| b.envelope).collect())
            .unwrap_or_default();
        self.buffered -= taken.len();
        taken
    }

    pub fn drop_buffered(&mut self, message_id: &MessageId) -> bool {
        let mut dropped = false;
        for queue in self.buffer.values_mut() {
            let before = queue.len();
            queue.retain(|b| &b.envelope.id() != message_id);
            if queue.len() != before {
                self.buffered -= before - queue.len();
                dropped = true;
            }
        }
        self.buffer.retain(|_, q| !q.is_empty());
        dropped
    }

    /// Drop messages that waited longer than `timeout` for a route.
    pub fn expire_buffer(&mut self, now: Instant, timeout: Duration) -> Vec<Envelope> {
        let mut expired = Vec::new();
        for queue in self.buffer.values_mut() {
            while let Some(front) = queue.front() {
                if now.saturating_duration_since(front.queued_at) <= timeout {
                    break;
                }
                if let Some(b) = queue.pop_front() {
                    expired.push(b.envelope);
                }
            }
        }
        self.buffered -= expired.len();
        self.buffer.retain(|_, q| !q.is_empty());
        expired
    }
}
