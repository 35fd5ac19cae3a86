//! # Failure Detector
//!
//! Heartbeat bookkeeping for direct contacts, plus partition detection.
//!
//! The detector is a pure state machine driven by [`FailureDetector::tick`];
//! the node worker calls it on every heartbeat tick, sends the probes it
//! returns and feeds answers back through [`FailureDetector::on_ack`].
//!
//! A probe unanswered `heartbeat_timeout` after it was sent counts as one
//! miss. `missed_threshold` consecutive misses declare the peer dead. With a
//! 1s interval and 1s timeout a silent peer probed at t=0 misses at t=1, t=2
//! and t=3 and is declared dead at t=3, never earlier.
//!
//! Dead peers stay in a `down` set until heard from again, for at most
//! [`DOWN_RETENTION`], and at most [`DOWN_CAPACITY`] of them; broadcast trees
//! route around them. Deaths are also fed to a sliding window:
//! `partition_threshold` deaths within `partition_window` mark every peer
//! that died in the window as suspended, which is reported to the
//! application as a partition.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::identity::NodeId;

/// Dead peers remembered at once; the longest-dead are forgotten first.
pub const DOWN_CAPACITY: usize = 1024;

/// How long a dead peer stays in the down set without being heard from.
pub const DOWN_RETENTION: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
struct Liveness {
    outstanding: Option<(u64, Instant)>,
    missed: u32,
    next_probe: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub peer: NodeId,
    pub nonce: u64,
}

#[derive(Debug, Default)]
pub struct TickOutcome {
    pub probes: Vec<Probe>,
    pub dead: Vec<NodeId>,
}

pub struct FailureDetector {
    interval: Duration,
    timeout: Duration,
    missed_threshold: u32,
    partition_threshold: usize,
    partition_window: Duration,
    peers: HashMap<NodeId, Liveness>,
    deaths: VecDeque<(Instant, NodeId)>,
    down: LruCache<NodeId, Instant>,
    suspended: BTreeSet<NodeId>,
    next_nonce: u64,
}

impl FailureDetector {
    pub fn new(
        interval: Duration,
        timeout: Duration,
        missed_threshold: u32,
        partition_threshold: usize,
        partition_window: Duration,
    ) -> Self {
        Self {
            interval,
            timeout,
            missed_threshold: missed_threshold.max(1),
            partition_threshold: partition_threshold.max(1),
            partition_window,
            peers: HashMap::new(),
            deaths: VecDeque::new(),
            down: LruCache::new(NonZeroUsize::new(DOWN_CAPACITY).unwrap_or(NonZeroUsize::MIN)),
            suspended: BTreeSet::new(),
            next_nonce: rand::random(),
        }
    }

    pub fn tracked(&self) -> usize {
        self.peers.len()
    }

    pub fn is_tracked(&self, peer: &NodeId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn missed(&self, peer: &NodeId) -> Option<u32> {
        self.peers.get(peer).map(|l| l.missed)
    }

    /// Start monitoring a direct contact. Idempotent.
    pub fn track(&mut self, peer: NodeId, now: Instant) {
        self.peers.entry(peer).or_insert(Liveness {
            outstanding: None,
            missed: 0,
            next_probe: now,
        });
    }

    pub fn untrack(&mut self, peer: &NodeId) {
        self.peers.remove(peer);
    }

    /// Count expired probes, declare the dead, then issue due probes.
    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        for (peer, liveness) in self.peers.iter_mut() {
            if let Some((_, sent)) = liveness.outstanding
                && sent + self.timeout <= now
            {
                liveness.outstanding = None;
                liveness.missed += 1;
                trace!(peer = %peer.short(), missed = liveness.missed, "heartbeat missed");
                if liveness.missed >= self.missed_threshold {
                    outcome.dead.push(*peer);
                }
            }
        }
        for peer in &outcome.dead {
            self.peers.remove(peer);
            debug!(peer = %peer.short(), "peer declared dead");
        }

        for (peer, liveness) in self.peers.iter_mut() {
            if liveness.outstanding.is_none() && liveness.next_probe <= now {
                self.next_nonce = self.next_nonce.wrapping_add(1);
                liveness.outstanding = Some((self.next_nonce, now));
                liveness.next_probe = now + self.interval;
                outcome.probes.push(Probe {
                    peer: *peer,
                    nonce: self.next_nonce,
                });
            }
        }
        outcome
    }

    /// Heartbeat answered. Stale nonces are ignored.
    pub fn on_ack(&mut self, peer: &NodeId, nonce: u64) -> bool {
        let Some(liveness) = self.peers.get_mut(peer) else {
            return false;
        };
        match liveness.outstanding {
            Some((expected, _)) if expected == nonce => {
                liveness.outstanding = None;
                liveness.missed = 0;
                true
            }
            _ => false,
        }
    }

    /// Record a death. Returns the suspended set when this death completes a
    /// partition.
    pub fn record_death(&mut self, peer: NodeId, now: Instant) -> Option<Vec<NodeId>> {
        self.peers.remove(&peer);
        if let Some((forgotten, _)) = self.down.push(peer, now)
            && forgotten != peer
        {
            self.forget(&forgotten);
        }
        self.deaths.push_back((now, peer));
        while let Some((at, _)) = self.deaths.front() {
            if now.saturating_duration_since(*at) <= self.partition_window {
                break;
            }
            self.deaths.pop_front();
        }
        if self.deaths.len() < self.partition_threshold {
            return None;
        }
        let mut newly = false;
        for (_, id) in &self.deaths {
            newly |= self.suspended.insert(*id);
        }
        if !newly {
            return None;
        }
        debug!(suspended = self.suspended.len(), "partition detected");
        Some(self.suspended.iter().copied().collect())
    }

    pub fn is_down(&self, peer: &NodeId) -> bool {
        self.down.contains(peer)
    }

    pub fn down_count(&self) -> usize {
        self.down.len()
    }

    /// Peers declared dead and not heard from since.
    pub fn down(&self) -> BTreeSet<NodeId> {
        self.down.iter().map(|(id, _)| *id).collect()
    }

    /// Forget peers dead for longer than [`DOWN_RETENTION`]. Returns how many.
    pub fn expire_down(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        while let Some((id, died)) = self.down.peek_lru() {
            if now.saturating_duration_since(*died) <= DOWN_RETENTION {
                break;
            }
            let id = *id;
            self.down.pop_lru();
            self.forget(&id);
            expired += 1;
        }
        expired
    }

    fn forget(&mut self, peer: &NodeId) {
        self.deaths.retain(|(_, id)| id != peer);
        self.suspended.remove(peer);
    }

    pub fn is_suspended(&self, peer: &NodeId) -> bool {
        self.suspended.contains(peer)
    }

    pub fn suspended(&self) -> &BTreeSet<NodeId> {
        &self.suspended
    }

    /// Peer heard from again. Returns `true` when this lifts a suspension.
    pub fn resume(&mut self, peer: &NodeId) -> bool {
        if self.down.pop(peer).is_none() {
            return false;
        }
        self.deaths.retain(|(_, id)| id != peer);
        let resumed = self.suspended.remove(peer);
        if resumed {
            debug!(peer = %peer.short(), "suspended peer resumed");
        }
        resumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> FailureDetector {
        FailureDetector::new(Duration::from_secs(1), Duration::from_secs(1), 3, 3, Duration::from_secs(5))
    }

    #[test]
    fn silent_peer_dies_after_third_miss_not_before() {
        let mut fd = detector();
        let start = Instant::now();
        let peer = NodeId::random();
        fd.track(peer, start);

        let mut dead_at = None;
        for step in 0..=40 {
            let now = start + Duration::from_millis(step * 100);
            let outcome = fd.tick(now);
            if outcome.dead.contains(&peer) {
                dead_at = Some(now - start);
                break;
            }
        }
        assert_eq!(dead_at, Some(Duration::from_secs(3)));
    }

    #[test]
    fn answered_heartbeats_keep_peer_alive() {
        let mut fd = detector();
        let start = Instant::now();
        let peer = NodeId::random();
        fd.track(peer, start);
        for second in 0..10 {
            let outcome = fd.tick(start + Duration::from_secs(second));
            assert!(outcome.dead.is_empty());
            for probe in outcome.probes {
                assert!(fd.on_ack(&probe.peer, probe.nonce));
            }
        }
        assert_eq!(fd.missed(&peer), Some(0));
    }

    #[test]
    fn ack_resets_consecutive_misses() {
        let mut fd = detector();
        let start = Instant::now();
        let peer = NodeId::random();
        fd.track(peer, start);
        fd.tick(start);
        fd.tick(start + Duration::from_secs(1));
        let outcome = fd.tick(start + Duration::from_secs(2));
        assert_eq!(fd.missed(&peer), Some(2));
        let probe = outcome.probes[0];
        assert!(!fd.on_ack(&peer, probe.nonce.wrapping_add(99)));
        assert!(fd.on_ack(&peer, probe.nonce));
        assert_eq!(fd.missed(&peer), Some(0));
        assert!(fd.tick(start + Duration::from_secs(3)).dead.is_empty());
    }

    #[test]
    fn partition_needs_threshold_deaths_inside_window() {
        let mut fd = detector();
        let start = Instant::now();
        let ids: Vec<NodeId> = (0..4).map(|_| NodeId::random()).collect();

        assert!(fd.record_death(ids[0], start).is_none());
        assert!(fd.is_down(&ids[0]));
        assert!(fd.record_death(ids[1], start + Duration::from_secs(6)).is_none());
        assert!(fd.record_death(ids[2], start + Duration::from_secs(7)).is_none());
        let suspended = fd.record_death(ids[3], start + Duration::from_secs(8)).expect("partition");
        assert_eq!(suspended.len(), 3);
        assert!(!fd.is_suspended(&ids[0]));
        assert!(fd.is_suspended(&ids[3]));

        assert!(fd.resume(&ids[3]));
        assert!(!fd.resume(&ids[3]));
        assert!(!fd.is_suspended(&ids[3]));
        assert!(!fd.is_down(&ids[3]));
        assert!(!fd.resume(&ids[0]) && !fd.is_down(&ids[0]));
    }

    #[test]
    fn down_set_is_bounded_and_ages_out() {
        let mut fd = detector();
        let start = Instant::now();
        let first = NodeId::random();
        fd.record_death(first, start);
        for step in 0..DOWN_CAPACITY as u64 {
            fd.record_death(NodeId::random(), start + Duration::from_millis(step + 1));
        }
        assert_eq!(fd.down_count(), DOWN_CAPACITY);
        assert!(!fd.is_down(&first));
        assert!(!fd.is_suspended(&first));

        let late = NodeId::random();
        let later = start + DOWN_RETENTION;
        fd.record_death(late, later);
        assert_eq!(fd.expire_down(later + Duration::from_secs(1)), DOWN_CAPACITY - 1);
        assert_eq!(fd.down(), BTreeSet::from([late]));
        assert!(fd.suspended().len() <= 1);
    }
}
