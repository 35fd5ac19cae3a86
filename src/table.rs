//! # Distance-Bucketed Routing Table
//!
//! 256 buckets indexed by the first differing bit between our id and the
//! contact's id (see [`bucket_index`]). Each bucket holds at most `k`
//! contacts ordered least-recently-seen first.
//!
//! When a bucket is full, [`RoutingTable::update`] does not evict anything.
//! It returns a [`PendingReplacement`] naming the least-recently-seen contact;
//! the owner probes it and reports back through
//! [`RoutingTable::apply_probe_result`]. Long-lived contacts are only displaced
//! once they have actually stopped answering.

use std::collections::BinaryHeap;
use std::num::NonZeroUsize;

use lru::LruCache;
use rand::Rng;
use tokio::time::{Duration, Instant};

use crate::error::OverlayError;
use crate::identity::{bucket_index, distance_cmp, Contact, NodeId, ID_BITS};

/// Contacts one peer may add to our table through lookup responses per window.
const INSERTION_PER_PEER_LIMIT: usize = 50;

/// Refill window for the per-peer insertion budget.
const INSERTION_RATE_WINDOW: Duration = Duration::from_secs(60);

/// Upper bound on tracked insertion sources.
const MAX_INSERTION_TRACKED_PEERS: usize = 1_000;

#[derive(Debug, Clone)]
struct Bucket {
    contacts: Vec<Contact>,
    last_refresh: Instant,
}

impl Bucket {
    fn new(now: Instant) -> Self {
        Self {
            contacts: Vec::new(),
            last_refresh: now,
        }
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.contacts.iter().position(|c| &c.id == id)
    }

    /// Move an existing contact to the most-recently-seen end.
    fn refresh(&mut self, id: &NodeId) -> bool {
        match self.position(id) {
            Some(pos) => {
                let existing = self.contacts.remove(pos);
                self.contacts.push(existing);
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, id: &NodeId) -> Option<Contact> {
        self.position(id).map(|pos| self.contacts.remove(pos))
    }
}

/// Result of offering a contact to the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TouchOutcome {
    /// Our own id; never stored.
    Ignored,
    Inserted,
    /// Already known, moved to the most-recently-seen position.
    Refreshed,
    /// Bucket full; the least-recently-seen contact must be probed.
    Full(PendingReplacement),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReplacement {
    pub bucket: usize,
    pub oldest: Contact,
    pub candidate: Contact,
}

/// What a probe result did to the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResolution {
    /// Oldest answered: kept and refreshed, candidate discarded.
    Kept,
    /// Oldest was evicted and the candidate inserted.
    Replaced { evicted: Contact },
    /// Oldest was evicted but the candidate did not fit (or was already present).
    Evicted { evicted: Contact },
    /// The oldest contact had already left the bucket.
    Unchanged,
}

#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    k: usize,
    buckets: Vec<Bucket>,
    len: usize,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, k: usize) -> Self {
        let now = Instant::now();
        Self {
            self_id,
            k: k.max(1),
            buckets: (0..ID_BITS).map(|_| Bucket::new(now)).collect(),
            len: 0,
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bucket_len(&self, bucket: usize) -> usize {
        self.buckets.get(bucket).map_or(0, |b| b.contacts.len())
    }

    /// Record a sighting of `contact`.
    pub fn update(&mut self, contact: Contact, now: Instant) -> TouchOutcome {
        if contact.id == self.self_id {
            return TouchOutcome::Ignored;
        }
        let idx = bucket_index(&self.self_id, &contact.id);
        let bucket = &mut self.buckets[idx];

        if let Some(pos) = bucket.position(&contact.id) {
            let mut existing = bucket.contacts.remove(pos);
            existing.absorb(contact);
            bucket.contacts.push(existing);
            bucket.last_refresh = now;
            return TouchOutcome::Refreshed;
        }

        if bucket.contacts.len() < self.k {
            bucket.contacts.push(contact);
            bucket.last_refresh = now;
            self.len += 1;
            return TouchOutcome::Inserted;
        }

        match bucket.contacts.first() {
            Some(oldest) => TouchOutcome::Full(PendingReplacement {
                bucket: idx,
                oldest: oldest.clone(),
                candidate: contact,
            }),
            None => TouchOutcome::Ignored,
        }
    }

    /// Record traffic from a known contact at `addr`. Only the address and
    /// sighting time change; role and capabilities stay as announced.
    /// Returns `false` when the contact is not in the table.
    pub fn touch(&mut self, id: &NodeId, addr: &str, seen_ms: u64, now: Instant) -> bool {
        let idx = bucket_index(&self.self_id, id);
        let Some(bucket) = self.buckets.get_mut(idx) else {
            return false;
        };
        let Some(pos) = bucket.position(id) else {
            return false;
        };
        let mut existing = bucket.contacts.remove(pos);
        existing.addr = addr.to_string();
        existing.last_seen = existing.last_seen.max(seen_ms);
        bucket.contacts.push(existing);
        bucket.last_refresh = now;
        true
    }

    /// Apply the outcome of probing `pending.oldest`.
    pub fn apply_probe_result(&mut self, pending: PendingReplacement, oldest_alive: bool) -> ProbeResolution {
        let Some(bucket) = self.buckets.get_mut(pending.bucket) else {
            return ProbeResolution::Unchanged;
        };
        if oldest_alive {
            return if bucket.refresh(&pending.oldest.id) {
                ProbeResolution::Kept
            } else {
                ProbeResolution::Unchanged
            };
        }

        let Some(evicted) = bucket.remove(&pending.oldest.id) else {
            return ProbeResolution::Unchanged;
        };
        self.len -= 1;

        let already_present = bucket.position(&pending.candidate.id).is_some();
        if !already_present && bucket.contacts.len() < self.k {
            bucket.contacts.push(pending.candidate);
            self.len += 1;
            ProbeResolution::Replaced { evicted }
        } else {
            ProbeResolution::Evicted { evicted }
        }
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<Contact> {
        if *id == self.self_id {
            return None;
        }
        let idx = bucket_index(&self.self_id, id);
        let removed = self.buckets[idx].remove(id);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    pub fn get(&self, id: &NodeId) -> Option<&Contact> {
        if *id == self.self_id {
            return None;
        }
        let idx = bucket_index(&self.self_id, id);
        self.buckets[idx].contacts.iter().find(|c| &c.id == id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.get(id).is_some()
    }

    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.buckets.iter().flat_map(|b| b.contacts.iter())
    }

    /// The `n` known contacts closest to `target`, nearest first.
    pub fn closest(&self, target: &NodeId, n: usize) -> Result<Vec<Contact>, OverlayError> {
        if self.is_empty() {
            return Err(OverlayError::EmptyTable);
        }
        if n == 0 {
            return Ok(Vec::new());
        }

        #[derive(Eq, PartialEq)]
        struct ByDistance<'a> {
            dist: [u8; 32],
            contact: &'a Contact,
        }

        impl Ord for ByDistance<'_> {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }

        impl PartialOrd for ByDistance<'_> {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap: BinaryHeap<ByDistance<'_>> = BinaryHeap::with_capacity(n + 1);
        for contact in self.contacts() {
            let dist = contact.id.xor_distance(target);
            if heap.len() < n {
                heap.push(ByDistance { dist, contact });
            } else if let Some(farthest) = heap.peek()
                && distance_cmp(&dist, &farthest.dist) == std::cmp::Ordering::Less
            {
                heap.pop();
                heap.push(ByDistance { dist, contact });
            }
        }

        Ok(heap
            .into_sorted_vec()
            .into_iter()
            .map(|entry| entry.contact.clone())
            .collect())
    }

    /// Non-empty buckets that have not seen activity within `threshold`.
    pub fn stale_buckets(&self, threshold: Duration, now: Instant) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.contacts.is_empty() && now.saturating_duration_since(b.last_refresh) > threshold)
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Buckets with spare capacity that could plausibly hold peers.
    ///
    /// Buckets deeper than the deepest occupied one (plus one) are skipped:
    /// the chance of a peer sharing that long a prefix is negligible.
    pub fn underpopulated_buckets(&self) -> Vec<usize> {
        let deepest = self
            .buckets
            .iter()
            .rposition(|b| !b.contacts.is_empty())
            .map_or(0, |idx| (idx + 1).min(ID_BITS - 1));
        (0..=deepest)
            .filter(|&idx| self.buckets[idx].contacts.len() < self.k)
            .collect()
    }

    pub fn mark_bucket_refreshed(&mut self, bucket: usize, now: Instant) {
        if let Some(b) = self.buckets.get_mut(bucket) {
            b.last_refresh = now;
        }
    }

    /// A random id that falls into `bucket` relative to our own id.
    pub fn random_id_for_bucket(&self, bucket: usize) -> NodeId {
        let bucket = bucket.min(ID_BITS - 1);
        let mut distance = [0u8; 32];
        rand::thread_rng().fill(&mut distance);

        let byte_idx = bucket / 8;
        let bit_pos = bucket % 8;
        for byte in distance.iter_mut().take(byte_idx) {
            *byte = 0;
        }
        let target_bit = 0x80u8 >> bit_pos;
        distance[byte_idx] = target_bit | (distance[byte_idx] & target_bit.wrapping_sub(1));

        let self_bytes = self.self_id.as_bytes();
        let mut target = [0u8; 32];
        for i in 0..32 {
            target[i] = self_bytes[i] ^ distance[i];
        }
        NodeId::from_bytes(target)
    }
}

// ============================================================================
// Per-peer insertion limiting
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct InsertionBudget {
    tokens: f64,
    last_update: Instant,
}

impl InsertionBudget {
    fn new(now: Instant) -> Self {
        Self {
            tokens: INSERTION_PER_PEER_LIMIT as f64,
            last_update: now,
        }
    }

    fn try_consume(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        let rate = INSERTION_PER_PEER_LIMIT as f64 / INSERTION_RATE_WINDOW.as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(INSERTION_PER_PEER_LIMIT as f64);
        self.last_update = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Bounds how many second-hand contacts a single peer can push into our table.
pub struct InsertionLimiter {
    budgets: LruCache<NodeId, InsertionBudget>,
}

impl Default for InsertionLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl InsertionLimiter {
    pub fn new() -> Self {
        Self {
            budgets: LruCache::new(NonZeroUsize::new(MAX_INSERTION_TRACKED_PEERS).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    pub fn allow(&mut self, from_peer: &NodeId, now: Instant) -> bool {
        self.budgets
            .get_or_insert_mut(*from_peer, || InsertionBudget::new(now))
            .try_consume(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Capability, NodeRole};

    fn contact(id: NodeId) -> Contact {
        Contact::new(id, "127.0.0.1:1")
    }

    fn id_with_prefix(first: u8, tail: u8) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[0] = first;
        bytes[31] = tail;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn self_is_never_inserted() {
        let me = NodeId::random();
        let mut table = RoutingTable::new(me, 4);
        assert_eq!(table.update(contact(me), Instant::now()), TouchOutcome::Ignored);
        assert!(table.is_empty());
    }

    #[test]
    fn empty_table_reports_empty_on_closest() {
        let table = RoutingTable::new(NodeId::random(), 4);
        assert_eq!(table.closest(&NodeId::random(), 3), Err(OverlayError::EmptyTable));
    }

    #[test]
    fn bucket_bound_holds_under_bursts() {
        let me = NodeId::random();
        let k = 8;
        let mut table = RoutingTable::new(me, k);
        let now = Instant::now();
        let mut full = 0;
        for _ in 0..500 {
            if let TouchOutcome::Full(_) = table.update(contact(NodeId::random()), now) {
                full += 1;
            }
            for bucket in 0..ID_BITS {
                assert!(table.bucket_len(bucket) <= k);
            }
        }
        assert!(full > 0, "a burst of 500 random ids overflows the far buckets");
        assert_eq!(table.len(), table.contacts().count());
    }

    #[test]
    fn existing_contact_moves_to_most_recent() {
        let me = NodeId::from_bytes([0u8; 32]);
        let mut table = RoutingTable::new(me, 3);
        let now = Instant::now();
        let a = id_with_prefix(0x80, 1);
        let b = id_with_prefix(0x80, 2);
        let c = id_with_prefix(0x80, 3);
        for id in [a, b, c] {
            table.update(contact(id), now);
        }
        assert_eq!(table.update(contact(a), now), TouchOutcome::Refreshed);

        let d = id_with_prefix(0x80, 4);
        match table.update(contact(d), now) {
            TouchOutcome::Full(pending) => assert_eq!(pending.oldest.id, b),
            other => panic!("expected full bucket, got {other:?}"),
        }
    }

    #[test]
    fn touch_keeps_announced_capabilities() {
        let me = NodeId::from_bytes([0u8; 32]);
        let mut table = RoutingTable::new(me, 3);
        let now = Instant::now();
        let (a, b) = (id_with_prefix(0x80, 1), id_with_prefix(0x80, 2));
        let mut announced = contact(a).with_role(NodeRole::Relay);
        announced.capabilities.insert(Capability::Beacon);
        table.update(announced, now);
        table.update(contact(b), now);

        assert!(table.touch(&a, "10.0.0.7:9000", 42, now));
        let stored = table.get(&a).unwrap();
        assert_eq!(stored.addr, "10.0.0.7:9000");
        assert_eq!(stored.last_seen, 42);
        assert_eq!(stored.role, NodeRole::Relay);
        assert!(stored.has(Capability::Beacon) && stored.has(Capability::Routing));
        // touched contact is now the most recently seen
        assert_eq!(table.contacts().last().map(|c| c.id), Some(a));

        assert!(!table.touch(&NodeId::random(), "10.0.0.8:9000", 42, now));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn live_oldest_keeps_its_slot() {
        let me = NodeId::from_bytes([0u8; 32]);
        let mut table = RoutingTable::new(me, 2);
        let now = Instant::now();
        let a = id_with_prefix(0x80, 1);
        let b = id_with_prefix(0x80, 2);
        let c = id_with_prefix(0x80, 3);
        table.update(contact(a), now);
        table.update(contact(b), now);

        let TouchOutcome::Full(pending) = table.update(contact(c), now) else {
            panic!("bucket should be full");
        };
        assert_eq!(table.apply_probe_result(pending, true), ProbeResolution::Kept);
        assert!(table.contains(&a));
        assert!(!table.contains(&c));

        // a is now most recent, so b is the next probe target
        let TouchOutcome::Full(pending) = table.update(contact(c), now) else {
            panic!("bucket should still be full");
        };
        assert_eq!(pending.oldest.id, b);
    }

    #[test]
    fn dead_oldest_is_replaced() {
        let me = NodeId::from_bytes([0u8; 32]);
        let mut table = RoutingTable::new(me, 2);
        let now = Instant::now();
        let a = id_with_prefix(0x80, 1);
        let b = id_with_prefix(0x80, 2);
        let c = id_with_prefix(0x80, 3);
        table.update(contact(a), now);
        table.update(contact(b), now);

        let TouchOutcome::Full(pending) = table.update(contact(c), now) else {
            panic!("bucket should be full");
        };
        match table.apply_probe_result(pending, false) {
            ProbeResolution::Replaced { evicted } => assert_eq!(evicted.id, a),
            other => panic!("expected replacement, got {other:?}"),
        }
        assert!(!table.contains(&a));
        assert!(table.contains(&b));
        assert!(table.contains(&c));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn closest_is_sorted_by_distance() {
        let me = NodeId::random();
        let mut table = RoutingTable::new(me, 20);
        let now = Instant::now();
        for _ in 0..300 {
            table.update(contact(NodeId::random()), now);
        }
        for _ in 0..20 {
            let target = NodeId::random();
            let result = table.closest(&target, 16).expect("non-empty table");
            assert_eq!(result.len(), 16);
            for pair in result.windows(2) {
                let da = pair[0].id.xor_distance(&target);
                let db = pair[1].id.xor_distance(&target);
                assert_ne!(distance_cmp(&da, &db), std::cmp::Ordering::Greater);
            }
            // nothing outside the result is closer than its farthest member
            let farthest = result[result.len() - 1].id.xor_distance(&target);
            let closer_outside = table
                .contacts()
                .filter(|c| !result.contains(c))
                .any(|c| distance_cmp(&c.id.xor_distance(&target), &farthest) == std::cmp::Ordering::Less);
            assert!(!closer_outside);
        }
    }

    #[test]
    fn random_id_for_bucket_lands_in_bucket() {
        let me = NodeId::random();
        let table = RoutingTable::new(me, 20);
        for bucket in [0, 1, 7, 8, 100, 254, 255] {
            let id = table.random_id_for_bucket(bucket);
            assert_eq!(bucket_index(&me, &id), bucket);
        }
    }

    #[test]
    fn stale_and_underpopulated_buckets() {
        let me = NodeId::from_bytes([0u8; 32]);
        let mut table = RoutingTable::new(me, 2);
        let start = Instant::now();
        table.update(contact(id_with_prefix(0x80, 1)), start);
        table.update(contact(id_with_prefix(0x40, 1)), start);

        let later = start + Duration::from_secs(120);
        assert_eq!(table.stale_buckets(Duration::from_secs(60), later), vec![0, 1]);
        table.mark_bucket_refreshed(0, later);
        assert_eq!(table.stale_buckets(Duration::from_secs(60), later), vec![1]);

        assert_eq!(table.underpopulated_buckets(), vec![0, 1, 2]);
    }

    #[test]
    fn insertion_limiter_exhausts_per_peer() {
        let mut limiter = InsertionLimiter::new();
        let noisy = NodeId::random();
        let quiet = NodeId::random();
        let now = Instant::now();
        let allowed = (0..INSERTION_PER_PEER_LIMIT * 2)
            .filter(|_| limiter.allow(&noisy, now))
            .count();
        assert_eq!(allowed, INSERTION_PER_PEER_LIMIT);
        assert!(limiter.allow(&quiet, now));
        assert!(limiter.allow(&noisy, now + INSERTION_RATE_WINDOW));
    }
}
