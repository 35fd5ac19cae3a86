//! # Group Engine
//!
//! Local replicas of chat groups and the machinery that keeps them
//! consistent.
//!
//! ## State model
//!
//! A group's mutable state is a map of [`StateKey`] to the latest
//! [`StateUpdate`] for that key: one entry per member (role or removal
//! tombstone), the policy, and a dissolution flag. Every local change bumps
//! our component of the group's [`VectorClock`] and is stamped with
//! `(wall_ms, origin, counter)`.
//!
//! Concurrent updates to the same key resolve last-writer-wins: the larger
//! wall-clock timestamp wins, and an exact tie goes to the smaller origin id.
//! Merging is idempotent and commutative, so replicas that exchanged deltas
//! in both directions hold identical clocks and identical state.
//!
//! ## Sync
//!
//! A replica announces its clock with `SyncRequest`. The receiver compares:
//!
//! | Requester's clock | Reply |
//! |-------------------|-------|
//! | equal | nothing |
//! | behind | `SyncDelta` with everything the requester has not seen |
//! | ahead | `SyncRequest` with our clock, asking for their delta |
//! | concurrent | both |
//!
//! ## Broadcast
//!
//! Group messages travel down a [`SpanningTree`] rooted at the sender. The
//! tree is a deterministic function of `(member set, root, fanout)`, so every
//! replica at the same membership epoch computes the same edges. A
//! [`BroadcastCache`] makes delivery to the application at-most-once per
//! message even when copies arrive over redundant links.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::num::NonZeroUsize;

use bloomfilter::Bloom;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::error::OverlayError;
use crate::identity::NodeId;
use crate::messages::{GroupBody, MessageId};
use crate::security::KeyHandle;

/// Bloom filter false positive rate for the broadcast dedup filter.
const BLOOM_FP_RATE: f64 = 0.01;

/// Spanning trees cached across (group, epoch, root) combinations.
const MAX_CACHED_TREES: usize = 256;

// ============================================================================
// Identifiers and roles
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId([u8; 32]);

impl GroupId {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Derive a fresh id for a group created by `owner`.
    pub fn derive(owner: &NodeId, name: &str, nonce: u64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(owner.as_bytes());
        hasher.update(name.as_bytes());
        hasher.update(&nonce.to_be_bytes());
        Self(*hasher.finalize().as_bytes())
    }
}

impl std::fmt::Debug for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GroupId({})", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    Member,
    Admin,
    Owner,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPolicy {
    /// Least role allowed to invite or remove members.
    pub invite: Role,
    pub max_members: usize,
}

impl Default for GroupPolicy {
    fn default() -> Self {
        Self {
            invite: Role::Admin,
            max_members: 256,
        }
    }
}

// ============================================================================
// Vector clock
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockOrdering {
    Equal,
    Before,
    After,
    Concurrent,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock(BTreeMap<NodeId, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &NodeId) -> u64 {
        self.0.get(id).copied().unwrap_or(0)
    }

    pub fn increment(&mut self, id: NodeId) -> u64 {
        let counter = self.0.entry(id).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Pointwise maximum.
    pub fn merge(&mut self, other: &VectorClock) {
        for (id, counter) in &other.0 {
            let mine = self.0.entry(*id).or_insert(0);
            *mine = (*mine).max(*counter);
        }
    }

    /// Where `self` stands relative to `other`.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut behind = false;
        let mut ahead = false;
        for id in self.0.keys().chain(other.0.keys()) {
            let (mine, theirs) = (self.get(id), other.get(id));
            behind |= mine < theirs;
            ahead |= mine > theirs;
        }
        match (behind, ahead) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    pub fn components(&self) -> impl Iterator<Item = (&NodeId, &u64)> {
        self.0.iter()
    }
}

// ============================================================================
// Replicated state
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StateKey {
    Member(NodeId),
    Policy,
    Dissolved,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateValue {
    /// `None` is a removal tombstone.
    Member(Option<Role>),
    Policy(GroupPolicy),
    Dissolved,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    pub wall_ms: u64,
    pub origin: NodeId,
    /// Origin's clock component when the update was made.
    pub counter: u64,
}

impl Stamp {
    /// Last-writer-wins: later wall clock, then smaller origin id.
    pub fn supersedes(&self, other: &Stamp) -> bool {
        if self.wall_ms != other.wall_ms {
            return self.wall_ms > other.wall_ms;
        }
        if self.origin != other.origin {
            return self.origin < other.origin;
        }
        self.counter > other.counter
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub key: StateKey,
    pub value: StateValue,
    pub stamp: Stamp,
}

/// Notifications surfaced to the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GroupEvent {
    Created,
    Joined { inviter: NodeId },
    MemberAdded { member: NodeId, role: Role },
    MemberRemoved { member: NodeId },
    RoleChanged { member: NodeId, role: Role },
    PolicyChanged(GroupPolicy),
    Dissolved,
    Message { sender: NodeId, plaintext: Vec<u8> },
    /// Members unreachable; broadcasts to them are suspended.
    Partitioned { unreachable: Vec<NodeId> },
    Resumed { reachable: Vec<NodeId> },
}

#[derive(Clone, Debug)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub owner: NodeId,
    pub key: KeyHandle,
    clock: VectorClock,
    entries: BTreeMap<StateKey, StateUpdate>,
    /// Bumped whenever the member set changes.
    epoch: u64,
}

impl Group {
    pub fn new(id: GroupId, name: impl Into<String>, owner: NodeId, key: KeyHandle) -> Self {
        Self {
            id,
            name: name.into(),
            owner,
            key,
            clock: VectorClock::new(),
            entries: BTreeMap::new(),
            epoch: 0,
        }
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn members(&self) -> BTreeMap<NodeId, Role> {
        self.entries
            .iter()
            .filter_map(|(key, update)| match (key, &update.value) {
                (StateKey::Member(id), StateValue::Member(Some(role))) => Some((*id, *role)),
                _ => None,
            })
            .collect()
    }

    pub fn member_ids(&self) -> BTreeSet<NodeId> {
        self.members().into_keys().collect()
    }

    pub fn role_of(&self, id: &NodeId) -> Option<Role> {
        match self.entries.get(&StateKey::Member(*id)).map(|u| &u.value) {
            Some(StateValue::Member(role)) => *role,
            _ => None,
        }
    }

    pub fn policy(&self) -> GroupPolicy {
        match self.entries.get(&StateKey::Policy).map(|u| &u.value) {
            Some(StateValue::Policy(policy)) => *policy,
            _ => GroupPolicy::default(),
        }
    }

    pub fn is_dissolved(&self) -> bool {
        self.entries.contains_key(&StateKey::Dissolved)
    }

    /// Every current entry; used to seed invitees.
    pub fn snapshot(&self) -> Vec<StateUpdate> {
        self.entries.values().cloned().collect()
    }

    /// Record a change made locally by `origin`.
    ///
    /// The stamp never falls behind the entry it replaces, so a change made
    /// after observing another always supersedes it.
    pub fn local_update(&mut self, origin: NodeId, key: StateKey, value: StateValue, wall_ms: u64) -> (StateUpdate, Option<GroupEvent>) {
        let floor = self.entries.get(&key).map_or(0, |u| u.stamp.wall_ms + 1);
        let counter = self.clock.increment(origin);
        let update = StateUpdate {
            key,
            value,
            stamp: Stamp {
                wall_ms: wall_ms.max(floor),
                origin,
                counter,
            },
        };
        let event = self.apply(update.clone());
        (update, event)
    }

    /// Last-writer-wins merge of a single update.
    pub fn apply(&mut self, update: StateUpdate) -> Option<GroupEvent> {
        if let Some(current) = self.entries.get(&update.key)
            && !update.stamp.supersedes(&current.stamp)
        {
            return None;
        }
        let previous = self.entries.insert(update.key, update.clone()).map(|u| u.value);
        let event = match (&update.key, &update.value) {
            (StateKey::Member(member), StateValue::Member(now)) => {
                let before = match previous {
                    Some(StateValue::Member(role)) => role,
                    _ => None,
                };
                match (before, *now) {
                    (None, Some(role)) => Some(GroupEvent::MemberAdded { member: *member, role }),
                    (Some(_), None) => Some(GroupEvent::MemberRemoved { member: *member }),
                    (Some(old), Some(new)) if old != new => Some(GroupEvent::RoleChanged { member: *member, role: new }),
                    _ => None,
                }
            }
            (StateKey::Policy, StateValue::Policy(policy)) => Some(GroupEvent::PolicyChanged(*policy)),
            (StateKey::Dissolved, _) => Some(GroupEvent::Dissolved),
            _ => None,
        };
        if matches!(event, Some(GroupEvent::MemberAdded { .. }) | Some(GroupEvent::MemberRemoved { .. })) {
            self.epoch += 1;
        }
        event
    }

    /// Entries the holder of `their` has not seen.
    pub fn delta_for(&self, their: &VectorClock) -> Vec<StateUpdate> {
        self.entries
            .values()
            .filter(|u| u.stamp.counter > their.get(&u.stamp.origin))
            .cloned()
            .collect()
    }

    /// Merge a delta and the sender's clock.
    pub fn merge(&mut self, updates: Vec<StateUpdate>, their: &VectorClock) -> Vec<GroupEvent> {
        let events = updates.into_iter().filter_map(|u| self.apply(u)).collect();
        self.clock.merge(their);
        events
    }
}

// ============================================================================
// Spanning tree
// ============================================================================

/// Broadcast tree over member ids: the root first, then the remaining
/// members by XOR distance from the root, laid out as a `fanout`-ary heap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpanningTree {
    root: NodeId,
    fanout: usize,
    order: Vec<NodeId>,
}

impl SpanningTree {
    pub fn build(root: NodeId, members: &BTreeSet<NodeId>, fanout: usize) -> Self {
        let mut rest: Vec<NodeId> = members.iter().copied().filter(|m| *m != root).collect();
        rest.sort_by(|a, b| a.xor_distance(&root).cmp(&b.xor_distance(&root)));
        let mut order = Vec::with_capacity(rest.len() + 1);
        order.push(root);
        order.extend(rest);
        Self {
            root,
            fanout: fanout.max(1),
            order,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn children_of(&self, id: &NodeId) -> Vec<NodeId> {
        let Some(pos) = self.order.iter().position(|m| m == id) else {
            return Vec::new();
        };
        let first = pos * self.fanout + 1;
        if first >= self.order.len() {
            return Vec::new();
        }
        let last = (first + self.fanout).min(self.order.len());
        self.order[first..last].to_vec()
    }

    pub fn parent_of(&self, id: &NodeId) -> Option<NodeId> {
        let pos = self.order.iter().position(|m| m == id)?;
        if pos == 0 {
            return None;
        }
        Some(self.order[(pos - 1) / self.fanout])
    }
}

// ============================================================================
// Broadcast dedup
// ============================================================================

type BroadcastKey = (GroupId, MessageId);

/// Seen-set for group broadcasts: a bloom filter for fast "definitely new"
/// answers in front of an exact, TTL-bounded LRU.
///
/// The filter always covers every key in the exact cache. A key that has
/// been evicted from the exact cache but still tests positive in the filter
/// is treated as new, which can re-deliver a very old duplicate but never
/// drops a fresh message.
pub struct BroadcastCache {
    bloom: Bloom<BroadcastKey>,
    exact: LruCache<BroadcastKey, Instant>,
    ttl: Duration,
    capacity: usize,
    inserted_since_reset: usize,
}

impl BroadcastCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            bloom: Bloom::new_for_fp_rate(capacity, BLOOM_FP_RATE),
            exact: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
            ttl,
            capacity,
            inserted_since_reset: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.exact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }

    /// Record the key; `true` the first time it is seen within the TTL.
    pub fn first_sighting(&mut self, group: GroupId, message: MessageId, now: Instant) -> bool {
        let key = (group, message);
        if self.bloom.check(&key)
            && let Some(seen) = self.exact.peek(&key)
            && now.saturating_duration_since(*seen) <= self.ttl
        {
            return false;
        }
        self.exact.put(key, now);
        self.bloom.set(&key);
        self.inserted_since_reset += 1;
        if self.inserted_since_reset >= self.capacity.saturating_mul(2) {
            self.rebuild_bloom();
        }
        true
    }

    /// Drop exact records older than the TTL.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        while let Some((_, seen)) = self.exact.peek_lru() {
            if now.saturating_duration_since(*seen) <= self.ttl {
                break;
            }
            self.exact.pop_lru();
            removed += 1;
        }
        removed
    }

    fn rebuild_bloom(&mut self) {
        let mut bloom = Bloom::new_for_fp_rate(self.capacity, BLOOM_FP_RATE);
        for (key, _) in self.exact.iter() {
            bloom.set(key);
        }
        self.bloom = bloom;
        self.inserted_since_reset = self.exact.len();
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Messages the caller must send as a result of a sync exchange.
#[derive(Debug, Clone)]
pub struct SyncReply {
    pub to: NodeId,
    pub body: GroupBody,
}

pub struct GroupEngine {
    self_id: NodeId,
    fanout: usize,
    groups: HashMap<GroupId, Group>,
    trees: LruCache<(GroupId, u64, NodeId), SpanningTree>,
    dedup: BroadcastCache,
}

impl GroupEngine {
    pub fn new(self_id: NodeId, fanout: usize, dedup_capacity: usize, dedup_ttl: Duration) -> Self {
        Self {
            self_id,
            fanout: fanout.max(1),
            groups: HashMap::new(),
            trees: LruCache::new(NonZeroUsize::new(MAX_CACHED_TREES).unwrap_or(NonZeroUsize::MIN)),
            dedup: BroadcastCache::new(dedup_capacity, dedup_ttl),
        }
    }

    pub fn get(&self, id: &GroupId) -> Option<&Group> {
        self.groups.get(id)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn group_ids(&self) -> Vec<GroupId> {
        self.groups.keys().copied().collect()
    }

    fn group_mut(&mut self, id: &GroupId) -> Result<&mut Group, OverlayError> {
        self.groups.get_mut(id).ok_or(OverlayError::UnknownGroup(*id))
    }

    fn require_role(group: &Group, who: &NodeId, least: Role, action: &str) -> Result<(), OverlayError> {
        match group.role_of(who) {
            Some(role) if role >= least => Ok(()),
            _ => Err(OverlayError::NotPermitted(format!("{action} requires {least:?}"))),
        }
    }

    /// Create a group owned by us with `members` as initial members.
    pub fn create(&mut self, name: &str, key: KeyHandle, members: &[NodeId], wall_ms: u64) -> GroupId {
        let id = GroupId::derive(&self.self_id, name, rand::random());
        let mut group = Group::new(id, name, self.self_id, key);
        group.local_update(self.self_id, StateKey::Member(self.self_id), StateValue::Member(Some(Role::Owner)), wall_ms);
        group.local_update(self.self_id, StateKey::Policy, StateValue::Policy(GroupPolicy::default()), wall_ms);
        for member in members.iter().filter(|m| **m != self.self_id) {
            group.local_update(self.self_id, StateKey::Member(*member), StateValue::Member(Some(Role::Member)), wall_ms);
        }
        debug!(group = %hex::encode(&id.as_bytes()[..8]), members = members.len(), "group created");
        self.groups.insert(id, group);
        id
    }

    pub fn invite(&mut self, group_id: &GroupId, member: NodeId, wall_ms: u64) -> Result<GroupEvent, OverlayError> {
        let self_id = self.self_id;
        let group = self.group_mut(group_id)?;
        let policy = group.policy();
        Self::require_role(group, &self_id, policy.invite, "invite")?;
        if group.role_of(&member).is_some() {
            return Err(OverlayError::NotPermitted("already a member".into()));
        }
        if group.member_ids().len() >= policy.max_members {
            return Err(OverlayError::NotPermitted("group is full".into()));
        }
        let (_, event) = group.local_update(self_id, StateKey::Member(member), StateValue::Member(Some(Role::Member)), wall_ms);
        event.ok_or_else(|| OverlayError::StaleUpdate("invite superseded".into()))
    }

    pub fn remove_member(&mut self, group_id: &GroupId, member: NodeId, wall_ms: u64) -> Result<GroupEvent, OverlayError> {
        let self_id = self.self_id;
        let group = self.group_mut(group_id)?;
        Self::require_role(group, &self_id, group.policy().invite, "remove")?;
        match group.role_of(&member) {
            None => return Err(OverlayError::NotPermitted("not a member".into())),
            Some(Role::Owner) => return Err(OverlayError::NotPermitted("the owner cannot be removed".into())),
            Some(_) => {}
        }
        let (_, event) = group.local_update(self_id, StateKey::Member(member), StateValue::Member(None), wall_ms);
        event.ok_or_else(|| OverlayError::StaleUpdate("removal superseded".into()))
    }

    pub fn set_role(&mut self, group_id: &GroupId, member: NodeId, role: Role, wall_ms: u64) -> Result<GroupEvent, OverlayError> {
        let self_id = self.self_id;
        let group = self.group_mut(group_id)?;
        Self::require_role(group, &self_id, Role::Owner, "changing roles")?;
        if role == Role::Owner || member == group.owner {
            return Err(OverlayError::NotPermitted("ownership cannot be transferred".into()));
        }
        if group.role_of(&member).is_none() {
            return Err(OverlayError::NotPermitted("not a member".into()));
        }
        let (_, event) = group.local_update(self_id, StateKey::Member(member), StateValue::Member(Some(role)), wall_ms);
        event.ok_or_else(|| OverlayError::StaleUpdate("role unchanged".into()))
    }

    pub fn set_policy(&mut self, group_id: &GroupId, policy: GroupPolicy, wall_ms: u64) -> Result<GroupEvent, OverlayError> {
        let self_id = self.self_id;
        let group = self.group_mut(group_id)?;
        Self::require_role(group, &self_id, Role::Owner, "changing policy")?;
        let (_, event) = group.local_update(self_id, StateKey::Policy, StateValue::Policy(policy), wall_ms);
        event.ok_or_else(|| OverlayError::StaleUpdate("policy superseded".into()))
    }

    /// Leave a group. Returns the remaining members to notify; the local
    /// replica is dropped.
    pub fn leave(&mut self, group_id: &GroupId, wall_ms: u64) -> Result<(Vec<NodeId>, GroupBody), OverlayError> {
        let self_id = self.self_id;
        let group = self.group_mut(group_id)?;
        if group.role_of(&self_id) == Some(Role::Owner) {
            return Err(OverlayError::NotPermitted("the owner dissolves instead of leaving".into()));
        }
        group.local_update(self_id, StateKey::Member(self_id), StateValue::Member(None), wall_ms);
        let notify: Vec<NodeId> = group.member_ids().into_iter().collect();
        let body = GroupBody::SyncDelta {
            group_id: *group_id,
            updates: group.snapshot(),
            clock: group.clock().clone(),
        };
        self.groups.remove(group_id);
        Ok((notify, body))
    }

    /// Mark the group dissolved. The replica stays until members are told.
    pub fn dissolve(&mut self, group_id: &GroupId, wall_ms: u64) -> Result<GroupEvent, OverlayError> {
        let self_id = self.self_id;
        let group = self.group_mut(group_id)?;
        Self::require_role(group, &self_id, Role::Owner, "dissolving")?;
        let (_, event) = group.local_update(self_id, StateKey::Dissolved, StateValue::Dissolved, wall_ms);
        event.ok_or_else(|| OverlayError::StaleUpdate("already dissolved".into()))
    }

    /// Drop a local replica (after dissolution or our own removal).
    pub fn forget(&mut self, group_id: &GroupId) -> Option<Group> {
        self.groups.remove(group_id)
    }

    /// Invitation carrying a full snapshot for `member`.
    pub fn invite_body(&self, group_id: &GroupId, member: &NodeId, sealed_key: Vec<u8>) -> Result<GroupBody, OverlayError> {
        let group = self.groups.get(group_id).ok_or(OverlayError::UnknownGroup(*group_id))?;
        Ok(GroupBody::Invite {
            group_id: *group_id,
            name: group.name.clone(),
            owner: group.owner,
            role: group.role_of(member).unwrap_or(Role::Member),
            sealed_key,
            updates: group.snapshot(),
            clock: group.clock().clone(),
        })
    }

    /// Install a replica from an invitation.
    #[allow(clippy::too_many_arguments)]
    pub fn accept_invite(
        &mut self,
        inviter: NodeId,
        group_id: GroupId,
        name: String,
        owner: NodeId,
        key: KeyHandle,
        updates: Vec<StateUpdate>,
        clock: &VectorClock,
    ) -> Vec<GroupEvent> {
        if let Some(existing) = self.groups.get_mut(&group_id) {
            return existing.merge(updates, clock);
        }
        let mut group = Group::new(group_id, name, owner, key);
        group.merge(updates, clock);
        if group.role_of(&self.self_id).is_none() || group.is_dissolved() {
            debug!(group = %hex::encode(&group_id.as_bytes()[..8]), "ignoring invite that does not list us");
            return Vec::new();
        }
        self.groups.insert(group_id, group);
        vec![GroupEvent::Joined { inviter }]
    }

    /// Members other than us.
    pub fn peers(&self, group_id: &GroupId) -> Result<Vec<NodeId>, OverlayError> {
        let group = self.groups.get(group_id).ok_or(OverlayError::UnknownGroup(*group_id))?;
        Ok(group.member_ids().into_iter().filter(|m| *m != self.self_id).collect())
    }

    pub fn sync_request(&self, group_id: &GroupId) -> Result<GroupBody, OverlayError> {
        let group = self.groups.get(group_id).ok_or(OverlayError::UnknownGroup(*group_id))?;
        Ok(GroupBody::SyncRequest {
            group_id: *group_id,
            clock: group.clock().clone(),
        })
    }

    /// Full-state delta, safe to send to a peer whose clock is unknown.
    pub fn announce(&self, group_id: &GroupId) -> Result<GroupBody, OverlayError> {
        let group = self.groups.get(group_id).ok_or(OverlayError::UnknownGroup(*group_id))?;
        Ok(GroupBody::SyncDelta {
            group_id: *group_id,
            updates: group.snapshot(),
            clock: group.clock().clone(),
        })
    }

    /// React to a peer's clock announcement.
    pub fn on_sync_request(&self, from: NodeId, group_id: &GroupId, their: &VectorClock) -> Result<Vec<SyncReply>, OverlayError> {
        let group = self.groups.get(group_id).ok_or(OverlayError::UnknownGroup(*group_id))?;
        if group.role_of(&from).is_none() {
            return Err(OverlayError::NotPermitted("sync from non-member".into()));
        }
        let delta = || SyncReply {
            to: from,
            body: GroupBody::SyncDelta {
                group_id: *group_id,
                updates: group.delta_for(their),
                clock: group.clock().clone(),
            },
        };
        let request = || SyncReply {
            to: from,
            body: GroupBody::SyncRequest {
                group_id: *group_id,
                clock: group.clock().clone(),
            },
        };
        Ok(match their.compare(group.clock()) {
            ClockOrdering::Equal => Vec::new(),
            ClockOrdering::Before => vec![delta()],
            ClockOrdering::After => vec![request()],
            ClockOrdering::Concurrent => vec![delta(), request()],
        })
    }

    /// Merge a delta. Returns the application events and whether the merge
    /// resolved concurrent histories (the caller then re-announces).
    pub fn on_sync_delta(
        &mut self,
        from: NodeId,
        group_id: &GroupId,
        updates: Vec<StateUpdate>,
        their: &VectorClock,
    ) -> Result<(Vec<GroupEvent>, bool), OverlayError> {
        let self_id = self.self_id;
        let group = self.group_mut(group_id)?;
        if group.role_of(&from).is_none() && !updates.iter().any(|u| u.stamp.origin == from) {
            return Err(OverlayError::NotPermitted("delta from non-member".into()));
        }
        let concurrent = group.clock().compare(their) == ClockOrdering::Concurrent;
        let events = group.merge(updates, their);
        let removed_self = group.role_of(&self_id).is_none();
        let dissolved = group.is_dissolved();
        if removed_self || dissolved {
            self.groups.remove(group_id);
        }
        Ok((events, concurrent && !removed_self && !dissolved))
    }

    /// Tree children of us for a broadcast rooted at `root`, over the member
    /// set minus `suspended`.
    pub fn children(&mut self, group_id: &GroupId, root: NodeId, suspended: &BTreeSet<NodeId>) -> Result<Vec<NodeId>, OverlayError> {
        let group = self.groups.get(group_id).ok_or(OverlayError::UnknownGroup(*group_id))?;
        let cache_key = (*group_id, group.epoch(), root);
        if suspended.is_empty()
            && let Some(tree) = self.trees.get(&cache_key)
        {
            return Ok(tree.children_of(&self.self_id));
        }
        let live: BTreeSet<NodeId> = group
            .member_ids()
            .into_iter()
            .filter(|m| !suspended.contains(m) || *m == self.self_id)
            .collect();
        let tree = SpanningTree::build(root, &live, self.fanout);
        let children = tree.children_of(&self.self_id);
        if suspended.is_empty() {
            self.trees.put(cache_key, tree);
        }
        Ok(children)
    }

    pub fn first_sighting(&mut self, group_id: GroupId, message_id: MessageId, now: Instant) -> bool {
        self.dedup.first_sighting(group_id, message_id, now)
    }

    pub fn expire_dedup(&mut self, now: Instant) -> usize {
        self.dedup.expire(now)
    }

    /// Groups in which any of `nodes` is a member, with those members.
    pub fn affected_by(&self, nodes: &BTreeSet<NodeId>) -> Vec<(GroupId, Vec<NodeId>)> {
        self.groups
            .values()
            .filter_map(|g| {
                let hit: Vec<NodeId> = g.member_ids().intersection(nodes).copied().collect();
                (!hit.is_empty()).then_some((g.id, hit))
            })
            .collect()
    }
}
