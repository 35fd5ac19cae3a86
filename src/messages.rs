//! # Wire Envelope
//!
//! Every datagram is one bincode-encoded [`Envelope`]:
//!
//! | Part | Contents |
//! |------|----------|
//! | [`Header`] | version, message id, kind, source, target, timestamp, ttl, signature |
//! | [`Payload`] | `encrypted` flag plus opaque body bytes |
//! | [`RoutingInfo`] | relay path, next hop, priority |
//!
//! The body inside the payload is one of [`DiscoveryBody`], [`RoutingBody`],
//! [`GroupBody`], [`ChatBody`] or [`ControlBody`], selected by
//! [`MessageKind`].
//!
//! The signature covers the header (minus `ttl` and the signature itself) and
//! the payload. `ttl` and the routing section change at every relay and are
//! not signed.
//!
//! All decoding goes through [`deserialize_bounded`], which caps allocations
//! at [`MAX_DESERIALIZE_SIZE`].

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::OverlayError;
use crate::group::{GroupId, Role, StateUpdate, VectorClock};
use crate::identity::{Contact, NodeId};
use crate::router::RouteAdvert;

pub const PROTOCOL_VERSION: u8 = 1;

/// Largest datagram we send or accept.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Maximum buffer size for deserialization.
pub const MAX_DESERIALIZE_SIZE: u64 = MAX_DATAGRAM_SIZE as u64;

/// Contacts returned by a single find-node response.
pub const MAX_CONTACTS_PER_RESPONSE: usize = 32;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

// ============================================================================
// Identifiers
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub [u8; 16]);

impl MessageId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl std::fmt::Debug for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageId({})", hex::encode(self.0))
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// ============================================================================
// Envelope
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Discovery,
    Routing,
    Group,
    Chat,
    Control,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    Node(NodeId),
    Group(GroupId),
    /// Neighbour-scoped; handled by whoever receives it and never relayed.
    Broadcast,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub version: u8,
    pub message_id: MessageId,
    pub kind: MessageKind,
    pub source: NodeId,
    pub target: Target,
    /// Wall-clock ms at origin.
    pub timestamp: u64,
    pub ttl: u8,
    pub signature: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub encrypted: bool,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingInfo {
    /// Relays this copy has passed through, oldest first.
    pub path: Vec<NodeId>,
    /// For group copies: the tree member this copy is bound for.
    pub next_hop: Option<NodeId>,
    pub priority: Priority,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    pub payload: Payload,
    pub routing: RoutingInfo,
}

#[derive(Serialize)]
struct SignedPortion<'a> {
    version: u8,
    message_id: &'a MessageId,
    kind: MessageKind,
    source: &'a NodeId,
    target: &'a Target,
    timestamp: u64,
    payload: &'a Payload,
}

impl Envelope {
    /// Unsigned envelope; the caller fills `header.signature` from
    /// [`Envelope::signing_bytes`].
    pub fn new(kind: MessageKind, source: NodeId, target: Target, timestamp: u64, ttl: u8, payload: Payload) -> Self {
        Self {
            header: Header {
                version: PROTOCOL_VERSION,
                message_id: MessageId::random(),
                kind,
                source,
                target,
                timestamp,
                ttl,
                signature: Vec::new(),
            },
            payload,
            routing: RoutingInfo::default(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.routing.priority = priority;
        self
    }

    pub fn signing_bytes(&self) -> Result<Vec<u8>, OverlayError> {
        let portion = SignedPortion {
            version: self.header.version,
            message_id: &self.header.message_id,
            kind: self.header.kind,
            source: &self.header.source,
            target: &self.header.target,
            timestamp: self.header.timestamp,
            payload: &self.payload,
        };
        Ok(serialize(&portion)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, OverlayError> {
        let bytes = serialize(self)?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(OverlayError::Codec(format!(
                "envelope of {} bytes exceeds datagram limit {}",
                bytes.len(),
                MAX_DATAGRAM_SIZE
            )));
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, OverlayError> {
        let envelope: Envelope = deserialize_bounded(bytes)?;
        if envelope.header.version != PROTOCOL_VERSION {
            return Err(OverlayError::Codec(format!(
                "unsupported protocol version {}",
                envelope.header.version
            )));
        }
        Ok(envelope)
    }

    /// The copy to hand to the next hop, or `None` when the hop budget is spent.
    pub fn relayed(&self, via: NodeId) -> Option<Envelope> {
        if self.header.ttl <= 1 {
            return None;
        }
        let mut next = self.clone();
        next.header.ttl -= 1;
        next.routing.path.push(via);
        Some(next)
    }

    /// Decode the payload bytes as a body type. Only valid for plaintext payloads.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T, OverlayError> {
        Ok(deserialize_bounded(&self.payload.bytes)?)
    }

    pub fn id(&self) -> MessageId {
        self.header.message_id
    }
}

// ============================================================================
// Bodies
// ============================================================================

/// Fresh nonce a requester asks the responder to answer with
/// [`Security::respond`](crate::protocols::Security::respond).
pub type Challenge = [u8; 32];

/// Every request carries a challenge and every answer the responder's
/// response to it; answers that fail authentication complete no call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DiscoveryBody {
    Ping { from: Contact, request_id: u64, challenge: Challenge },
    Pong { from: Contact, request_id: u64, response: Vec<u8> },
    FindNode { from: Contact, target: NodeId, request_id: u64, challenge: Challenge },
    Nodes { from: Contact, request_id: u64, contacts: Vec<Contact>, response: Vec<u8> },
    /// Local-segment announcement.
    Beacon { from: Contact },
    BeaconReply { from: Contact },
}

impl DiscoveryBody {
    pub fn sender(&self) -> &Contact {
        match self {
            DiscoveryBody::Ping { from, .. }
            | DiscoveryBody::Pong { from, .. }
            | DiscoveryBody::FindNode { from, .. }
            | DiscoveryBody::Nodes { from, .. }
            | DiscoveryBody::Beacon { from }
            | DiscoveryBody::BeaconReply { from } => from,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RoutingBody {
    Adverts(Vec<RouteAdvert>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ControlBody {
    Ack { message_id: MessageId },
    Heartbeat { nonce: u64 },
    HeartbeatAck { nonce: u64 },
}

/// Group membership and state-sync traffic.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum GroupBody {
    Invite {
        group_id: GroupId,
        name: String,
        owner: NodeId,
        role: Role,
        /// Group key sealed for the invitee by the security collaborator.
        sealed_key: Vec<u8>,
        updates: Vec<StateUpdate>,
        clock: VectorClock,
    },
    SyncRequest { group_id: GroupId, clock: VectorClock },
    SyncDelta { group_id: GroupId, updates: Vec<StateUpdate>, clock: VectorClock },
}

impl GroupBody {
    pub fn group_id(&self) -> GroupId {
        match self {
            GroupBody::Invite { group_id, .. }
            | GroupBody::SyncRequest { group_id, .. }
            | GroupBody::SyncDelta { group_id, .. } => *group_id,
        }
    }
}

/// Application text. Direct chats are addressed to a node, group chats to a
/// group and travel along the broadcast tree rooted at `header.source`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ChatBody {
    Direct { ciphertext: Vec<u8> },
    Group { ciphertext: Vec<u8> },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(ttl: u8) -> Envelope {
        let body = serialize(&ControlBody::Heartbeat { nonce: 7 }).unwrap();
        Envelope::new(
            MessageKind::Control,
            NodeId::random(),
            Target::Node(NodeId::random()),
            1_000,
            ttl,
            Payload { encrypted: false, bytes: body },
        )
    }

    #[test]
    fn relay_decrements_ttl_and_records_path() {
        let env = envelope(3);
        let relay = NodeId::random();
        let next = env.relayed(relay).expect("budget left");
        assert_eq!(next.header.ttl, 2);
        assert_eq!(next.routing.path, vec![relay]);
        assert_eq!(next.id(), env.id());
    }

    #[test]
    fn relay_drops_when_ttl_would_reach_zero() {
        assert!(envelope(1).relayed(NodeId::random()).is_none());
        assert!(envelope(0).relayed(NodeId::random()).is_none());
    }

    #[test]
    fn signing_bytes_ignore_ttl_and_routing() {
        let env = envelope(5);
        let next = env.relayed(NodeId::random()).unwrap();
        assert_eq!(env.signing_bytes().unwrap(), next.signing_bytes().unwrap());

        let mut tampered = env.clone();
        tampered.payload.bytes.push(0);
        assert_ne!(env.signing_bytes().unwrap(), tampered.signing_bytes().unwrap());
    }

    #[test]
    fn decode_rejects_other_versions_and_garbage() {
        let mut env = envelope(4);
        env.header.version = 9;
        let bytes = serialize(&env).unwrap();
        assert!(matches!(Envelope::decode(&bytes), Err(OverlayError::Codec(_))));
        assert!(Envelope::decode(&[0xff; 7]).is_err());
    }

    #[test]
    fn body_decodes_payload() {
        let env = envelope(4);
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        match decoded.body::<ControlBody>().unwrap() {
            ControlBody::Heartbeat { nonce } => assert_eq!(nonce, 7),
            other => panic!("unexpected body {other:?}"),
        }
    }
}
