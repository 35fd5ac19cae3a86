//! # Groupmesh - Serverless Overlay for Peer-to-Peer Chat
//!
//! Groupmesh lets chat peers find each other, route messages across an
//! overlay without central servers, and keep consistent group membership:
//!
//! - **Identity**: Ed25519 keypairs; the 32-byte public key is the node id
//! - **Discovery**: k-bucket routing table, iterative lookups, bootstrap
//!   seeds and an optional local-segment multicast beacon
//! - **Routing**: sequence-numbered route adverts with adaptive scoring and
//!   k-disjoint alternatives, plus buffering while a path is looked up
//! - **Delivery**: acknowledged unicast with exponential backoff
//! - **Groups**: role-checked membership replicated with vector clocks and
//!   last-writer-wins merges, broadcast over a per-group spanning tree
//! - **Liveness**: heartbeats, eviction and partition suspend/resume
//!
//! ## Architecture
//!
//! Each node is one actor: a cheap-to-clone [`Node`] handle sends commands
//! to a worker that owns all mutable state and handles one input at a time.
//! Lookups, probes, timers and transport sends run as spawned tasks that
//! post their results back to the worker.
//!
//! Transport, cryptography and the application are collaborators behind the
//! [`Transport`], [`Security`] and [`Application`] traits.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | Public handle and the serialized node worker |
//! | `identity` | Node ids, XOR metric, keypairs, contacts |
//! | `table` | k-bucket routing table with liveness-checked replacement |
//! | `discovery` | Iterative lookup and the multicast beacon |
//! | `router` | Route adverts, forwarding decisions, route buffer |
//! | `delivery` | Acknowledgement tracking and retransmission schedule |
//! | `group` | Group replicas, vector clocks, spanning trees, broadcast dedup |
//! | `failure` | Heartbeat failure detector and partition window |
//! | `rpc` | Request/response matching over datagrams |
//! | `transport` | UDP and in-memory datagram transports |
//! | `security` | Default signing [`Security`] implementation |
//! | `protocols` | Collaborator trait definitions |
//! | `messages` | Wire envelope and message bodies |
//! | `config` | TOML-loadable tunables |
//! | `error` | Error taxonomy |

mod config;
mod delivery;
mod discovery;
mod error;
mod failure;
mod group;
mod identity;
mod messages;
mod node;
mod protocols;
mod router;
mod rpc;
mod security;
mod table;
mod transport;

pub use config::{BeaconConfig, Config};
pub use error::{CryptoError, OverlayError, Result};
pub use group::{ClockOrdering, GroupEvent, GroupId, GroupPolicy, Role, VectorClock};
pub use identity::{Capability, Contact, Keypair, NodeId, NodeRole};
pub use messages::{MessageId, MessageKind, Priority, Target};
pub use node::{Node, TelemetrySnapshot};
pub use protocols::{AppEvent, Application, ChannelApplication, Security, Transport};
pub use security::{KeyHandle, SigningSecurity};
pub use transport::{Inbound, MemoryNetwork, MemoryTransport, UdpTransport};
