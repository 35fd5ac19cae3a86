//! Collaborator traits the node is written against.
//!
//! | Seam | Trait | Provided implementations |
//! |------|-------|--------------------------|
//! | Datagram I/O | [`Transport`] | [`UdpTransport`](crate::transport::UdpTransport), [`MemoryTransport`](crate::transport::MemoryTransport) |
//! | Cryptography | [`Security`] | [`SigningSecurity`](crate::security::SigningSecurity) |
//! | Upcalls | [`Application`] | [`ChannelApplication`] |
//! | Lookup queries | [`DiscoveryRpc`] | [`OverlayRpc`](crate::rpc::OverlayRpc) |
//!
//! Discovery depends only on [`DiscoveryRpc`], so lookups can be driven by a
//! test double without a running node.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{CryptoError, OverlayError};
use crate::group::{GroupEvent, GroupId};
use crate::identity::{Contact, NodeId};
use crate::messages::MessageId;
use crate::security::KeyHandle;

/// Unreliable datagram transport. Connection-level problems surface as
/// [`OverlayError::Unreachable`], never as corrupted payloads.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, addr: &str, bytes: Vec<u8>) -> Result<(), OverlayError>;

    /// Address peers should use to reach us.
    fn local_addr(&self) -> String;
}

/// Opaque cryptographic capability. Failures are never retried; the affected
/// message is discarded.
pub trait Security: Send + Sync + 'static {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn verify(&self, signer: &NodeId, data: &[u8], signature: &[u8]) -> Result<(), CryptoError>;

    fn encrypt(&self, plaintext: &[u8], key: &KeyHandle) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(&self, ciphertext: &[u8], key: &KeyHandle) -> Result<Vec<u8>, CryptoError>;

    /// Answer a challenge issued by a peer.
    fn respond(&self, challenge: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Check a peer's response to a challenge we issued.
    fn authenticate(&self, peer: &NodeId, challenge: &[u8], response: &[u8]) -> Result<bool, CryptoError>;

    fn generate_group_key(&self) -> Result<KeyHandle, CryptoError>;

    /// Key handle for one-to-one traffic with `peer`.
    fn pairwise_key(&self, peer: &NodeId) -> Result<KeyHandle, CryptoError>;

    /// Wrap a group key so only `recipient` can open it.
    fn seal_key_for(&self, recipient: &NodeId, key: &KeyHandle) -> Result<Vec<u8>, CryptoError>;

    fn open_key(&self, sender: &NodeId, sealed: &[u8]) -> Result<KeyHandle, CryptoError>;

    /// Whether [`Security::encrypt`] actually hides content.
    fn confidential(&self) -> bool;
}

/// Upcalls into the application layer. Called from the node worker; must
/// not block.
pub trait Application: Send + Sync + 'static {
    fn on_message_delivered(&self, sender: NodeId, plaintext: Vec<u8>);

    fn on_group_event(&self, group: GroupId, event: GroupEvent);

    fn on_delivery_failed(&self, message_id: MessageId, reason: OverlayError);
}

/// Lookup queries issued by discovery.
#[async_trait]
pub trait DiscoveryRpc: Send + Sync + 'static {
    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>>;

    /// Returns the responder's own contact record.
    async fn ping(&self, to: &Contact) -> Result<Contact>;
}

// ============================================================================
// Channel-backed application
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    Delivered { sender: NodeId, plaintext: Vec<u8> },
    Group { group: GroupId, event: GroupEvent },
    Failed { message_id: MessageId, reason: OverlayError },
}

/// Forwards every upcall into an unbounded channel.
#[derive(Clone)]
pub struct ChannelApplication {
    tx: mpsc::UnboundedSender<AppEvent>,
}

impl ChannelApplication {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AppEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Application for ChannelApplication {
    fn on_message_delivered(&self, sender: NodeId, plaintext: Vec<u8>) {
        let _ = self.tx.send(AppEvent::Delivered { sender, plaintext });
    }

    fn on_group_event(&self, group: GroupId, event: GroupEvent) {
        let _ = self.tx.send(AppEvent::Group { group, event });
    }

    fn on_delivery_failed(&self, message_id: MessageId, reason: OverlayError) {
        let _ = self.tx.send(AppEvent::Failed { message_id, reason });
    }
}
