//! # Request/Response over Datagrams
//!
//! Discovery needs request/response semantics (ping → pong, find-node →
//! nodes) on top of a fire-and-forget transport. The pieces:
//!
//! - [`OverlayRpc`]: cheap-to-clone handle implementing [`DiscoveryRpc`].
//!   Each call posts a [`CallRequest`] to the node worker and awaits the
//!   matching reply under `rpc_timeout`.
//! - [`PendingCalls`]: owned by the worker. Maps request ids to waiting
//!   callers; answers complete them, [`PendingCalls::sweep`] drops the
//!   expired ones so no caller waits past its deadline.
//!
//! Responses are matched on `(request_id, responder)`: an answer from an
//! unexpected peer is ignored rather than completing someone else's call.
//! Each call also carries a fresh [`Challenge`]; the worker checks the
//! responder's answer to it before completing the call, so every contact a
//! call returns has proven it holds its identity key.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tracing::trace;

use crate::identity::{Contact, NodeId};
use crate::messages::Challenge;
use crate::protocols::DiscoveryRpc;

/// Upper bound on simultaneously outstanding calls.
pub const MAX_PENDING_CALLS: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallKind {
    Ping,
    FindNode(NodeId),
}

#[derive(Clone, Debug)]
pub enum CallReply {
    Pong(Contact),
    Nodes(Vec<Contact>),
}

/// A call the worker should put on the wire.
#[derive(Debug)]
pub struct CallRequest {
    pub addr: String,
    /// Responder we expect; `None` when only the address is known (seeds).
    pub expected: Option<NodeId>,
    pub kind: CallKind,
    pub reply: oneshot::Sender<CallReply>,
}

struct PendingCall {
    expected: Option<NodeId>,
    challenge: Challenge,
    deadline: Instant,
    reply: oneshot::Sender<CallReply>,
}

#[derive(Default)]
pub struct PendingCalls {
    calls: HashMap<u64, PendingCall>,
    next_id: u64,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            calls: HashMap::new(),
            next_id: rand::random(),
        }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Returns the request id and challenge to put on the wire, or `None`
    /// when full (the caller's reply sender is dropped, failing the call).
    pub fn register(
        &mut self,
        expected: Option<NodeId>,
        reply: oneshot::Sender<CallReply>,
        deadline: Instant,
    ) -> Option<(u64, Challenge)> {
        if self.calls.len() >= MAX_PENDING_CALLS {
            return None;
        }
        self.next_id = self.next_id.wrapping_add(1);
        let id = self.next_id;
        let challenge: Challenge = rand::random();
        self.calls.insert(
            id,
            PendingCall {
                expected,
                challenge,
                deadline,
                reply,
            },
        );
        Some((id, challenge))
    }

    /// Challenge issued with `request_id`, if `responder` may answer it.
    pub fn challenge(&self, request_id: u64, responder: &NodeId) -> Option<Challenge> {
        self.calls
            .get(&request_id)
            .filter(|call| call.expected.is_none_or(|e| &e == responder))
            .map(|call| call.challenge)
    }

    /// Fail a call without an answer.
    pub fn abandon(&mut self, request_id: u64) -> bool {
        self.calls.remove(&request_id).is_some()
    }

    /// Deliver an answer. `false` if nothing was waiting for it.
    pub fn complete(&mut self, request_id: u64, responder: &NodeId, answer: CallReply) -> bool {
        match self.calls.get(&request_id) {
            Some(call) if call.expected.is_none_or(|e| &e == responder) => {}
            Some(_) => {
                trace!(request_id, responder = %responder.short(), "answer from unexpected peer");
                return false;
            }
            None => return false,
        }
        let Some(call) = self.calls.remove(&request_id) else {
            return false;
        };
        call.reply.send(answer).is_ok()
    }

    /// Drop calls past their deadline. Returns how many were dropped.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.calls.len();
        self.calls.retain(|_, call| call.deadline > now && !call.reply.is_closed());
        before - self.calls.len()
    }
}

/// [`DiscoveryRpc`] backed by the node worker.
#[derive(Clone)]
pub struct OverlayRpc {
    calls: mpsc::UnboundedSender<CallRequest>,
    timeout: Duration,
}

impl OverlayRpc {
    pub fn new(calls: mpsc::UnboundedSender<CallRequest>, timeout: Duration) -> Self {
        Self { calls, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn call(&self, addr: &str, expected: Option<NodeId>, kind: CallKind) -> Result<CallReply> {
        let (reply, rx) = oneshot::channel();
        self.calls
            .send(CallRequest {
                addr: addr.to_string(),
                expected,
                kind,
                reply,
            })
            .map_err(|_| anyhow!("node worker closed"))?;
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(_)) => Err(anyhow!("call to {addr} abandoned")),
            Err(_) => Err(anyhow!("call to {addr} timed out")),
        }
    }

    /// Ping an address whose identity is not yet known.
    pub async fn ping_addr(&self, addr: &str) -> Result<Contact> {
        match self.call(addr, None, CallKind::Ping).await? {
            CallReply::Pong(contact) => Ok(contact),
            CallReply::Nodes(_) => Err(anyhow!("unexpected reply to ping")),
        }
    }
}

#[async_trait]
impl DiscoveryRpc for OverlayRpc {
    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>> {
        match self.call(&to.addr, Some(to.id), CallKind::FindNode(target)).await? {
            CallReply::Nodes(contacts) => Ok(contacts),
            CallReply::Pong(_) => Err(anyhow!("unexpected reply to find_node")),
        }
    }

    async fn ping(&self, to: &Contact) -> Result<Contact> {
        match self.call(&to.addr, Some(to.id), CallKind::Ping).await? {
            CallReply::Pong(contact) => Ok(contact),
            CallReply::Nodes(_) => Err(anyhow!("unexpected reply to ping")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completion_requires_expected_responder() {
        let mut pending = PendingCalls::new();
        let (tx, rx) = oneshot::channel();
        let peer = NodeId::random();
        let (id, challenge) = pending.register(Some(peer), tx, Instant::now() + Duration::from_secs(1)).unwrap();
        assert_eq!(pending.challenge(id, &peer), Some(challenge));
        assert_eq!(pending.challenge(id, &NodeId::random()), None);

        assert!(!pending.complete(id, &NodeId::random(), CallReply::Nodes(Vec::new())));
        assert!(!pending.complete(id.wrapping_add(1), &peer, CallReply::Nodes(Vec::new())));
        assert!(pending.complete(id, &peer, CallReply::Nodes(Vec::new())));
        assert!(matches!(rx.await, Ok(CallReply::Nodes(_))));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn address_only_calls_accept_any_responder() {
        let mut pending = PendingCalls::new();
        let (tx, rx) = oneshot::channel();
        let (id, _) = pending.register(None, tx, Instant::now() + Duration::from_secs(1)).unwrap();
        let responder = Contact::new(NodeId::random(), "10.0.0.9:4000");
        assert!(pending.complete(id, &responder.id, CallReply::Pong(responder.clone())));
        match rx.await {
            Ok(CallReply::Pong(c)) => assert_eq!(c.id, responder.id),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn abandoned_calls_fail_and_get_fresh_challenges() {
        let mut pending = PendingCalls::new();
        let peer = NodeId::random();
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + Duration::from_secs(1);
        let (first, first_challenge) = pending.register(Some(peer), tx, deadline).unwrap();
        let (tx2, _rx2) = oneshot::channel();
        let (_, second_challenge) = pending.register(Some(peer), tx2, deadline).unwrap();
        assert_ne!(first_challenge, second_challenge);

        assert!(pending.abandon(first));
        assert!(!pending.abandon(first));
        assert!(rx.await.is_err());
        assert_eq!(pending.challenge(first, &peer), None);
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn sweep_fails_expired_calls() {
        let mut pending = PendingCalls::new();
        let now = Instant::now();
        let (tx, rx) = oneshot::channel();
        pending.register(None, tx, now + Duration::from_millis(10)).unwrap();
        let (tx2, _rx2) = oneshot::channel();
        pending.register(None, tx2, now + Duration::from_secs(10)).unwrap();

        assert_eq!(pending.sweep(now + Duration::from_millis(20)), 1);
        assert!(rx.await.is_err());
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn rpc_times_out_when_nobody_answers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let rpc = OverlayRpc::new(tx, Duration::from_millis(50));
        let handle = tokio::spawn(async move { rpc.ping_addr("10.0.0.1:4000").await });
        let request = rx.recv().await.unwrap();
        assert_eq!(request.kind, CallKind::Ping);
        assert!(request.expected.is_none());
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("timed out"));
        drop(request);
    }
}
