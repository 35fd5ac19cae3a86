//! # Datagram Transports
//!
//! Two [`Transport`] implementations share one inbound convention: binding
//! returns the transport together with an `mpsc::Receiver<Inbound>` that
//! yields `(from_addr, bytes)` for every datagram received. The node worker
//! drains that receiver.
//!
//! - [`UdpTransport`]: one tokio UDP socket, with a spawned receive loop.
//! - [`MemoryNetwork`] / [`MemoryTransport`]: an in-process switch for
//!   tests. Addresses can be blocked (sends fail with `Unreachable`, like a
//!   refused connection) or isolated (traffic to and from them is silently
//!   dropped, like a crashed host or a cut link).

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::OverlayError;
use crate::messages::MAX_DATAGRAM_SIZE;
use crate::protocols::Transport;

/// `(from_addr, bytes)` as handed to the node.
pub type Inbound = (String, Vec<u8>);

/// Datagrams queued per endpoint before further arrivals are dropped.
pub const INBOUND_QUEUE_DEPTH: usize = 1024;

// ============================================================================
// UDP
// ============================================================================

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<(Arc<Self>, mpsc::Receiver<Inbound>)> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("binding UDP socket on {addr}"))?;
        let local = socket.local_addr().context("reading bound address")?;
        let socket = Arc::new(socket);
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        tokio::spawn(recv_loop(socket.clone(), tx));
        debug!(%local, "UDP transport bound");
        Ok((Arc::new(Self { socket, local }), rx))
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.local
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<Inbound>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                if tx.send((from.to_string(), buf[..len].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "UDP receive failed");
            }
        }
    }
    trace!("UDP receive loop stopped");
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, addr: &str, bytes: Vec<u8>) -> Result<(), OverlayError> {
        let to: SocketAddr = addr
            .parse()
            .map_err(|_| OverlayError::Unreachable(format!("invalid address {addr}")))?;
        self.socket
            .send_to(&bytes, to)
            .await
            .map_err(|e| OverlayError::Unreachable(format!("{addr}: {e}")))?;
        Ok(())
    }

    fn local_addr(&self) -> String {
        self.local.to_string()
    }
}

// ============================================================================
// In-memory network
// ============================================================================

#[derive(Default)]
struct Switch {
    endpoints: HashMap<String, mpsc::Sender<Inbound>>,
    blocked: HashSet<String>,
    isolated: HashSet<String>,
}

/// Shared in-process switch. Cloning yields another handle to the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    switch: Arc<Mutex<Switch>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Switch> {
        self.switch.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an endpoint at `addr`, replacing any previous one.
    pub fn attach(&self, addr: impl Into<String>) -> (Arc<MemoryTransport>, mpsc::Receiver<Inbound>) {
        let addr = addr.into();
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        self.lock().endpoints.insert(addr.clone(), tx);
        let transport = MemoryTransport {
            addr,
            network: self.clone(),
        };
        (Arc::new(transport), rx)
    }

    pub fn detach(&self, addr: &str) {
        self.lock().endpoints.remove(addr);
    }

    /// Sends to `addr` fail with `Unreachable`.
    pub fn block(&self, addr: &str) {
        self.lock().blocked.insert(addr.to_string());
    }

    /// Traffic to and from `addr` vanishes without error.
    pub fn isolate(&self, addr: &str) {
        self.lock().isolated.insert(addr.to_string());
    }

    pub fn heal(&self, addr: &str) {
        let mut switch = self.lock();
        switch.blocked.remove(addr);
        switch.isolated.remove(addr);
    }

    fn route(&self, from: &str, to: &str) -> Result<Option<mpsc::Sender<Inbound>>, OverlayError> {
        let switch = self.lock();
        if switch.blocked.contains(to) {
            return Err(OverlayError::Unreachable(format!("{to} is blocked")));
        }
        if switch.isolated.contains(to) || switch.isolated.contains(from) {
            return Ok(None);
        }
        switch
            .endpoints
            .get(to)
            .cloned()
            .map(Some)
            .ok_or_else(|| OverlayError::Unreachable(format!("no endpoint at {to}")))
    }
}

pub struct MemoryTransport {
    addr: String,
    network: MemoryNetwork,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, addr: &str, bytes: Vec<u8>) -> Result<(), OverlayError> {
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(OverlayError::Codec(format!("datagram of {} bytes too large", bytes.len())));
        }
        let Some(tx) = self.network.route(&self.addr, addr)? else {
            trace!(from = %self.addr, to = %addr, "datagram dropped by isolation");
            return Ok(());
        };
        // full queue behaves like a lossy link
        if tx.try_send((self.addr.clone(), bytes)).is_err() {
            trace!(to = %addr, "inbound queue full or closed; datagram dropped");
        }
        Ok(())
    }

    fn local_addr(&self) -> String {
        self.addr.clone()
    }
}
