// In-process network: every joined node gets an unbounded inbox
//
// Used by tests, the self-test command and single-process setups. Nodes can
// be taken offline to simulate unreachable peers.

use super::{Destination, NodeKeys, Result, Transport, TransportError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

type Datagram = (Vec<u8>, Destination);

/// Shared switchboard connecting `LocalTransport`s
#[derive(Default)]
pub struct LocalNetwork {
    inboxes: RwLock<HashMap<Destination, mpsc::UnboundedSender<Datagram>>>,
    offline: RwLock<HashSet<Destination>>,
    delivered: AtomicU64,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node to the network
    pub fn join(self: &Arc<Self>, keys: &NodeKeys) -> LocalTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        let destination = keys.destination();
        self.inboxes.write().insert(destination, tx);
        self.offline.write().remove(&destination);
        tracing::debug!(node = %destination.short(), "Joined local network");
        LocalTransport {
            network: Arc::clone(self),
            local: destination,
            inbox: Mutex::new(rx),
        }
    }

    /// Take a node off the network (or bring it back) without detaching it
    pub fn set_online(&self, destination: &Destination, online: bool) {
        let mut offline = self.offline.write();
        if online {
            offline.remove(destination);
        } else {
            offline.insert(*destination);
        }
    }

    pub fn is_online(&self, destination: &Destination) -> bool {
        self.inboxes.read().contains_key(destination) && !self.offline.read().contains(destination)
    }

    /// Detach a node; its transport's `receive` then returns `Closed`
    pub fn leave(&self, destination: &Destination) {
        self.inboxes.write().remove(destination);
    }

    /// Total datagrams delivered so far
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    fn deliver(&self, data: &[u8], from: Destination, to: &Destination) -> Result<()> {
        if self.offline.read().contains(to) || self.offline.read().contains(&from) {
            return Err(TransportError::PeerUnreachable(*to));
        }
        let inboxes = self.inboxes.read();
        let inbox = inboxes.get(to).ok_or(TransportError::PeerUnreachable(*to))?;
        inbox
            .send((data.to_vec(), from))
            .map_err(|_| TransportError::PeerUnreachable(*to))?;
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// One node's endpoint on a `LocalNetwork`
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    local: Destination,
    inbox: Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

impl LocalTransport {
    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn local_destination(&self) -> Destination {
        self.local
    }

    async fn send(&self, data: &[u8], to: &Destination) -> Result<()> {
        self.network.deliver(data, self.local, to)
    }

    async fn receive(&self) -> Result<(Vec<u8>, Destination)> {
        let mut inbox = self.inbox.lock().await;
        loop {
            let (data, from) = inbox.recv().await.ok_or(TransportError::Closed)?;
            // datagrams queued while we were offline are lost
            if self.network.offline.read().contains(&self.local) {
                continue;
            }
            return Ok((data, from));
        }
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.network.leave(&self.local);
    }
}
