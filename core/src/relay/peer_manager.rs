// Relay peer management
//
// Keeps a bounded set of relay peers, seeded from the peer file or the
// bootstrap list. Each update round asks every known peer for its peer list,
// records one reachability sample per peer (answered or not), merges the
// peers learned from the answers and evicts the least reachable peers once
// the set is over its cap. A peer without samples is never evicted.

use super::{BanList, RelayError, RelayPeer, Result};
use crate::config::PeerConfig;
use crate::network::{PacketDispatcher, PacketListener, SendQueue};
use crate::packet::{
    Packet, PeerList, PeerListRequest, ResponsePacket, ResponseStatus, WirePacket,
};
use crate::service::Shutdown;
use crate::transport::Destination;
use async_trait::async_trait;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Upper bound on peers in one peer list response
const MAX_LISTED_PEERS: usize = 1000;

/// Outcome of one update round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateRound {
    pub asked: usize,
    pub responded: usize,
    pub learned: usize,
    pub evicted: usize,
}

pub struct RelayPeerManager {
    local: Destination,
    config: PeerConfig,
    ban_list: Arc<BanList>,
    peers: RwLock<BTreeMap<Destination, RelayPeer>>,
    changed: Notify,
}

impl RelayPeerManager {
    pub fn new(local: Destination, config: PeerConfig, ban_list: Arc<BanList>) -> Self {
        Self {
            local,
            config,
            ban_list,
            peers: RwLock::new(BTreeMap::new()),
            changed: Notify::new(),
        }
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    fn threshold(&self) -> u32 {
        self.config.reachability_threshold_percent as u32
    }

    // ========================================================================
    // Peer set
    // ========================================================================

    /// Add a peer unless it is us, banned or already known
    pub fn add_peer(&self, destination: Destination) -> bool {
        if destination == self.local || self.ban_list.is_banned(&destination) {
            return false;
        }
        let added = {
            let mut peers = self.peers.write();
            if peers.contains_key(&destination) {
                false
            } else {
                peers.insert(destination, RelayPeer::new(destination, self.config.sample_window));
                Self::evict_excess(&mut peers, self.config.max_peers);
                true
            }
        };
        if added {
            debug!(peer = %destination.short(), "Added relay peer");
            self.changed.notify_waiters();
        }
        added
    }

    /// Add several peers, returning how many were new
    pub fn add_peers(&self, destinations: impl IntoIterator<Item = Destination>) -> usize {
        destinations
            .into_iter()
            .filter(|d| self.add_peer(*d))
            .count()
    }

    pub fn remove_peer(&self, destination: &Destination) -> bool {
        self.peers.write().remove(destination).is_some()
    }

    pub fn contains(&self, destination: &Destination) -> bool {
        self.peers.read().contains_key(destination)
    }

    pub fn peer(&self, destination: &Destination) -> Option<RelayPeer> {
        self.peers.read().get(destination).cloned()
    }

    pub fn peers(&self) -> Vec<RelayPeer> {
        self.peers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Record one reachability sample
    pub fn record_sample(&self, destination: &Destination, responded: bool) {
        if let Some(peer) = self.peers.write().get_mut(destination) {
            peer.add_sample(responded);
        }
        self.changed.notify_waiters();
    }

    /// Drop peers that got banned since they were added
    pub fn purge_banned(&self) -> usize {
        let mut peers = self.peers.write();
        let before = peers.len();
        peers.retain(|destination, _| !self.ban_list.is_banned(destination));
        before - peers.len()
    }

    /// Evict the least reachable sampled peers while above `max`. Ties go to
    /// the first peer in key order.
    fn evict_excess(peers: &mut BTreeMap<Destination, RelayPeer>, max: usize) -> usize {
        let mut evicted = 0;
        while peers.len() > max {
            let mut worst: Option<(Destination, u32)> = None;
            for peer in peers.values().filter(|p| p.has_samples()) {
                let reachability = peer.reachability();
                if worst.map_or(true, |(_, r)| reachability < r) {
                    worst = Some((peer.destination(), reachability));
                }
            }
            let Some((destination, reachability)) = worst else {
                break;
            };
            peers.remove(&destination);
            evicted += 1;
            debug!(peer = %destination.short(), reachability, "🗑️ Evicted relay peer");
        }
        evicted
    }

    pub fn evict(&self) -> usize {
        Self::evict_excess(&mut self.peers.write(), self.config.max_peers)
    }

    // ========================================================================
    // Selection
    // ========================================================================

    /// Peers at or above the reachability threshold
    pub fn good_peers(&self) -> Vec<Destination> {
        let threshold = self.threshold();
        self.peers
            .read()
            .values()
            .filter(|p| p.reachability() >= threshold)
            .filter(|p| !self.ban_list.is_banned(&p.destination()))
            .map(|p| p.destination())
            .collect()
    }

    /// Good peers that have actually answered at least once
    pub fn proven_peer_count(&self) -> usize {
        let threshold = self.threshold();
        self.peers
            .read()
            .values()
            .filter(|p| p.has_samples() && p.reachability() >= threshold)
            .count()
    }

    /// Wait until `n` good peers exist, then pick `n` of them at random
    pub async fn get_random_peers(&self, n: usize) -> Vec<Destination> {
        loop {
            let notified = self.changed.notified();
            let good = self.good_peers();
            if good.len() >= n {
                return good
                    .choose_multiple(&mut rand::thread_rng(), n)
                    .copied()
                    .collect();
            }
            debug!(have = good.len(), need = n, "Waiting for reachable relay peers");
            notified.await;
        }
    }

    /// Peer list sent in answer to `requester`
    pub fn peer_list_for(&self, requester: &Destination) -> PeerList {
        let peers = self
            .good_peers()
            .into_iter()
            .filter(|d| d != requester)
            .take(self.config.max_peers.min(MAX_LISTED_PEERS))
            .collect();
        PeerList { peers }
    }

    /// Short interval while no peer has proven reachable, long afterwards
    pub fn next_update_interval(&self) -> Duration {
        if self.proven_peer_count() == 0 {
            self.config.fast_update_interval()
        } else {
            self.config.update_interval()
        }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Seed the peer set from the peer file, falling back to the bootstrap list
    pub fn load(&self) -> Result<usize> {
        let mut loaded = 0;
        if let Some(path) = &self.config.peer_file {
            if path.exists() {
                loaded = self.load_peer_file(path)?;
            }
        }
        if loaded == 0 {
            for entry in &self.config.bootstrap_peers {
                match Destination::from_base64(entry) {
                    Ok(destination) => {
                        if self.add_peer(destination) {
                            loaded += 1;
                        }
                    }
                    Err(e) => warn!("Skipping bootstrap peer: {}", e),
                }
            }
            info!(peers = loaded, "🌐 Seeded relay peers from bootstrap list");
        }
        Ok(loaded)
    }

    fn load_peer_file(&self, path: &Path) -> Result<usize> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RelayError::PeerFile(format!("{}: {}", path.display(), e)))?;
        let mut loaded = 0;
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, samples) = line.split_once('\t').unwrap_or((line, ""));
            let parsed = Destination::from_base64(key)
                .ok()
                .zip(RelayPeer::parse_samples(samples.trim()));
            let Some((destination, samples)) = parsed else {
                warn!(line = number + 1, "Skipping malformed peer file line");
                continue;
            };
            if destination == self.local || self.ban_list.is_banned(&destination) {
                continue;
            }
            let peer = RelayPeer::with_samples(destination, self.config.sample_window, &samples);
            self.peers.write().insert(destination, peer);
            loaded += 1;
        }
        self.evict();
        self.changed.notify_waiters();
        info!(peers = loaded, path = %path.display(), "Loaded relay peers");
        Ok(loaded)
    }

    /// Write the peer file, one `destination<TAB>samples` line per peer
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.config.peer_file else {
            return Ok(());
        };
        let mut text = String::new();
        for peer in self.peers.read().values() {
            text.push_str(&peer.destination().to_base64());
            text.push('\t');
            text.push_str(&peer.samples_string());
            text.push('\n');
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RelayError::PeerFile(format!("{}: {}", parent.display(), e)))?;
        }
        std::fs::write(path, text)
            .map_err(|e| RelayError::PeerFile(format!("{}: {}", path.display(), e)))
    }

    // ========================================================================
    // Update rounds
    // ========================================================================

    /// Ask every known peer for its peer list and score the answers
    pub async fn update_round(&self, queue: &SendQueue, dispatcher: &PacketDispatcher) -> UpdateRound {
        self.purge_banned();
        let targets: Vec<Destination> = self.peers.read().keys().copied().collect();
        if targets.is_empty() {
            debug!("No relay peers to update");
            return UpdateRound::default();
        }

        let batch = dispatcher.new_batch();
        for peer in &targets {
            let request = PeerListRequest::new();
            match queue.send(&Packet::PeerListRequest(request.clone()), *peer) {
                Ok(handle) => batch.add(request.correlation_id, *peer, handle),
                Err(e) => warn!(peer = %peer.short(), "Could not queue peer list request: {}", e),
            }
        }
        let timeout = self.config.response_timeout();
        batch.await_all_sent(timeout).await;
        batch.await_all_replies(timeout).await;

        let mut learned = Vec::new();
        for (from, response) in batch.responses() {
            if response.status != ResponseStatus::Ok {
                continue;
            }
            match PeerList::from_bytes(&response.payload) {
                Ok(list) => learned.extend(list.peers),
                Err(e) => debug!(peer = %from.short(), "Bad peer list: {}", e),
            }
        }

        let mut responded = 0;
        for peer in &targets {
            let answered = batch.responded(peer);
            if answered {
                responded += 1;
            }
            self.record_sample(peer, answered);
        }
        let learned = self.add_peers(learned);
        let evicted = self.evict();

        UpdateRound {
            asked: targets.len(),
            responded,
            learned,
            evicted,
        }
    }

    /// Periodic update loop
    pub async fn run(
        self: Arc<Self>,
        queue: Arc<SendQueue>,
        dispatcher: Arc<PacketDispatcher>,
        mut shutdown: Shutdown,
    ) {
        info!(peers = self.len(), "Relay peer manager started");
        loop {
            tokio::select! {
                round = self.update_round(&queue, &dispatcher) => {
                    info!(
                        asked = round.asked,
                        responded = round.responded,
                        learned = round.learned,
                        evicted = round.evicted,
                        peers = self.len(),
                        "Relay peer update finished"
                    );
                }
                _ = shutdown.wait() => break,
            }
            if let Err(e) = self.save() {
                warn!("Could not save peer file: {}", e);
            }
            if !shutdown.sleep(self.next_update_interval()).await {
                break;
            }
        }
        if let Err(e) = self.save() {
            warn!("Could not save peer file: {}", e);
        }
        info!("Relay peer manager stopped");
    }
}

/// Answers peer list requests from other nodes
pub struct PeerListResponder {
    manager: Arc<RelayPeerManager>,
    queue: Arc<SendQueue>,
}

impl PeerListResponder {
    pub fn new(manager: Arc<RelayPeerManager>, queue: Arc<SendQueue>) -> Self {
        Self { manager, queue }
    }
}

#[async_trait]
impl PacketListener for PeerListResponder {
    async fn packet_received(&self, packet: &Packet, from: &Destination) {
        let Packet::PeerListRequest(request) = packet else {
            return;
        };
        let list = self.manager.peer_list_for(from);
        let response = match list.to_bytes() {
            Ok(payload) => ResponsePacket::new(request.correlation_id, ResponseStatus::Ok, payload),
            Err(e) => {
                warn!("Could not encode peer list: {}", e);
                ResponsePacket::new(request.correlation_id, ResponseStatus::GeneralError, Vec::new())
            }
        };
        if let Err(e) = self.queue.send(&Packet::Response(response), *from) {
            warn!(peer = %from.short(), "Could not queue peer list response: {}", e);
        }
        self.manager.add_peer(*from);
    }
}
