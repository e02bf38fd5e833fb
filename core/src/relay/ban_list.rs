// Process-wide list of misbehaving peers
//
// A peer speaking an incompatible protocol version is banned; the ban is
// lifted as soon as the same peer is seen with a compatible version.

use crate::transport::Destination;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanEntry {
    pub reason: String,
    /// Unix timestamp of the ban
    pub since: u64,
}

#[derive(Default)]
pub struct BanList {
    banned: RwLock<HashMap<Destination, BanEntry>>,
}

impl BanList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ban `peer`. Returns true if it was not banned before.
    pub fn ban(&self, peer: Destination, reason: &str) -> bool {
        let entry = BanEntry {
            reason: reason.to_string(),
            since: crate::unix_time(),
        };
        let newly = self.banned.write().insert(peer, entry).is_none();
        if newly {
            tracing::warn!(peer = %peer.short(), "🚫 Banned peer: {}", reason);
        }
        newly
    }

    /// Lift a ban. Returns true if the peer was banned.
    pub fn unban(&self, peer: &Destination) -> bool {
        let lifted = self.banned.write().remove(peer).is_some();
        if lifted {
            tracing::info!(peer = %peer.short(), "Lifted ban");
        }
        lifted
    }

    pub fn is_banned(&self, peer: &Destination) -> bool {
        self.banned.read().contains_key(peer)
    }

    pub fn entry(&self, peer: &Destination) -> Option<BanEntry> {
        self.banned.read().get(peer).cloned()
    }

    pub fn banned_peers(&self) -> Vec<Destination> {
        self.banned.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.banned.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.banned.read().is_empty()
    }
}
