// In-process DHT: a handful of simulated storage nodes
//
// Each store goes to every online node, so taking nodes offline between
// stores produces forked index copies the way a real DHT does under churn.

use super::{DhtError, DhtStorage, Result};
use crate::crypto::Hash256;
use crate::packet::{DeletionSecret, DhtPacket, EncryptedEmailPacket, IndexPacket, PacketType};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Default)]
struct StorageNode {
    online: bool,
    emails: HashMap<Hash256, EncryptedEmailPacket>,
    indexes: HashMap<Hash256, IndexPacket>,
    email_deletions: HashMap<Hash256, DeletionSecret>,
    index_deletions: HashMap<(Hash256, Hash256), DeletionSecret>,
}

/// Operation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DhtStats {
    pub email_stores: usize,
    pub index_stores: usize,
    pub email_lookups: usize,
    pub index_lookups: usize,
    pub deletions: usize,
}

#[derive(Default)]
struct Counters {
    email_stores: AtomicUsize,
    index_stores: AtomicUsize,
    email_lookups: AtomicUsize,
    index_lookups: AtomicUsize,
    deletions: AtomicUsize,
}

pub struct MemoryDht {
    nodes: RwLock<Vec<StorageNode>>,
    quorum: usize,
    ready: watch::Sender<bool>,
    counters: Counters,
}

impl MemoryDht {
    /// Single storage node, ready immediately
    pub fn new() -> Self {
        Self::with_nodes(1, 1)
    }

    /// `node_count` storage nodes; a store needs `quorum` of them online
    pub fn with_nodes(node_count: usize, quorum: usize) -> Self {
        let nodes = (0..node_count.max(1))
            .map(|_| StorageNode {
                online: true,
                ..Default::default()
            })
            .collect();
        let (ready, _) = watch::channel(true);
        Self {
            nodes: RwLock::new(nodes),
            quorum: quorum.max(1),
            ready,
            counters: Counters::default(),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.send_replace(ready);
    }

    pub fn set_node_online(&self, index: usize, online: bool) {
        if let Some(node) = self.nodes.write().get_mut(index) {
            node.online = online;
        }
    }

    pub fn stats(&self) -> DhtStats {
        DhtStats {
            email_stores: self.counters.email_stores.load(Ordering::Relaxed),
            index_stores: self.counters.index_stores.load(Ordering::Relaxed),
            email_lookups: self.counters.email_lookups.load(Ordering::Relaxed),
            index_lookups: self.counters.index_lookups.load(Ordering::Relaxed),
            deletions: self.counters.deletions.load(Ordering::Relaxed),
        }
    }

    /// Number of email packets held by online nodes (distinct keys)
    pub fn email_packet_count(&self) -> usize {
        let nodes = self.nodes.read();
        let mut keys: Vec<&Hash256> = nodes
            .iter()
            .filter(|n| n.online)
            .flat_map(|n| n.emails.keys())
            .collect();
        keys.sort();
        keys.dedup();
        keys.len()
    }

    fn check_ready(&self) -> Result<()> {
        if *self.ready.borrow() {
            Ok(())
        } else {
            Err(DhtError::NotReady)
        }
    }

    fn check_quorum(&self, nodes: &[StorageNode]) -> Result<()> {
        let reached = nodes.iter().filter(|n| n.online).count();
        if reached < self.quorum {
            return Err(DhtError::NoQuorum {
                reached,
                required: self.quorum,
            });
        }
        Ok(())
    }
}

impl Default for MemoryDht {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DhtStorage for MemoryDht {
    async fn store(&self, packet: DhtPacket) -> Result<()> {
        self.check_ready()?;
        let now = crate::unix_time() as u32;
        let mut nodes = self.nodes.write();
        self.check_quorum(&nodes)?;

        match packet {
            DhtPacket::Email(mut email) => {
                self.counters.email_stores.fetch_add(1, Ordering::Relaxed);
                email.store_time = now;
                for node in nodes.iter_mut().filter(|n| n.online) {
                    // a deleted packet stays deleted
                    if node.email_deletions.contains_key(&email.dht_key) {
                        continue;
                    }
                    node.emails.entry(email.dht_key).or_insert_with(|| email.clone());
                }
                tracing::trace!(key = %email.dht_key.short(), "Stored email packet");
            }
            DhtPacket::Index(mut index) => {
                self.counters.index_stores.fetch_add(1, Ordering::Relaxed);
                index.set_store_time(now);
                let recipient = index.recipient;
                for node in nodes.iter_mut().filter(|n| n.online) {
                    let mut incoming = index.clone();
                    let deleted: Vec<Hash256> = incoming
                        .entries()
                        .map(|e| e.email_packet_key)
                        .filter(|key| node.index_deletions.contains_key(&(recipient, *key)))
                        .collect();
                    for key in &deleted {
                        incoming.remove(key);
                    }
                    node.indexes
                        .entry(recipient)
                        .or_insert_with(|| IndexPacket::new(recipient))
                        .merge_from(&incoming);
                }
                tracing::trace!(recipient = %recipient.short(), "Stored index packet");
            }
        }
        Ok(())
    }

    async fn find_one(&self, key: &Hash256, packet_type: PacketType) -> Result<Option<DhtPacket>> {
        Ok(self.find_all(key, packet_type).await?.into_iter().next())
    }

    async fn find_all(&self, key: &Hash256, packet_type: PacketType) -> Result<Vec<DhtPacket>> {
        self.check_ready()?;
        let nodes = self.nodes.read();
        let mut found: Vec<DhtPacket> = Vec::new();
        match packet_type {
            PacketType::Email => {
                self.counters.email_lookups.fetch_add(1, Ordering::Relaxed);
                for node in nodes.iter().filter(|n| n.online) {
                    if let Some(packet) = node.emails.get(key) {
                        let packet = DhtPacket::Email(packet.clone());
                        if !found.contains(&packet) {
                            found.push(packet);
                        }
                    }
                }
            }
            PacketType::Index => {
                self.counters.index_lookups.fetch_add(1, Ordering::Relaxed);
                for node in nodes.iter().filter(|n| n.online) {
                    if let Some(packet) = node.indexes.get(key) {
                        let packet = DhtPacket::Index(packet.clone());
                        if !found.contains(&packet) {
                            found.push(packet);
                        }
                    }
                }
            }
            other => {
                tracing::debug!("find_all for non-DHT packet type {:?}", other);
            }
        }
        Ok(found)
    }

    async fn delete_email_packet(&self, key: &Hash256, secret: &DeletionSecret) -> Result<()> {
        self.check_ready()?;
        let mut nodes = self.nodes.write();
        let mut authorized = false;
        for node in nodes.iter_mut().filter(|n| n.online) {
            let matches = node
                .emails
                .get(key)
                .map(|p| secret.verifies(&p.deletion_hash))
                .unwrap_or(false);
            if matches {
                node.emails.remove(key);
                node.email_deletions.insert(*key, *secret);
                authorized = true;
            } else if node.email_deletions.contains_key(key) {
                authorized = true;
            }
        }
        if !authorized {
            return Err(DhtError::Unauthorized(*key));
        }
        self.counters.deletions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete_index_entry(
        &self,
        recipient: &Hash256,
        key: &Hash256,
        secret: &DeletionSecret,
    ) -> Result<()> {
        self.check_ready()?;
        let mut nodes = self.nodes.write();
        let mut authorized = false;
        for node in nodes.iter_mut().filter(|n| n.online) {
            let Some(index) = node.indexes.get_mut(recipient) else {
                continue;
            };
            let matches = index
                .get(key)
                .map(|e| secret.verifies(&e.deletion_hash))
                .unwrap_or(false);
            if matches {
                index.remove(key);
                node.index_deletions.insert((*recipient, *key), *secret);
                authorized = true;
            }
        }
        if !authorized {
            return Err(DhtError::Unauthorized(*key));
        }
        Ok(())
    }

    async fn find_delete_authorization(
        &self,
        key: &Hash256,
        deletion_hash: &Hash256,
    ) -> Result<Option<DeletionSecret>> {
        self.check_ready()?;
        let nodes = self.nodes.read();
        Ok(nodes
            .iter()
            .filter(|n| n.online)
            .filter_map(|n| n.email_deletions.get(key))
            .find(|secret| secret.verifies(deletion_hash))
            .copied())
    }

    fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.ready.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await;
        waited.is_ok_and(|changed| changed.is_ok())
    }

    fn peer_count(&self) -> usize {
        self.nodes.read().iter().filter(|n| n.online).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SchemeId;
    use crate::packet::IndexEntry;

    fn email_packet(secret: &DeletionSecret) -> EncryptedEmailPacket {
        EncryptedEmailPacket::new(SchemeId::EcP256, vec![1, 2, 3, 4], secret.verification_hash())
    }

    fn index_with(recipient: Hash256, key: Hash256, secret: &DeletionSecret) -> IndexPacket {
        let mut index = IndexPacket::new(recipient);
        index.put(IndexEntry {
            email_packet_key: key,
            deletion_hash: secret.verification_hash(),
            store_time: 0,
        });
        index
    }

    #[tokio::test]
    async fn test_store_and_find_email() {
        let dht = MemoryDht::new();
        let secret = DeletionSecret::random();
        let packet = email_packet(&secret);
        dht.store(DhtPacket::Email(packet.clone())).await.unwrap();

        let found = dht.find_one(&packet.dht_key, PacketType::Email).await.unwrap().unwrap();
        match found {
            DhtPacket::Email(p) => {
                assert_eq!(p.ciphertext, packet.ciphertext);
                assert!(p.store_time > 0);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(dht.stats().email_stores, 1);
        assert_eq!(dht.stats().email_lookups, 1);
    }

    #[tokio::test]
    async fn test_index_stores_merge() {
        let dht = MemoryDht::new();
        let recipient = Hash256::digest(b"r");
        let s1 = DeletionSecret::random();
        let s2 = DeletionSecret::random();
        dht.store(DhtPacket::Index(index_with(recipient, Hash256::digest(b"1"), &s1))).await.unwrap();
        dht.store(DhtPacket::Index(index_with(recipient, Hash256::digest(b"2"), &s2))).await.unwrap();

        let all = dht.find_all(&recipient, PacketType::Index).await.unwrap();
        assert_eq!(all.len(), 1);
        match &all[0] {
            DhtPacket::Index(index) => assert_eq!(index.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_forked_index_copies() {
        let dht = MemoryDht::with_nodes(2, 1);
        let recipient = Hash256::digest(b"r");
        let secret = DeletionSecret::random();

        dht.set_node_online(0, false);
        dht.store(DhtPacket::Index(index_with(recipient, Hash256::digest(b"a"), &secret))).await.unwrap();
        dht.set_node_online(0, true);
        dht.set_node_online(1, false);
        dht.store(DhtPacket::Index(index_with(recipient, Hash256::digest(b"b"), &secret))).await.unwrap();
        dht.set_node_online(1, true);

        let copies = dht.find_all(&recipient, PacketType::Index).await.unwrap();
        assert_eq!(copies.len(), 2);
    }

    #[tokio::test]
    async fn test_no_quorum() {
        let dht = MemoryDht::with_nodes(3, 2);
        dht.set_node_online(0, false);
        dht.set_node_online(1, false);
        let result = dht.store(DhtPacket::Email(email_packet(&DeletionSecret::random()))).await;
        assert_eq!(result, Err(DhtError::NoQuorum { reached: 1, required: 2 }));
    }

    #[tokio::test]
    async fn test_not_ready() {
        let dht = MemoryDht::new();
        dht.set_ready(false);
        assert!(!dht.is_ready());
        assert!(!dht.wait_ready(Duration::from_millis(10)).await);
        assert_eq!(
            dht.find_one(&Hash256::digest(b"x"), PacketType::Email).await,
            Err(DhtError::NotReady)
        );
        dht.set_ready(true);
        assert!(dht.wait_ready(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_wait_ready_wakes_when_ready() {
        let dht = std::sync::Arc::new(MemoryDht::new());
        dht.set_ready(false);
        let setter = dht.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            setter.set_ready(true);
        });
        assert!(dht.wait_ready(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_deletion_requires_secret_and_is_recorded() {
        let dht = MemoryDht::new();
        let secret = DeletionSecret::random();
        let packet = email_packet(&secret);
        dht.store(DhtPacket::Email(packet.clone())).await.unwrap();

        let wrong = DeletionSecret::random();
        assert_eq!(
            dht.delete_email_packet(&packet.dht_key, &wrong).await,
            Err(DhtError::Unauthorized(packet.dht_key))
        );
        assert!(dht
            .find_delete_authorization(&packet.dht_key, &packet.deletion_hash)
            .await
            .unwrap()
            .is_none());

        dht.delete_email_packet(&packet.dht_key, &secret).await.unwrap();
        assert!(dht.find_one(&packet.dht_key, PacketType::Email).await.unwrap().is_none());
        assert_eq!(
            dht.find_delete_authorization(&packet.dht_key, &packet.deletion_hash)
                .await
                .unwrap(),
            Some(secret)
        );

        // deleted packets are not stored again
        dht.store(DhtPacket::Email(packet.clone())).await.unwrap();
        assert!(dht.find_one(&packet.dht_key, PacketType::Email).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_index_entry_deletion() {
        let dht = MemoryDht::new();
        let recipient = Hash256::digest(b"r");
        let key = Hash256::digest(b"k");
        let secret = DeletionSecret::random();
        let index = index_with(recipient, key, &secret);
        dht.store(DhtPacket::Index(index.clone())).await.unwrap();

        dht.delete_index_entry(&recipient, &key, &secret).await.unwrap();
        dht.store(DhtPacket::Index(index)).await.unwrap();

        match dht.find_one(&recipient, PacketType::Index).await.unwrap() {
            Some(DhtPacket::Index(index)) => assert!(index.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
    }
}
