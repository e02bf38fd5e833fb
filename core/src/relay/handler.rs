// Relay request handling on a relay node
//
// Check the stamp, peel our layer, then either pass the inner layer on after
// a random delay or store the packet in the DHT ourselves. Final stores run
// as their own tasks, at most `MAX_PENDING_STORES` at once, so a slow DHT
// never holds up inbound dispatch. Failures are logged and the request
// dropped; the originator's outbox retries later.

use super::onion::{peel, Peeled};
use super::{pow, RelayError, Result};
use crate::config::RelayConfig;
use crate::dht::DhtStorage;
use crate::network::{PacketListener, SendQueue};
use crate::packet::{DhtPacket, Packet, RelayRequest};
use crate::transport::{Destination, NodeKeys};
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Relayed DHT stores allowed in flight before new ones are dropped
pub const MAX_PENDING_STORES: usize = 64;

pub struct RelayRequestHandler {
    keys: NodeKeys,
    queue: Arc<SendQueue>,
    dht: Arc<dyn DhtStorage>,
    config: RelayConfig,
    store_slots: Arc<Semaphore>,
    forwarded: AtomicU64,
    stored: Arc<AtomicU64>,
    rejected: Arc<AtomicU64>,
}

impl RelayRequestHandler {
    pub fn new(
        keys: NodeKeys,
        queue: Arc<SendQueue>,
        dht: Arc<dyn DhtStorage>,
        config: RelayConfig,
    ) -> Self {
        Self {
            keys,
            queue,
            dht,
            config,
            store_slots: Arc::new(Semaphore::new(MAX_PENDING_STORES)),
            forwarded: AtomicU64::new(0),
            stored: Arc::new(AtomicU64::new(0)),
            rejected: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn forwarded_count(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn stored_count(&self) -> u64 {
        self.stored.load(Ordering::Relaxed)
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    fn random_delay(&self) -> Duration {
        let (min, max) = self.config.delay_range();
        if max <= min {
            return min;
        }
        rand::thread_rng().gen_range(min..=max)
    }

    /// Check and peel a request. Forwards are queued here; a packet for the
    /// final store is handed back to the caller.
    fn accept(&self, request: &RelayRequest) -> Result<Option<DhtPacket>> {
        pow::check(request, self.config.min_pow_bits)?;
        match peel(request, &self.keys)? {
            Peeled::Forward {
                next_hop,
                request: inner,
            } => {
                let delay = self.random_delay();
                debug!(next_hop = %next_hop.short(), delay_ms = delay.as_millis() as u64, "Forwarding relay layer");
                self.queue
                    .send_delayed(&Packet::Relay(inner), next_hop, delay)?;
                self.forwarded.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Peeled::Store(packet) => Ok(Some(packet)),
        }
    }

    /// Process one relay request, waiting for the final store if there is one
    pub async fn handle(&self, request: &RelayRequest) -> Result<()> {
        if let Some(packet) = self.accept(request)? {
            debug!(key = %packet.key().short(), "Storing relayed packet");
            self.dht.store(packet).await.map_err(RelayError::from)?;
            self.stored.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn spawn_store(&self, packet: DhtPacket) {
        let Ok(permit) = self.store_slots.clone().try_acquire_owned() else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(key = %packet.key().short(), "Too many relayed stores pending, dropping");
            return;
        };
        let dht = self.dht.clone();
        let stored = self.stored.clone();
        let rejected = self.rejected.clone();
        tokio::spawn(async move {
            let key = packet.key();
            let result = dht.store(packet).await;
            drop(permit);
            match result {
                Ok(()) => {
                    debug!(key = %key.short(), "Stored relayed packet");
                    stored.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    rejected.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key.short(), "Relayed store failed: {}", e);
                }
            }
        });
    }

    pub fn pending_stores(&self) -> usize {
        MAX_PENDING_STORES - self.store_slots.available_permits()
    }
}

#[async_trait]
impl PacketListener for RelayRequestHandler {
    async fn packet_received(&self, packet: &Packet, from: &Destination) {
        let Packet::Relay(request) = packet else {
            return;
        };
        match self.accept(request) {
            Ok(Some(dht_packet)) => self.spawn_store(dht_packet),
            Ok(None) => {}
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(peer = %from.short(), "Dropped relay request: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SendQueueConfig;
    use crate::crypto::Hash256;
    use crate::dht::{self, MemoryDht};
    use crate::packet::{DeletionSecret, IndexEntry, IndexPacket, PacketType};
    use tokio::sync::Notify;
    use crate::relay::wrap_for_relays;
    use crate::service::shutdown;
    use crate::transport::{LocalNetwork, Transport};

    fn index_packet() -> DhtPacket {
        let mut index = IndexPacket::new(Hash256::digest(b"recipient"));
        index.put(IndexEntry {
            email_packet_key: Hash256::digest(b"fragment"),
            deletion_hash: Hash256::digest(b"secret"),
            store_time: 0,
        });
        DhtPacket::Index(index)
    }

    /// Stores block until released
    struct SlowDht {
        inner: MemoryDht,
        release: Notify,
    }

    #[async_trait]
    impl DhtStorage for SlowDht {
        async fn store(&self, packet: DhtPacket) -> dht::Result<()> {
            self.release.notified().await;
            self.inner.store(packet).await
        }

        async fn find_one(&self, key: &Hash256, packet_type: PacketType) -> dht::Result<Option<DhtPacket>> {
            self.inner.find_one(key, packet_type).await
        }

        async fn find_all(&self, key: &Hash256, packet_type: PacketType) -> dht::Result<Vec<DhtPacket>> {
            self.inner.find_all(key, packet_type).await
        }

        async fn delete_email_packet(&self, key: &Hash256, secret: &DeletionSecret) -> dht::Result<()> {
            self.inner.delete_email_packet(key, secret).await
        }

        async fn delete_index_entry(
            &self,
            recipient: &Hash256,
            key: &Hash256,
            secret: &DeletionSecret,
        ) -> dht::Result<()> {
            self.inner.delete_index_entry(recipient, key, secret).await
        }

        async fn find_delete_authorization(
            &self,
            key: &Hash256,
            deletion_hash: &Hash256,
        ) -> dht::Result<Option<DeletionSecret>> {
            self.inner.find_delete_authorization(key, deletion_hash).await
        }

        fn is_ready(&self) -> bool {
            self.inner.is_ready()
        }

        async fn wait_ready(&self, timeout: Duration) -> bool {
            self.inner.wait_ready(timeout).await
        }

        fn peer_count(&self) -> usize {
            self.inner.peer_count()
        }
    }

    fn relay_config() -> RelayConfig {
        RelayConfig {
            hops: 0,
            min_delay_secs: 0,
            max_delay_secs: 0,
            pow_bits_per_hop: 6,
            min_pow_bits: 6,
        }
    }

    #[tokio::test]
    async fn test_final_hop_stores_packet() {
        let network = LocalNetwork::new();
        let keys = NodeKeys::generate();
        let transport = Arc::new(network.join(&keys));
        let queue = SendQueue::new(transport, SendQueueConfig::default());
        let dht = Arc::new(MemoryDht::new());
        let handler = RelayRequestHandler::new(keys.clone(), queue, dht.clone(), relay_config());

        let packet = index_packet();
        let request = wrap_for_relays(&packet, &[keys.destination()], 6).unwrap();
        handler.handle(&request).await.unwrap();

        assert_eq!(handler.stored_count(), 1);
        let Some(DhtPacket::Index(found)) =
            dht.find_one(&packet.key(), PacketType::Index).await.unwrap()
        else {
            panic!("index packet not stored");
        };
        assert!(found.contains(&Hash256::digest(b"fragment")));
    }

    #[tokio::test]
    async fn test_slow_store_does_not_block_receiving() {
        let network = LocalNetwork::new();
        let keys = NodeKeys::generate();
        let queue = SendQueue::new(Arc::new(network.join(&keys)), SendQueueConfig::default());
        let dht = Arc::new(SlowDht {
            inner: MemoryDht::new(),
            release: Notify::new(),
        });
        let handler = RelayRequestHandler::new(keys.clone(), queue, dht.clone(), relay_config());

        let request = wrap_for_relays(&index_packet(), &[keys.destination()], 6).unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            handler.packet_received(&Packet::Relay(request), &keys.destination()),
        )
        .await
        .unwrap();
        assert_eq!(handler.pending_stores(), 1);
        assert_eq!(handler.stored_count(), 0);

        dht.release.notify_one();
        for _ in 0..500 {
            if handler.stored_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handler.stored_count(), 1);
        assert_eq!(handler.pending_stores(), 0);
        assert_eq!(dht.inner.stats().index_stores, 1);
    }

    #[tokio::test]
    async fn test_middle_hop_forwards() {
        let network = LocalNetwork::new();
        let keys = NodeKeys::generate();
        let next = NodeKeys::generate();
        let next_transport = network.join(&next);
        let queue = SendQueue::new(Arc::new(network.join(&keys)), SendQueueConfig::default());
        let (trigger, signal) = shutdown::channel();
        let task = tokio::spawn(queue.clone().run(signal));

        let dht = Arc::new(MemoryDht::new());
        let handler = RelayRequestHandler::new(keys.clone(), queue, dht, relay_config());
        let request =
            wrap_for_relays(&index_packet(), &[keys.destination(), next.destination()], 6).unwrap();
        handler.handle(&request).await.unwrap();
        assert_eq!(handler.forwarded_count(), 1);

        let (data, from) = next_transport.receive().await.unwrap();
        assert_eq!(from, keys.destination());
        let Packet::Relay(inner) = Packet::decode(&data).unwrap() else {
            panic!("expected a relay request");
        };
        assert_eq!(peel(&inner, &next).unwrap(), Peeled::Store(index_packet()));

        trigger.trigger();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_insufficient_work_rejected() {
        let network = LocalNetwork::new();
        let keys = NodeKeys::generate();
        let queue = SendQueue::new(Arc::new(network.join(&keys)), SendQueueConfig::default());
        let dht = Arc::new(MemoryDht::new());
        let mut config = relay_config();
        config.min_pow_bits = 20;
        let handler = RelayRequestHandler::new(keys.clone(), queue, dht.clone(), config);

        let mut request = wrap_for_relays(&index_packet(), &[keys.destination()], 0).unwrap();
        // make sure the stamp really is short of 20 bits
        while pow::work_of(&request.work_input(), request.pow_nonce) >= 20 {
            request.pow_nonce += 1;
        }
        handler
            .packet_received(&Packet::Relay(request), &keys.destination())
            .await;
        assert_eq!(handler.rejected_count(), 1);
        assert_eq!(handler.stored_count(), 0);
        assert_eq!(dht.stats().index_stores, 0);
    }
}
