// Publishing DHT packets, directly or through a relay chain
//
// With zero hops the packet goes straight to the DHT. Otherwise a random
// chain of reachable relay peers is picked, the packet is wrapped once per
// hop and handed to the first relay. Completion then only means the first
// layer left this node; the final store is confirmed later by the DHT
// lookups of the mail and delivery drivers.

use super::onion::wrap_for_relays;
use super::{RelayError, RelayPeerManager, Result};
use crate::config::RelayConfig;
use crate::dht::DhtStorage;
use crate::network::SendQueue;
use crate::packet::{DhtPacket, Packet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct PacketPublisher {
    dht: Arc<dyn DhtStorage>,
    peers: Arc<RelayPeerManager>,
    queue: Arc<SendQueue>,
    config: RelayConfig,
    peer_wait: Duration,
}

impl PacketPublisher {
    /// `peer_wait` bounds how long a publish waits for enough reachable
    /// relay peers
    pub fn new(
        dht: Arc<dyn DhtStorage>,
        peers: Arc<RelayPeerManager>,
        queue: Arc<SendQueue>,
        config: RelayConfig,
        peer_wait: Duration,
    ) -> Self {
        Self {
            dht,
            peers,
            queue,
            config,
            peer_wait,
        }
    }

    pub fn hops(&self) -> usize {
        self.config.hops as usize
    }

    pub async fn publish(&self, packet: DhtPacket) -> Result<()> {
        let hops = self.hops();
        if hops == 0 {
            return Ok(self.dht.store(packet).await?);
        }

        let path = tokio::time::timeout(self.peer_wait, self.peers.get_random_peers(hops))
            .await
            .map_err(|_| RelayError::NotEnoughPeers {
                have: self.peers.good_peers().len(),
                need: hops,
            })?;
        let first_hop = path[0];

        let bits = self.config.pow_bits_per_hop;
        let key = packet.key();
        // mining can take a while, keep it off the runtime threads
        let request = tokio::task::spawn_blocking(move || wrap_for_relays(&packet, &path, bits))
            .await
            .map_err(|e| RelayError::InvalidLayer(format!("wrapping task failed: {}", e)))??;

        debug!(key = %key.short(), hops, first_hop = %first_hop.short(), "Publishing through relays");
        self.queue.send(&Packet::Relay(request), first_hop)?.sent().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PeerConfig, SendQueueConfig};
    use crate::crypto::Hash256;
    use crate::dht::MemoryDht;
    use crate::packet::{IndexEntry, IndexPacket, PacketType};
    use crate::relay::{peel, BanList, Peeled};
    use crate::service::shutdown;
    use crate::transport::{LocalNetwork, NodeKeys, Transport};

    fn index_packet() -> DhtPacket {
        let mut index = IndexPacket::new(Hash256::digest(b"recipient"));
        index.put(IndexEntry {
            email_packet_key: Hash256::digest(b"fragment"),
            deletion_hash: Hash256::digest(b"secret"),
            store_time: 0,
        });
        DhtPacket::Index(index)
    }

    fn relay_config(hops: u8) -> RelayConfig {
        RelayConfig {
            hops,
            min_delay_secs: 0,
            max_delay_secs: 0,
            pow_bits_per_hop: 4,
            min_pow_bits: 4,
        }
    }

    #[tokio::test]
    async fn test_zero_hops_stores_directly() {
        let network = LocalNetwork::new();
        let keys = NodeKeys::generate();
        let queue = SendQueue::new(Arc::new(network.join(&keys)), SendQueueConfig::default());
        let peers = Arc::new(RelayPeerManager::new(
            keys.destination(),
            PeerConfig::default(),
            Arc::new(BanList::new()),
        ));
        let dht = Arc::new(MemoryDht::new());
        let publisher = PacketPublisher::new(
            dht.clone(),
            peers,
            queue.clone(),
            relay_config(0),
            Duration::from_secs(1),
        );

        let packet = index_packet();
        publisher.publish(packet.clone()).await.unwrap();
        assert!(dht
            .find_one(&packet.key(), PacketType::Index)
            .await
            .unwrap()
            .is_some());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_relayed_publish_reaches_first_hop() {
        let network = LocalNetwork::new();
        let keys = NodeKeys::generate();
        let relay = NodeKeys::generate();
        let relay_transport = network.join(&relay);
        let queue = SendQueue::new(Arc::new(network.join(&keys)), SendQueueConfig::default());
        let (trigger, signal) = shutdown::channel();
        let task = tokio::spawn(queue.clone().run(signal));

        let peers = Arc::new(RelayPeerManager::new(
            keys.destination(),
            PeerConfig::default(),
            Arc::new(BanList::new()),
        ));
        peers.add_peer(relay.destination());
        let dht = Arc::new(MemoryDht::new());
        let publisher = PacketPublisher::new(
            dht.clone(),
            peers,
            queue,
            relay_config(1),
            Duration::from_secs(1),
        );

        publisher.publish(index_packet()).await.unwrap();
        assert_eq!(dht.stats().index_stores, 0);

        let (data, _) = relay_transport.receive().await.unwrap();
        let Packet::Relay(request) = Packet::decode(&data).unwrap() else {
            panic!("expected a relay request");
        };
        assert_eq!(peel(&request, &relay).unwrap(), Peeled::Store(index_packet()));

        trigger.trigger();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_enough_peers_times_out() {
        let network = LocalNetwork::new();
        let keys = NodeKeys::generate();
        let queue = SendQueue::new(Arc::new(network.join(&keys)), SendQueueConfig::default());
        let peers = Arc::new(RelayPeerManager::new(
            keys.destination(),
            PeerConfig::default(),
            Arc::new(BanList::new()),
        ));
        peers.add_peer(NodeKeys::generate().destination());
        let publisher = PacketPublisher::new(
            Arc::new(MemoryDht::new()),
            peers,
            queue,
            relay_config(3),
            Duration::from_secs(30),
        );

        let result = publisher.publish(index_packet()).await;
        assert!(matches!(
            result,
            Err(RelayError::NotEnoughPeers { have: 1, need: 3 })
        ));
    }
}
