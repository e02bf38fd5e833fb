// Delivery confirmation driver
//
// A fragment counts as delivered once some storage node can show the secret
// that authorized deleting it: only the recipient could decrypt that secret.

use super::Shutdown;
use crate::config::DeliveryConfig;
use crate::dht::DhtStorage;
use crate::store::MetadataStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct DeliveryChecker {
    dht: Arc<dyn DhtStorage>,
    metadata: Arc<MetadataStore>,
    config: DeliveryConfig,
}

impl DeliveryChecker {
    pub fn new(dht: Arc<dyn DhtStorage>, metadata: Arc<MetadataStore>, config: DeliveryConfig) -> Self {
        Self {
            dht,
            metadata,
            config,
        }
    }

    /// Query every outstanding fragment once. Returns how many fragments
    /// were newly confirmed.
    pub async fn check_once(&self) -> usize {
        let pending = match self.metadata.undelivered() {
            Ok(pending) => pending,
            Err(e) => {
                warn!("Could not read delivery metadata: {}", e);
                return 0;
            }
        };

        let mut confirmed = 0;
        for record in pending {
            for fragment in record.undelivered() {
                let authorization = self
                    .dht
                    .find_delete_authorization(&fragment.dht_key, &fragment.deletion_hash)
                    .await;
                match authorization {
                    Ok(Some(secret)) if secret.verifies(&fragment.deletion_hash) => {
                        match self.metadata.mark_delivered(&record.email_id, &fragment.dht_key) {
                            Ok(true) => confirmed += 1,
                            Ok(false) => {}
                            Err(e) => warn!(email_id = %record.email_id, "Could not update delivery state: {}", e),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(key = %fragment.dht_key.short(), "Delivery query failed: {}", e);
                    }
                }
            }
        }
        confirmed
    }

    pub async fn run(self: Arc<Self>, mut shutdown: Shutdown) {
        info!(interval_mins = self.config.interval_mins, "Delivery checker started");
        loop {
            if !shutdown.sleep(self.config.interval()).await {
                break;
            }
            if !self.dht.is_ready() {
                continue;
            }
            let confirmed = self.check_once().await;
            if confirmed > 0 {
                info!(fragments = confirmed, "Delivery confirmed");
            }
        }
        info!("Delivery checker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Hash256, SchemeId};
    use crate::dht::MemoryDht;
    use crate::packet::{DeletionSecret, DhtPacket, EncryptedEmailPacket};
    use crate::store::EmailMetadata;

    async fn published(dht: &MemoryDht, secret: &DeletionSecret, data: &[u8]) -> EncryptedEmailPacket {
        let packet = EncryptedEmailPacket::new(SchemeId::EcP256, data.to_vec(), secret.verification_hash());
        dht.store(DhtPacket::Email(packet.clone())).await.unwrap();
        packet
    }

    #[tokio::test]
    async fn test_consumed_fragments_are_confirmed() {
        let dht = Arc::new(MemoryDht::new());
        let metadata = Arc::new(MetadataStore::memory());
        let checker = DeliveryChecker::new(dht.clone(), metadata.clone(), DeliveryConfig::default());

        let first_secret = DeletionSecret::random();
        let second_secret = DeletionSecret::random();
        let first = published(&dht, &first_secret, b"one").await;
        let second = published(&dht, &second_secret, b"two").await;

        let mut record = EmailMetadata::new("email-1");
        record.set_recipient_packets(
            Hash256::digest(b"bob"),
            [
                (first.dht_key, first.deletion_hash),
                (second.dht_key, second.deletion_hash),
            ],
        );
        metadata.put(&record).unwrap();

        assert_eq!(checker.check_once().await, 0);

        dht.delete_email_packet(&first.dht_key, &first_secret).await.unwrap();
        assert_eq!(checker.check_once().await, 1);
        assert!(!metadata.get("email-1").unwrap().unwrap().is_delivered());

        dht.delete_email_packet(&second.dht_key, &second_secret).await.unwrap();
        assert_eq!(checker.check_once().await, 1);
        assert!(metadata.get("email-1").unwrap().unwrap().is_delivered());
        assert!(metadata.undelivered().unwrap().is_empty());
        assert_eq!(checker.check_once().await, 0);
    }

    #[tokio::test]
    async fn test_unready_dht_changes_nothing() {
        let dht = Arc::new(MemoryDht::new());
        let metadata = Arc::new(MetadataStore::memory());
        let checker = DeliveryChecker::new(dht.clone(), metadata.clone(), DeliveryConfig::default());

        let mut record = EmailMetadata::new("email-2");
        record.set_recipient_packets(
            Hash256::digest(b"carol"),
            [(Hash256::digest(b"key"), Hash256::digest(b"hash"))],
        );
        metadata.put(&record).unwrap();

        dht.set_ready(false);
        assert_eq!(checker.check_once().await, 0);
        assert_eq!(metadata.undelivered().unwrap().len(), 1);
    }
}
