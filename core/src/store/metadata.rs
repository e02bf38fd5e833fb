// Delivery state of sent emails
//
// For every sent email we remember which DHT keys were published for which
// recipient. The delivery checker flips `delivered` once a storage node can
// show the deletion authorization for a key, i.e. the recipient consumed it.

use super::backend::{get_object, put_object, scan_objects, storage_key, StorageBackend};
use super::{FolderListener, FolderListeners, MemoryStorage, Result, StoreError};
use crate::crypto::Hash256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

const METADATA_PREFIX: &[u8] = b"metadata_";

/// One published fragment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentDelivery {
    pub dht_key: Hash256,
    pub deletion_hash: Hash256,
    pub delivered: bool,
}

/// Delivery record of one sent email
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMetadata {
    pub email_id: String,
    pub created_at: u64,
    /// recipient identity hash → fragments published for that recipient
    pub recipients: BTreeMap<Hash256, Vec<FragmentDelivery>>,
}

impl EmailMetadata {
    pub fn new(email_id: &str) -> Self {
        Self {
            email_id: email_id.to_string(),
            created_at: crate::unix_time(),
            recipients: BTreeMap::new(),
        }
    }

    /// Record the fragments published for `recipient`, replacing any earlier set
    pub fn set_recipient_packets(
        &mut self,
        recipient: Hash256,
        packets: impl IntoIterator<Item = (Hash256, Hash256)>,
    ) {
        let fragments = packets
            .into_iter()
            .map(|(dht_key, deletion_hash)| FragmentDelivery {
                dht_key,
                deletion_hash,
                delivered: false,
            })
            .collect();
        self.recipients.insert(recipient, fragments);
    }

    /// Mark one fragment delivered. Returns true if the state changed.
    pub fn mark_delivered(&mut self, dht_key: &Hash256) -> bool {
        let mut changed = false;
        for fragment in self.recipients.values_mut().flatten() {
            if fragment.dht_key == *dht_key && !fragment.delivered {
                fragment.delivered = true;
                changed = true;
            }
        }
        changed
    }

    pub fn is_recipient_delivered(&self, recipient: &Hash256) -> bool {
        self.recipients
            .get(recipient)
            .map(|fragments| fragments.iter().all(|f| f.delivered))
            .unwrap_or(false)
    }

    /// True once every recipient's fragment set is delivered
    pub fn is_delivered(&self) -> bool {
        !self.recipients.is_empty()
            && self
                .recipients
                .values()
                .all(|fragments| fragments.iter().all(|f| f.delivered))
    }

    pub fn delivered_recipients(&self) -> usize {
        self.recipients
            .keys()
            .filter(|r| self.is_recipient_delivered(r))
            .count()
    }

    /// Fragments still waiting for confirmation
    pub fn undelivered(&self) -> impl Iterator<Item = &FragmentDelivery> {
        self.recipients.values().flatten().filter(|f| !f.delivered)
    }
}

/// Persistent delivery metadata keyed by outbox email id
pub struct MetadataStore {
    backend: Arc<dyn StorageBackend>,
    listeners: FolderListeners,
}

impl MetadataStore {
    pub fn memory() -> Self {
        Self::persistent(Arc::new(MemoryStorage::new()))
    }

    pub fn persistent(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            listeners: FolderListeners::default(),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn FolderListener>) {
        self.listeners.add(listener);
    }

    fn key(email_id: &str) -> Vec<u8> {
        storage_key(METADATA_PREFIX, email_id)
    }

    pub fn get(&self, email_id: &str) -> Result<Option<EmailMetadata>> {
        get_object(self.backend.as_ref(), &Self::key(email_id))
    }

    /// Store or replace a record
    pub fn put(&self, metadata: &EmailMetadata) -> Result<()> {
        let existed = self.backend.get(&Self::key(&metadata.email_id))?.is_some();
        put_object(self.backend.as_ref(), &Self::key(&metadata.email_id), metadata)?;
        self.backend.flush()?;
        if existed {
            self.listeners.updated(&metadata.email_id);
        } else {
            self.listeners.added(&metadata.email_id);
        }
        Ok(())
    }

    /// Mark a fragment of `email_id` delivered. Returns true if it changed.
    pub fn mark_delivered(&self, email_id: &str, dht_key: &Hash256) -> Result<bool> {
        let mut metadata = self
            .get(email_id)?
            .ok_or_else(|| StoreError::NotFound(email_id.to_string()))?;
        if !metadata.mark_delivered(dht_key) {
            return Ok(false);
        }
        self.put(&metadata)?;
        if metadata.is_delivered() {
            tracing::info!(email_id = %email_id, "📬 Email delivered to all recipients");
        }
        Ok(true)
    }

    pub fn all(&self) -> Result<Vec<EmailMetadata>> {
        scan_objects(self.backend.as_ref(), METADATA_PREFIX)
    }

    /// Records with at least one unconfirmed fragment
    pub fn undelivered(&self) -> Result<Vec<EmailMetadata>> {
        Ok(self.all()?.into_iter().filter(|m| !m.is_delivered()).collect())
    }

    pub fn remove(&self, email_id: &str) -> Result<()> {
        self.backend.remove(&Self::key(email_id))?;
        self.listeners.removed(email_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockFolderListener;

    fn h(tag: &str) -> Hash256 {
        Hash256::digest(tag.as_bytes())
    }

    fn two_recipient_metadata() -> EmailMetadata {
        let mut metadata = EmailMetadata::new("mail-1");
        metadata.set_recipient_packets(h("alice"), vec![(h("a1"), h("da1")), (h("a2"), h("da2"))]);
        metadata.set_recipient_packets(h("bob"), vec![(h("b1"), h("db1"))]);
        metadata
    }

    #[test]
    fn test_delivery_progress() {
        let mut metadata = two_recipient_metadata();
        assert!(!metadata.is_delivered());
        assert_eq!(metadata.undelivered().count(), 3);

        assert!(metadata.mark_delivered(&h("b1")));
        assert!(!metadata.mark_delivered(&h("b1")));
        assert!(metadata.is_recipient_delivered(&h("bob")));
        assert!(!metadata.is_recipient_delivered(&h("alice")));
        assert_eq!(metadata.delivered_recipients(), 1);

        metadata.mark_delivered(&h("a1"));
        assert!(!metadata.is_delivered());
        metadata.mark_delivered(&h("a2"));
        assert!(metadata.is_delivered());
        assert_eq!(metadata.undelivered().count(), 0);
    }

    #[test]
    fn test_empty_metadata_is_not_delivered() {
        let metadata = EmailMetadata::new("nothing");
        assert!(!metadata.is_delivered());
        assert!(!metadata.is_recipient_delivered(&h("anyone")));
    }

    #[test]
    fn test_store_mark_delivered() {
        let store = MetadataStore::memory();
        store.put(&two_recipient_metadata()).unwrap();
        assert_eq!(store.undelivered().unwrap().len(), 1);

        assert!(store.mark_delivered("mail-1", &h("a1")).unwrap());
        assert!(!store.mark_delivered("mail-1", &h("unknown")).unwrap());
        assert!(matches!(
            store.mark_delivered("missing", &h("a1")),
            Err(StoreError::NotFound(_))
        ));

        store.mark_delivered("mail-1", &h("a2")).unwrap();
        store.mark_delivered("mail-1", &h("b1")).unwrap();
        assert!(store.undelivered().unwrap().is_empty());
        assert!(store.get("mail-1").unwrap().unwrap().is_delivered());
    }

    #[test]
    fn test_listener_sees_added_then_updated() {
        let store = MetadataStore::memory();
        let mut listener = MockFolderListener::new();
        listener.expect_on_element_added().times(1).return_const(());
        listener.expect_on_element_updated().times(1).return_const(());
        listener.expect_on_element_removed().times(0);
        store.add_listener(Arc::new(listener));

        store.put(&two_recipient_metadata()).unwrap();
        store.mark_delivered("mail-1", &h("b1")).unwrap();
    }
}
