// Outbox — emails waiting to be published into the DHT
//
// Entries survive restarts and are retried on every outbox pass until all
// recipients are served. Recipients already served are remembered so that a
// retry does not publish duplicate fragments for them.

use super::backend::{get_object, put_object, scan_objects, storage_key, StorageBackend};
use super::{FolderListener, FolderListeners, MemoryStorage, Result, StoreError};
use crate::crypto::Hash256;
use crate::email::Email;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

const OUTBOX_PREFIX: &[u8] = b"outbox_";

/// Human readable progress of one outgoing email
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxStatus {
    Queued,
    Sending,
    Partial { sent: usize, total: usize },
    Sent,
    Failed(String),
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutboxStatus::Queued => f.write_str("Queued"),
            OutboxStatus::Sending => f.write_str("Sending"),
            OutboxStatus::Partial { sent, total } => {
                write!(f, "Sent to {} of {} recipients", sent, total)
            }
            OutboxStatus::Sent => f.write_str("Sent"),
            OutboxStatus::Failed(reason) => write!(f, "Error: {}", reason),
        }
    }
}

/// A queued outbound email
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Local id, also used for the delivery metadata record
    pub id: String,
    pub email: Email,
    /// Sending identity; `None` sends anonymously
    pub sender: Option<Hash256>,
    pub status: OutboxStatus,
    /// When this was queued (unix timestamp)
    pub queued_at: u64,
    /// Number of outbox passes that tried this email
    pub attempts: u32,
    /// Identity hashes of recipients whose fragments are stored
    pub sent_to: Vec<Hash256>,
}

impl OutboxEntry {
    pub fn new(email: Email, sender: Option<Hash256>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            email,
            sender,
            status: OutboxStatus::Queued,
            queued_at: crate::unix_time(),
            attempts: 0,
            sent_to: Vec::new(),
        }
    }

    pub fn is_sent_to(&self, recipient: &Hash256) -> bool {
        self.sent_to.contains(recipient)
    }
}

/// Persistent queue of outgoing emails
pub struct Outbox {
    backend: Arc<dyn StorageBackend>,
    listeners: FolderListeners,
}

impl Outbox {
    /// Create a new in-memory outbox
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

    fn key(id: &str) -> Vec<u8> {
        storage_key(OUTBOX_PREFIX, id)
    }

    /// Queue an email, returning its outbox id
    pub fn add(&self, email: Email, sender: Option<Hash256>) -> Result<String> {
        let entry = OutboxEntry::new(email, sender);
        put_object(self.backend.as_ref(), &Self::key(&entry.id), &entry)?;
        self.backend.flush()?;
        tracing::debug!(email_id = %entry.id, "Queued email in outbox");
        self.listeners.added(&entry.id);
        Ok(entry.id)
    }

    pub fn get(&self, id: &str) -> Result<Option<OutboxEntry>> {
        get_object(self.backend.as_ref(), &Self::key(id))
    }

    /// All queued emails, oldest first
    pub fn pending(&self) -> Result<Vec<OutboxEntry>> {
        let mut entries: Vec<OutboxEntry> = scan_objects(self.backend.as_ref(), OUTBOX_PREFIX)?;
        entries.sort_by(|a, b| a.queued_at.cmp(&b.queued_at).then_with(|| a.id.cmp(&b.id)));
        Ok(entries)
    }

    /// Replace a stored entry (status, attempts, served recipients)
    pub fn update(&self, entry: &OutboxEntry) -> Result<()> {
        if self.get(&entry.id)?.is_none() {
            return Err(StoreError::NotFound(entry.id.clone()));
        }
        put_object(self.backend.as_ref(), &Self::key(&entry.id), entry)?;
        self.backend.flush()?;
        self.listeners.updated(&entry.id);
        Ok(())
    }

    pub fn set_status(&self, id: &str, status: OutboxStatus) -> Result<()> {
        let mut entry = self
            .get(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if entry.status == status {
            return Ok(());
        }
        entry.status = status;
        self.update(&entry)
    }

    /// Remove an email from the outbox. Returns true if it was present.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let key = Self::key(id);
        if self.backend.get(&key)?.is_none() {
            return Ok(false);
        }
        self.backend.remove(&key)?;
        self.backend.flush()?;
        self.listeners.removed(id);
        Ok(true)
    }

    pub fn len(&self) -> Result<usize> {
        self.backend.count_prefix(OUTBOX_PREFIX)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockFolderListener;
    use crate::store::SledStorage;

    fn email(subject: &str) -> Email {
        Email::new().with_header("Subject", subject).with_body("hello")
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(OutboxStatus::Sending.to_string(), "Sending");
        assert_eq!(
            OutboxStatus::Partial { sent: 1, total: 2 }.to_string(),
            "Sent to 1 of 2 recipients"
        );
        assert_eq!(OutboxStatus::Sent.to_string(), "Sent");
        assert_eq!(
            OutboxStatus::Failed("no quorum".into()).to_string(),
            "Error: no quorum"
        );
    }

    #[test]
    fn test_add_update_remove() {
        let outbox = Outbox::memory();
        assert!(outbox.is_empty().unwrap());

        let id = outbox.add(email("one"), None).unwrap();
        assert_eq!(outbox.len().unwrap(), 1);

        let mut entry = outbox.get(&id).unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Queued);
        assert_eq!(entry.email.subject(), Some("one"));

        let recipient = Hash256::digest(b"recipient");
        entry.sent_to.push(recipient);
        entry.attempts += 1;
        outbox.update(&entry).unwrap();

        let reloaded = outbox.get(&id).unwrap().unwrap();
        assert!(reloaded.is_sent_to(&recipient));
        assert_eq!(reloaded.attempts, 1);

        assert!(outbox.remove(&id).unwrap());
        assert!(!outbox.remove(&id).unwrap());
        assert!(outbox.get(&id).unwrap().is_none());
    }

    #[test]
    fn test_update_missing_entry_fails() {
        let outbox = Outbox::memory();
        let entry = OutboxEntry::new(email("ghost"), None);
        assert!(matches!(outbox.update(&entry), Err(StoreError::NotFound(_))));
        assert!(matches!(
            outbox.set_status(&entry.id, OutboxStatus::Sent),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_pending_is_oldest_first() {
        let outbox = Outbox::memory();
        let first = outbox.add(email("a"), None).unwrap();
        let second = outbox.add(email("b"), None).unwrap();

        let mut older = outbox.get(&second).unwrap().unwrap();
        older.queued_at = 1;
        outbox.update(&older).unwrap();

        let ids: Vec<String> = outbox.pending().unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![second, first]);
    }

    #[test]
    fn test_listener_events() {
        let outbox = Outbox::memory();
        let mut listener = MockFolderListener::new();
        listener.expect_on_element_added().times(1).return_const(());
        // the repeated identical status is not an update
        listener.expect_on_element_updated().times(1).return_const(());
        listener.expect_on_element_removed().times(1).return_const(());
        outbox.add_listener(Arc::new(listener));

        let id = outbox.add(email("watched"), None).unwrap();
        outbox.set_status(&id, OutboxStatus::Sending).unwrap();
        outbox.set_status(&id, OutboxStatus::Sending).unwrap();
        outbox.remove(&id).unwrap();
    }

    #[test]
    fn test_persistent_outbox_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let storage = Arc::new(SledStorage::new(dir.path().join("db")).unwrap());
            let outbox = Outbox::persistent(storage);
            outbox.add(email("persisted"), None).unwrap()
        };

        let storage = Arc::new(SledStorage::new(dir.path().join("db")).unwrap());
        let outbox = Outbox::persistent(storage);
        let entry = outbox.get(&id).unwrap().unwrap();
        assert_eq!(entry.email.subject(), Some("persisted"));
    }
}
