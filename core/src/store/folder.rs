// Mail folders
//
// `IncompleteEmailFolder` collects decrypted fragments until an email is
// complete, then hands the reassembled email to the inbox `EmailFolder`.
// Completed message ids are remembered so a fragment fetched twice never
// produces a second copy of the same email.

use super::backend::{get_object, put_object, scan_objects, storage_key, StorageBackend};
use super::{FolderListener, FolderListeners, MemoryStorage, Result, StoreError};
use crate::email::{self, Email};
use crate::packet::UnencryptedEmailPacket;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const FRAGMENT_PREFIX: &str = "fragment_";
const COMPLETED_PREFIX: &str = "completed_";

// ============================================================================
// EmailFolder
// ============================================================================

/// An email as kept in a folder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEmail {
    pub id: String,
    pub email: Email,
    pub received_at: u64,
    pub read: bool,
}

/// A named folder of complete emails (inbox, sent)
pub struct EmailFolder {
    name: String,
    backend: Arc<dyn StorageBackend>,
    listeners: FolderListeners,
}

impl EmailFolder {
    pub fn memory(name: &str) -> Self {
        Self::persistent(name, Arc::new(MemoryStorage::new()))
    }

    pub fn persistent(name: &str, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            name: name.to_string(),
            backend,
            listeners: FolderListeners::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_listener(&self, listener: Arc<dyn FolderListener>) {
        self.listeners.add(listener);
    }

    fn prefix(&self) -> Vec<u8> {
        format!("folder_{}_", self.name).into_bytes()
    }

    fn key(&self, id: &str) -> Vec<u8> {
        storage_key(&self.prefix(), id)
    }

    /// Store an email, returning its folder id
    pub fn add(&self, email: Email) -> Result<String> {
        let stored = StoredEmail {
            id: uuid::Uuid::new_v4().to_string(),
            email,
            received_at: crate::unix_time(),
            read: false,
        };
        put_object(self.backend.as_ref(), &self.key(&stored.id), &stored)?;
        self.backend.flush()?;
        tracing::debug!(folder = %self.name, email_id = %stored.id, "Added email to folder");
        self.listeners.added(&stored.id);
        Ok(stored.id)
    }

    pub fn get(&self, id: &str) -> Result<Option<StoredEmail>> {
        get_object(self.backend.as_ref(), &self.key(id))
    }

    /// All emails, oldest first
    pub fn list(&self) -> Result<Vec<StoredEmail>> {
        let mut emails: Vec<StoredEmail> = scan_objects(self.backend.as_ref(), &self.prefix())?;
        emails.sort_by(|a, b| a.received_at.cmp(&b.received_at).then_with(|| a.id.cmp(&b.id)));
        Ok(emails)
    }

    pub fn mark_read(&self, id: &str, read: bool) -> Result<()> {
        let mut stored = self
            .get(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if stored.read != read {
            stored.read = read;
            put_object(self.backend.as_ref(), &self.key(id), &stored)?;
            self.listeners.updated(id);
        }
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<bool> {
        let key = self.key(id);
        if self.backend.get(&key)?.is_none() {
            return Ok(false);
        }
        self.backend.remove(&key)?;
        self.backend.flush()?;
        self.listeners.removed(id);
        Ok(true)
    }

    pub fn len(&self) -> Result<usize> {
        self.backend.count_prefix(&self.prefix())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

// ============================================================================
// IncompleteEmailFolder
// ============================================================================

/// Fragment store feeding completed emails into an inbox
pub struct IncompleteEmailFolder {
    backend: Arc<dyn StorageBackend>,
    inbox: Arc<EmailFolder>,
    lock: Mutex<()>,
}

impl IncompleteEmailFolder {
    pub fn memory(inbox: Arc<EmailFolder>) -> Self {
        Self::persistent(Arc::new(MemoryStorage::new()), inbox)
    }

    pub fn persistent(backend: Arc<dyn StorageBackend>, inbox: Arc<EmailFolder>) -> Self {
        Self {
            backend,
            inbox,
            lock: Mutex::new(()),
        }
    }

    pub fn inbox(&self) -> &Arc<EmailFolder> {
        &self.inbox
    }

    fn message_prefix(packet: &UnencryptedEmailPacket) -> Vec<u8> {
        format!("{}{}_", FRAGMENT_PREFIX, packet.message_id.to_hex()).into_bytes()
    }

    fn completed_key(packet: &UnencryptedEmailPacket) -> Vec<u8> {
        storage_key(COMPLETED_PREFIX.as_bytes(), &packet.message_id.to_hex())
    }

    /// Add one fragment. Returns true when it completed an email, which is
    /// then reassembled and placed in the inbox.
    pub fn add_fragment(&self, packet: &UnencryptedEmailPacket) -> Result<bool> {
        let _guard = self.lock.lock();
        if self.backend.get(&Self::completed_key(packet))?.is_some() {
            tracing::trace!(message = %packet.message_id, "Fragment of an already completed email");
            return Ok(false);
        }

        let prefix = Self::message_prefix(packet);
        let key = storage_key(&prefix, &format!("{:05}", packet.fragment_index));
        put_object(self.backend.as_ref(), &key, packet)?;

        let have = self.backend.count_prefix(&prefix)?;
        if have < packet.fragment_count as usize {
            tracing::debug!(
                message = %packet.message_id,
                have,
                need = packet.fragment_count,
                "Stored fragment"
            );
            self.backend.flush()?;
            return Ok(false);
        }

        let fragments: Vec<UnencryptedEmailPacket> = scan_objects(self.backend.as_ref(), &prefix)?;
        // fragments stay until the email is safely in the inbox
        let email = match email::reassemble(&fragments) {
            Ok(email) => email,
            Err(e) => {
                self.backend.flush()?;
                return Err(e.into());
            }
        };
        let id = self.inbox.add(email)?;

        for (stored_key, _) in self.backend.scan_prefix(&prefix)? {
            self.backend.remove(&stored_key)?;
        }
        put_object(
            self.backend.as_ref(),
            &Self::completed_key(packet),
            &crate::unix_time(),
        )?;
        self.backend.flush()?;
        tracing::info!(message = %packet.message_id, email_id = %id, "📨 Email complete");
        Ok(true)
    }

    /// Fragments held for emails that are not complete yet
    pub fn pending_fragments(&self) -> Result<usize> {
        self.backend.count_prefix(FRAGMENT_PREFIX.as_bytes())
    }
}
