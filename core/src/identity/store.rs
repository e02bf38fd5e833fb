// Identity storage
//
// Exactly one stored identity is the default whenever at least one exists:
// the first identity added becomes default, and removing the default
// promotes the oldest remaining identity.

use super::{EmailDestination, EmailIdentity, IdentityError, Result};
use crate::crypto::Hash256;
use crate::store::backend::{get_object, put_object, scan_objects, storage_key, StorageBackend};
use crate::store::MemoryStorage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const IDENTITY_PREFIX: &[u8] = b"identity_";

#[derive(Clone, Serialize, Deserialize)]
struct StoredIdentity {
    position: u64,
    identity: EmailIdentity,
}

/// Persistent set of local email identities
pub struct IdentityStore {
    backend: Arc<dyn StorageBackend>,
    write_lock: Mutex<()>,
}

impl IdentityStore {
    /// Create in-memory storage
    pub fn memory() -> Self {
        Self::persistent(Arc::new(MemoryStorage::new()))
    }

    /// Create persistent storage
    pub fn persistent(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            write_lock: Mutex::new(()),
        }
    }

    fn key(hash: &Hash256) -> Vec<u8> {
        storage_key(IDENTITY_PREFIX, &hash.to_hex())
    }

    fn load_all(&self) -> Result<Vec<StoredIdentity>> {
        let mut stored: Vec<StoredIdentity> = scan_objects(self.backend.as_ref(), IDENTITY_PREFIX)?;
        stored.sort_by_key(|s| s.position);
        Ok(stored)
    }

    fn save(&self, stored: &StoredIdentity) -> Result<()> {
        put_object(self.backend.as_ref(), &Self::key(&stored.identity.hash()), stored)?;
        Ok(())
    }

    /// Add an identity. The first identity becomes the default.
    pub fn add(&self, mut identity: EmailIdentity) -> Result<Hash256> {
        let _guard = self.write_lock.lock();
        let existing = self.load_all()?;
        let hash = identity.hash();
        if existing.iter().any(|s| s.identity.hash() == hash) {
            return Err(IdentityError::Duplicate(hash));
        }

        if existing.is_empty() {
            identity.is_default = true;
        } else if identity.is_default {
            for mut other in existing.iter().filter(|s| s.identity.is_default).cloned() {
                other.identity.is_default = false;
                self.save(&other)?;
            }
        }

        let position = existing.last().map(|s| s.position + 1).unwrap_or(0);
        self.save(&StoredIdentity { position, identity })?;
        self.backend.flush()?;
        tracing::info!(identity = %hash.short(), "🔑 Added identity");
        Ok(hash)
    }

    /// Remove an identity, promoting another one if it was the default
    pub fn remove(&self, hash: &Hash256) -> Result<EmailIdentity> {
        let _guard = self.write_lock.lock();
        let existing = self.load_all()?;
        let removed = existing
            .iter()
            .find(|s| s.identity.hash() == *hash)
            .map(|s| s.identity.clone())
            .ok_or(IdentityError::NotFound(*hash))?;

        self.backend.remove(&Self::key(hash))?;

        if removed.is_default {
            if let Some(mut next) = existing
                .iter()
                .find(|s| s.identity.hash() != *hash)
                .cloned()
            {
                next.identity.is_default = true;
                self.save(&next)?;
                tracing::info!(identity = %next.identity.hash().short(), "Promoted identity to default");
            }
        }
        self.backend.flush()?;
        tracing::info!(identity = %hash.short(), "🗑️  Removed identity");
        Ok(removed)
    }

    pub fn get(&self, hash: &Hash256) -> Result<Option<EmailIdentity>> {
        let stored: Option<StoredIdentity> = get_object(self.backend.as_ref(), &Self::key(hash))?;
        Ok(stored.map(|s| s.identity))
    }

    /// All identities, oldest first
    pub fn get_all(&self) -> Result<Vec<EmailIdentity>> {
        Ok(self.load_all()?.into_iter().map(|s| s.identity).collect())
    }

    pub fn get_default(&self) -> Result<Option<EmailIdentity>> {
        Ok(self
            .load_all()?
            .into_iter()
            .map(|s| s.identity)
            .find(|i| i.is_default))
    }

    /// Find the local identity owning `destination`
    pub fn find_by_destination(&self, destination: &EmailDestination) -> Result<Option<EmailIdentity>> {
        self.get(&destination.hash())
    }

    pub fn set_default(&self, hash: &Hash256) -> Result<()> {
        let _guard = self.write_lock.lock();
        let existing = self.load_all()?;
        if !existing.iter().any(|s| s.identity.hash() == *hash) {
            return Err(IdentityError::NotFound(*hash));
        }
        for mut stored in existing.iter().cloned() {
            let should_be_default = stored.identity.hash() == *hash;
            if stored.identity.is_default != should_be_default {
                stored.identity.is_default = should_be_default;
                self.save(&stored)?;
            }
        }
        self.backend.flush()?;
        Ok(())
    }

    /// Update display name and description
    pub fn update(&self, hash: &Hash256, display_name: &str, description: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut stored: StoredIdentity = get_object(self.backend.as_ref(), &Self::key(hash))?
            .ok_or(IdentityError::NotFound(*hash))?;
        stored.identity.display_name = display_name.to_string();
        stored.identity.description = description.to_string();
        self.save(&stored)?;
        self.backend.flush()?;
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.backend.count_prefix(IDENTITY_PREFIX)?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
