// Store module — local persistence for identities, outbox, delivery state
// and mail folders

pub mod backend;
pub mod folder;
pub mod metadata;
pub mod outbox;

pub use backend::{MemoryStorage, SledStorage, StorageBackend};
pub use folder::{EmailFolder, IncompleteEmailFolder, StoredEmail};
pub use metadata::{EmailMetadata, FragmentDelivery, MetadataStore};
pub use outbox::{Outbox, OutboxEntry, OutboxStatus};

use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Email error: {0}")]
    Email(#[from] crate::email::EmailError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Change notifications from a folder-like store
#[cfg_attr(test, mockall::automock)]
pub trait FolderListener: Send + Sync {
    fn on_element_added(&self, id: &str);
    fn on_element_updated(&self, id: &str);
    fn on_element_removed(&self, id: &str);
}

/// Registered listeners of one store
#[derive(Default)]
pub struct FolderListeners {
    listeners: RwLock<Vec<Arc<dyn FolderListener>>>,
}

impl FolderListeners {
    pub fn add(&self, listener: Arc<dyn FolderListener>) {
        self.listeners.write().push(listener);
    }

    fn snapshot(&self) -> Vec<Arc<dyn FolderListener>> {
        self.listeners.read().clone()
    }

    pub fn added(&self, id: &str) {
        for listener in self.snapshot() {
            listener.on_element_added(id);
        }
    }

    pub fn updated(&self, id: &str) {
        for listener in self.snapshot() {
            listener.on_element_updated(id);
        }
    }

    pub fn removed(&self, id: &str) {
        for listener in self.snapshot() {
            listener.on_element_removed(id);
        }
    }
}
