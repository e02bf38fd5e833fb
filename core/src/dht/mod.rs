//! DHT contract — the store/find operations the messaging layer needs
//!
//! Routing and replication belong to the network below; the engine only sees
//! `DhtStorage`. Index packets for one recipient can be forked across
//! storing nodes, which is why `find_all` exists: callers merge the copies.

pub mod memory;

pub use memory::{DhtStats, MemoryDht};

use crate::crypto::Hash256;
use crate::packet::{DeletionSecret, DhtPacket, PacketError, PacketType};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DhtError {
    #[error("No quorum: {reached} of {required} storage nodes reachable")]
    NoQuorum { reached: usize, required: usize },
    #[error("DHT not ready")]
    NotReady,
    #[error("DHT operation timed out")]
    Timeout,
    #[error("Deletion not authorized for {0}")]
    Unauthorized(Hash256),
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),
}

pub type Result<T> = std::result::Result<T, DhtError>;

#[async_trait]
pub trait DhtStorage: Send + Sync {
    /// Store a packet under its key. Index packets are merged into any copy
    /// already stored for the same recipient.
    async fn store(&self, packet: DhtPacket) -> Result<()>;

    /// Any one copy of the packet stored under `key`
    async fn find_one(&self, key: &Hash256, packet_type: PacketType) -> Result<Option<DhtPacket>>;

    /// Every distinct copy stored under `key`
    async fn find_all(&self, key: &Hash256, packet_type: PacketType) -> Result<Vec<DhtPacket>>;

    /// Delete an email packet. Storage nodes check
    /// `SHA-256(secret) == deletion_hash` and remember the secret.
    async fn delete_email_packet(&self, key: &Hash256, secret: &DeletionSecret) -> Result<()>;

    /// Remove one entry from a recipient's index packet
    async fn delete_index_entry(
        &self,
        recipient: &Hash256,
        key: &Hash256,
        secret: &DeletionSecret,
    ) -> Result<()>;

    /// The secret that authorized deleting `key`, if the packet was deleted
    /// by someone holding the secret behind `deletion_hash`
    async fn find_delete_authorization(
        &self,
        key: &Hash256,
        deletion_hash: &Hash256,
    ) -> Result<Option<DeletionSecret>>;

    fn is_ready(&self) -> bool;

    /// Wait until the DHT is ready or `timeout` elapses
    async fn wait_ready(&self, timeout: Duration) -> bool;

    /// Number of storage peers currently known
    fn peer_count(&self) -> usize;
}
