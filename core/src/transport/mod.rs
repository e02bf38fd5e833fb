//! Transport layer for dmail
//!
//! The engine only needs to send and receive datagrams addressed to network
//! destinations. A destination is the 32-byte X25519 public key of a node;
//! relays use the matching secret to peel onion layers addressed to them.

pub mod local;
pub mod status;

pub use local::{LocalNetwork, LocalTransport};
pub use status::{NetworkStatus, NetworkStatusListener, StatusNotifier};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

/// Errors that can occur in the transport layer
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(Destination),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Transport closed")]
    Closed,

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Network identity of a node
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Destination(pub [u8; 32]);

impl Destination {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        crate::crypto::to_base64(&self.0)
    }

    pub fn from_base64(text: &str) -> Result<Self> {
        let bytes = crate::crypto::from_base64(text)
            .map_err(|_| TransportError::InvalidDestination(text.to_string()))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TransportError::InvalidDestination(text.to_string()))?;
        Ok(Self(array))
    }

    /// Short form for log output
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Destination({})", self.short())
    }
}

/// X25519 key pair of the local node
#[derive(Clone)]
pub struct NodeKeys {
    secret: StaticSecret,
    destination: Destination,
}

impl NodeKeys {
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(rand::thread_rng()))
    }

    pub fn from_secret(secret: StaticSecret) -> Self {
        let destination = Destination(PublicKey::from(&secret).to_bytes());
        Self {
            secret,
            destination,
        }
    }

    pub fn destination(&self) -> Destination {
        self.destination
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

impl fmt::Debug for NodeKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKeys({:?})", self.destination)
    }
}

/// Datagram transport over the anonymizing network
#[async_trait]
pub trait Transport: Send + Sync {
    /// Destination other nodes use to reach this one
    fn local_destination(&self) -> Destination;

    async fn send(&self, data: &[u8], to: &Destination) -> Result<()>;

    /// Wait for the next datagram. Returns `Closed` once the transport has
    /// been shut down.
    async fn receive(&self) -> Result<(Vec<u8>, Destination)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_base64_roundtrip() {
        let keys = NodeKeys::generate();
        let text = keys.destination().to_string();
        assert_eq!(text.len(), 43);
        assert_eq!(Destination::from_base64(&text).unwrap(), keys.destination());
    }

    #[test]
    fn test_invalid_destination() {
        assert!(matches!(
            Destination::from_base64("AAAA"),
            Err(TransportError::InvalidDestination(_))
        ));
        assert!(Destination::from_base64("!!").is_err());
    }

    #[test]
    fn test_node_keys_destination_matches_secret() {
        let keys = NodeKeys::generate();
        let again = NodeKeys::from_secret(keys.secret().clone());
        assert_eq!(again.destination(), keys.destination());
    }
}
