//! Relay layer: peers that forward DHT stores on behalf of a sender
//!
//! A sender wraps a DHT packet in one onion layer per relay hop. Each relay
//! checks the layer's proof-of-work stamp, peels it with its transport key
//! and either forwards the inner layer (after a random delay) or performs the
//! final DHT store. Relay peers are chosen at random among peers whose
//! reachability is above a threshold.

pub mod ban_list;
pub mod handler;
pub mod onion;
pub mod peer;
pub mod peer_manager;
pub mod pow;
pub mod publisher;

pub use ban_list::BanList;
pub use handler::RelayRequestHandler;
pub use onion::{peel, wrap_for_relays, Peeled, MAX_RELAY_HOPS};
pub use peer::RelayPeer;
pub use peer_manager::{PeerListResponder, RelayPeerManager, UpdateRound};
pub use publisher::PacketPublisher;

use crate::dht::DhtError;
use crate::network::SendQueueError;
use crate::packet::PacketError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Insufficient proof of work: {have} bits, need {need}")]
    InsufficientWork { have: u32, need: u32 },

    #[error("Proof of work not found within the iteration limit")]
    WorkNotFound,

    #[error("Relay layer could not be decrypted")]
    DecryptionFailed,

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Invalid relay layer: {0}")]
    InvalidLayer(String),

    #[error("Relay path is empty")]
    EmptyPath,

    #[error("Not enough relay peers: have {have}, need {need}")]
    NotEnoughPeers { have: usize, need: usize },

    #[error("Peer file error: {0}")]
    PeerFile(String),

    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("Send error: {0}")]
    Send(#[from] SendQueueError),

    #[error("DHT error: {0}")]
    Dht(#[from] DhtError),
}

pub type Result<T> = std::result::Result<T, RelayError>;
