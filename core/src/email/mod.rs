//! Email handling: message model, addresses, compression and the packet
//! pipeline that turns an email into per-recipient DHT packets.

pub mod address;
pub mod compress;
pub mod message;
pub mod packets;

pub use address::{parse_address, resolve_address, Address, AddressBook};
pub use message::{Email, SignatureStatus};
pub use packets::{create_email_packets, reassemble, EmailPackets};

use crate::crypto::CryptoError;
use crate::packet::PacketError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("Email has no recipients")]
    NoRecipients,
    #[error("Invalid recipient address: {0}")]
    InvalidRecipient(String),
    #[error("Invalid header line: {0}")]
    InvalidHeader(String),
    #[error("Malformed email: {0}")]
    Malformed(String),
    #[error("Decompression failed: {0}")]
    Decompression(String),
    #[error("Invalid fragment size: {0}")]
    FragmentSize(usize),
    #[error("Email too large: {0} bytes")]
    TooLarge(usize),
    #[error("Incomplete email: {have} of {need} fragments")]
    MissingFragments { have: usize, need: usize },
    #[error("Inconsistent fragments: {0}")]
    InconsistentFragments(String),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),
}

pub type Result<T> = std::result::Result<T, EmailError>;
