//! Packet model — wire formats for everything the engine stores in the DHT
//! or sends between peers.
//!
//! Every packet starts with a two byte header: an ASCII type letter and the
//! protocol version. Multi-byte integers are big-endian.
//!
//! | Packet                   | Type | Travels                       |
//! |--------------------------|------|-------------------------------|
//! | `EncryptedEmailPacket`   | `E`  | DHT value, keyed by hash(ct)  |
//! | `IndexPacket`            | `I`  | DHT value, keyed by recipient |
//! | `UnencryptedEmailPacket` | `U`  | only inside an `E` packet     |
//! | `PeerListRequest`        | `A`  | peer to peer                  |
//! | `PeerList`               | `L`  | inside a `ResponsePacket`     |
//! | `ResponsePacket`         | `N`  | peer to peer                  |
//! | `RelayRequest`           | `R`  | peer to peer, onion layered   |

pub mod codec;
pub mod email;
pub mod index;
pub mod peer;
pub mod relay;

pub use email::{DeletionSecret, EncryptedEmailPacket, MessageId, UnencryptedEmailPacket};
pub use index::{IndexEntry, IndexPacket};
pub use peer::{CorrelationId, PeerList, PeerListRequest, ResponsePacket, ResponseStatus};
pub use relay::RelayRequest;

use crate::crypto::{CryptoError, Hash256};
use codec::Reader;
use thiserror::Error;

/// Version byte written into every packet header
pub const PROTOCOL_VERSION: u8 = 4;

pub const HEADER_LEN: usize = 2;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Packet truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
    #[error("Unknown packet type: {0:#04x}")]
    UnknownType(u8),
    #[error("Unexpected packet type: expected {expected:?}, found {found:?}")]
    WrongType {
        expected: PacketType,
        found: PacketType,
    },
    #[error("Unsupported protocol version {found}, expected {expected}")]
    UnsupportedVersion { found: u8, expected: u8 },
    #[error("{field} too large: {len} bytes (max {max})")]
    TooLarge {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("Invalid packet field: {0}")]
    Invalid(String),
    #[error("{0} trailing bytes after packet")]
    TrailingBytes(usize),
    #[error("DHT key does not match SHA-256 of the ciphertext")]
    KeyMismatch,
    #[error("Deletion secret does not match the published verification hash")]
    VerificationMismatch,
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

pub type Result<T> = std::result::Result<T, PacketError>;

/// Packet type letter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Email = b'E',
    Index = b'I',
    UnencryptedEmail = b'U',
    PeerListRequest = b'A',
    PeerList = b'L',
    Response = b'N',
    Relay = b'R',
}

impl PacketType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            b'E' => Ok(PacketType::Email),
            b'I' => Ok(PacketType::Index),
            b'U' => Ok(PacketType::UnencryptedEmail),
            b'A' => Ok(PacketType::PeerListRequest),
            b'L' => Ok(PacketType::PeerList),
            b'N' => Ok(PacketType::Response),
            b'R' => Ok(PacketType::Relay),
            other => Err(PacketError::UnknownType(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Read and validate a two byte header. The version is checked before the
/// type so that a peer speaking another version is recognised as such even
/// if it uses type letters this version does not know.
pub fn read_header(reader: &mut Reader<'_>) -> Result<PacketType> {
    let type_byte = reader.read_u8()?;
    let version = reader.read_u8()?;
    if version != PROTOCOL_VERSION {
        return Err(PacketError::UnsupportedVersion {
            found: version,
            expected: PROTOCOL_VERSION,
        });
    }
    PacketType::from_u8(type_byte)
}

/// Common codec shape of every packet type
pub trait WirePacket: Sized {
    const TYPE: PacketType;

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<()>;
    fn decode_body(reader: &mut Reader<'_>) -> Result<Self>;

    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = vec![Self::TYPE.as_u8(), PROTOCOL_VERSION];
        self.encode_body(&mut out)?;
        Ok(out)
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let found = read_header(&mut reader)?;
        if found != Self::TYPE {
            return Err(PacketError::WrongType {
                expected: Self::TYPE,
                found,
            });
        }
        let packet = Self::decode_body(&mut reader)?;
        reader.finish()?;
        Ok(packet)
    }
}

/// Any packet that can arrive from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Email(EncryptedEmailPacket),
    Index(IndexPacket),
    PeerListRequest(PeerListRequest),
    PeerList(PeerList),
    Response(ResponsePacket),
    Relay(RelayRequest),
}

impl Packet {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let packet_type = read_header(&mut reader)?;
        let packet = match packet_type {
            PacketType::Email => Packet::Email(EncryptedEmailPacket::decode_body(&mut reader)?),
            PacketType::Index => Packet::Index(IndexPacket::decode_body(&mut reader)?),
            PacketType::PeerListRequest => {
                Packet::PeerListRequest(PeerListRequest::decode_body(&mut reader)?)
            }
            PacketType::PeerList => Packet::PeerList(PeerList::decode_body(&mut reader)?),
            PacketType::Response => Packet::Response(ResponsePacket::decode_body(&mut reader)?),
            PacketType::Relay => Packet::Relay(RelayRequest::decode_body(&mut reader)?),
            // Plaintext fragments never travel outside an encrypted packet
            PacketType::UnencryptedEmail => {
                return Err(PacketError::UnknownType(packet_type.as_u8()))
            }
        };
        reader.finish()?;
        Ok(packet)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Packet::Email(p) => p.to_bytes(),
            Packet::Index(p) => p.to_bytes(),
            Packet::PeerListRequest(p) => p.to_bytes(),
            Packet::PeerList(p) => p.to_bytes(),
            Packet::Response(p) => p.to_bytes(),
            Packet::Relay(p) => p.to_bytes(),
        }
    }

    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Email(_) => PacketType::Email,
            Packet::Index(_) => PacketType::Index,
            Packet::PeerListRequest(_) => PacketType::PeerListRequest,
            Packet::PeerList(_) => PacketType::PeerList,
            Packet::Response(_) => PacketType::Response,
            Packet::Relay(_) => PacketType::Relay,
        }
    }

    /// Correlation id for request/response matching, if this packet has one
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            Packet::PeerListRequest(p) => Some(p.correlation_id),
            Packet::Response(p) => Some(p.correlation_id),
            Packet::Relay(p) => Some(p.correlation_id),
            _ => None,
        }
    }
}

// ============================================================================
// DHT-storable packets
// ============================================================================

/// A packet that lives in the DHT
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtPacket {
    Email(EncryptedEmailPacket),
    Index(IndexPacket),
}

impl DhtPacket {
    /// DHT key the packet is stored under
    pub fn key(&self) -> Hash256 {
        match self {
            DhtPacket::Email(p) => p.dht_key,
            DhtPacket::Index(p) => p.recipient,
        }
    }

    pub fn packet_type(&self) -> PacketType {
        match self {
            DhtPacket::Email(_) => PacketType::Email,
            DhtPacket::Index(_) => PacketType::Index,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            DhtPacket::Email(p) => p.to_bytes(),
            DhtPacket::Index(p) => p.to_bytes(),
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        match Packet::decode(data)? {
            Packet::Email(p) => Ok(DhtPacket::Email(p)),
            Packet::Index(p) => Ok(DhtPacket::Index(p)),
            other => Err(PacketError::Invalid(format!(
                "{:?} packet is not DHT-storable",
                other.packet_type()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_roundtrip() {
        for t in [
            PacketType::Email,
            PacketType::Index,
            PacketType::UnencryptedEmail,
            PacketType::PeerListRequest,
            PacketType::PeerList,
            PacketType::Response,
            PacketType::Relay,
        ] {
            assert_eq!(PacketType::from_u8(t.as_u8()).unwrap(), t);
        }
        assert_eq!(PacketType::from_u8(b'Z'), Err(PacketError::UnknownType(b'Z')));
    }

    #[test]
    fn test_version_checked_before_type() {
        let data = [b'Z', PROTOCOL_VERSION + 1, 0, 0];
        assert_eq!(
            Packet::decode(&data),
            Err(PacketError::UnsupportedVersion {
                found: PROTOCOL_VERSION + 1,
                expected: PROTOCOL_VERSION
            })
        );
    }

    #[test]
    fn test_empty_input_is_truncated() {
        assert!(matches!(Packet::decode(&[]), Err(PacketError::Truncated { .. })));
    }

    #[test]
    fn test_wrong_type_rejected() {
        let request = PeerListRequest::new();
        let bytes = request.to_bytes().unwrap();
        assert!(matches!(
            IndexPacket::from_bytes(&bytes),
            Err(PacketError::WrongType { .. })
        ));
    }

    #[test]
    fn test_dht_packet_key() {
        let recipient = Hash256::digest(b"recipient");
        let index = IndexPacket::new(recipient);
        let packet = DhtPacket::Index(index);
        assert_eq!(packet.key(), recipient);
        let decoded = DhtPacket::decode(&packet.encode().unwrap()).unwrap();
        assert_eq!(decoded, packet);

        let request = Packet::PeerListRequest(PeerListRequest::new());
        assert!(DhtPacket::decode(&request.encode().unwrap()).is_err());
    }
}
