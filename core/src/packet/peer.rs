// Peer-to-peer request/response packets

use super::codec::{put_u16_prefixed, Reader};
use super::{PacketError, PacketType, Result, WirePacket};
use crate::transport::Destination;
use rand::RngCore;
use std::fmt;

/// Random id tying a response to its request
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(pub [u8; 32]);

impl CorrelationId {
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({})", hex::encode(&self.0[..4]))
    }
}

/// "Send me your peer list"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerListRequest {
    pub correlation_id: CorrelationId,
}

impl PeerListRequest {
    pub fn new() -> Self {
        Self {
            correlation_id: CorrelationId::random(),
        }
    }
}

impl Default for PeerListRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl WirePacket for PeerListRequest {
    const TYPE: PacketType = PacketType::PeerListRequest;

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&self.correlation_id.0);
        Ok(())
    }

    fn decode_body(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            correlation_id: CorrelationId(reader.read_array()?),
        })
    }
}

/// A list of peer destinations, sent as the payload of a `ResponsePacket`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerList {
    pub peers: Vec<Destination>,
}

impl WirePacket for PeerList {
    const TYPE: PacketType = PacketType::PeerList;

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<()> {
        let count = u16::try_from(self.peers.len()).map_err(|_| PacketError::TooLarge {
            field: "peer list",
            len: self.peers.len(),
            max: u16::MAX as usize,
        })?;
        out.extend_from_slice(&count.to_be_bytes());
        for peer in &self.peers {
            out.extend_from_slice(peer.as_bytes());
        }
        Ok(())
    }

    fn decode_body(reader: &mut Reader<'_>) -> Result<Self> {
        let count = reader.read_u16()? as usize;
        let mut peers = Vec::with_capacity(count.min(reader.remaining() / 32));
        for _ in 0..count {
            peers.push(Destination(reader.read_array()?));
        }
        Ok(Self { peers })
    }
}

/// Result code of a `ResponsePacket`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseStatus {
    Ok = 0,
    GeneralError = 1,
    NoDataFound = 2,
    InvalidPacket = 3,
    InsufficientWork = 4,
}

impl ResponseStatus {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ResponseStatus::Ok),
            1 => Ok(ResponseStatus::GeneralError),
            2 => Ok(ResponseStatus::NoDataFound),
            3 => Ok(ResponseStatus::InvalidPacket),
            4 => Ok(ResponseStatus::InsufficientWork),
            other => Err(PacketError::Invalid(format!("response status {}", other))),
        }
    }
}

/// Reply to a request, matched by correlation id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePacket {
    pub correlation_id: CorrelationId,
    pub status: ResponseStatus,
    pub payload: Vec<u8>,
}

impl ResponsePacket {
    pub fn new(correlation_id: CorrelationId, status: ResponseStatus, payload: Vec<u8>) -> Self {
        Self {
            correlation_id,
            status,
            payload,
        }
    }
}

impl WirePacket for ResponsePacket {
    const TYPE: PacketType = PacketType::Response;

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&self.correlation_id.0);
        out.push(self.status as u8);
        put_u16_prefixed(out, &self.payload, "response payload")
    }

    fn decode_body(reader: &mut Reader<'_>) -> Result<Self> {
        let correlation_id = CorrelationId(reader.read_array()?);
        let status = ResponseStatus::from_u8(reader.read_u8()?)?;
        let payload = reader.read_u16_prefixed()?.to_vec();
        Ok(Self {
            correlation_id,
            status,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_peer_list_roundtrip(keys in proptest::collection::vec(any::<[u8; 32]>(), 0..60)) {
            let list = PeerList { peers: keys.into_iter().map(Destination).collect() };
            let decoded = PeerList::from_bytes(&list.to_bytes().unwrap()).unwrap();
            prop_assert_eq!(decoded, list);
        }
    }

    #[test]
    fn test_request_response_correlation() {
        let request = PeerListRequest::new();
        let decoded = Packet::decode(&request.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.correlation_id(), Some(request.correlation_id));

        let list = PeerList {
            peers: vec![Destination([1; 32]), Destination([2; 32])],
        };
        let response = ResponsePacket::new(
            request.correlation_id,
            ResponseStatus::Ok,
            list.to_bytes().unwrap(),
        );
        let decoded = match Packet::decode(&response.to_bytes().unwrap()).unwrap() {
            Packet::Response(r) => r,
            other => panic!("unexpected packet {:?}", other),
        };
        assert_eq!(decoded.correlation_id, request.correlation_id);
        assert_eq!(PeerList::from_bytes(&decoded.payload).unwrap(), list);
    }

    #[test]
    fn test_bad_status_rejected() {
        let response = ResponsePacket::new(CorrelationId::random(), ResponseStatus::Ok, vec![]);
        let mut bytes = response.to_bytes().unwrap();
        bytes[34] = 200;
        assert!(matches!(
            ResponsePacket::from_bytes(&bytes),
            Err(PacketError::Invalid(_))
        ));
    }

    #[test]
    fn test_truncated_peer_list() {
        let list = PeerList {
            peers: vec![Destination([9; 32])],
        };
        let bytes = list.to_bytes().unwrap();
        assert!(matches!(
            PeerList::from_bytes(&bytes[..bytes.len() - 1]),
            Err(PacketError::Truncated { .. })
        ));
    }
}
