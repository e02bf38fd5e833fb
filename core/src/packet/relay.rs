// Relay request: one onion layer addressed to one relay peer

use super::codec::{put_u32_prefixed, Reader};
use super::{CorrelationId, PacketError, PacketType, Result, WirePacket};

pub const EPHEMERAL_KEY_LEN: usize = 32;
pub const LAYER_NONCE_LEN: usize = 24;

/// Upper bound on a layer's ciphertext; anything larger is malformed
pub const MAX_RELAY_CIPHERTEXT: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRequest {
    pub correlation_id: CorrelationId,
    /// Proof-of-work counter, see `relay::pow`
    pub pow_nonce: u64,
    /// Sender's ephemeral X25519 key for this layer
    pub ephemeral_key: [u8; EPHEMERAL_KEY_LEN],
    pub nonce: [u8; LAYER_NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl RelayRequest {
    /// The bytes covered by the proof-of-work stamp (everything but the
    /// counter itself)
    pub fn work_input(&self) -> Vec<u8> {
        let mut input =
            Vec::with_capacity(32 + EPHEMERAL_KEY_LEN + LAYER_NONCE_LEN + self.ciphertext.len());
        input.extend_from_slice(&self.correlation_id.0);
        input.extend_from_slice(&self.ephemeral_key);
        input.extend_from_slice(&self.nonce);
        input.extend_from_slice(&self.ciphertext);
        input
    }
}

impl WirePacket for RelayRequest {
    const TYPE: PacketType = PacketType::Relay;

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&self.correlation_id.0);
        out.extend_from_slice(&self.pow_nonce.to_be_bytes());
        out.extend_from_slice(&self.ephemeral_key);
        out.extend_from_slice(&self.nonce);
        put_u32_prefixed(out, &self.ciphertext, "relay ciphertext")
    }

    fn decode_body(reader: &mut Reader<'_>) -> Result<Self> {
        let correlation_id = CorrelationId(reader.read_array()?);
        let pow_nonce = reader.read_u64()?;
        let ephemeral_key = reader.read_array()?;
        let nonce = reader.read_array()?;
        let len = reader.read_u32()? as usize;
        if len > MAX_RELAY_CIPHERTEXT {
            return Err(PacketError::TooLarge {
                field: "relay ciphertext",
                len,
                max: MAX_RELAY_CIPHERTEXT,
            });
        }
        let ciphertext = reader.read_bytes(len)?.to_vec();
        Ok(Self {
            correlation_id,
            pow_nonce,
            ephemeral_key,
            nonce,
            ciphertext,
        })
    }
}
