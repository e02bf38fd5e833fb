// Email fragments: the plaintext fragment and its encrypted DHT form

use super::codec::{put_u16_prefixed, Reader};
use super::{PacketError, PacketType, Result, WirePacket, HEADER_LEN};
use crate::crypto::{CryptoError, Hash256, SchemeId};
use crate::identity::{EmailDestination, EmailIdentity};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Random id shared by all fragments of one email
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub [u8; 16]);

impl MessageId {
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.to_hex())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Random secret whose hash is published with a fragment. Only the holder of
/// the secret can authorize deleting the fragment from the DHT.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeletionSecret(pub [u8; 32]);

impl DeletionSecret {
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn verification_hash(&self) -> Hash256 {
        Hash256::digest(&self.0)
    }

    pub fn verifies(&self, hash: &Hash256) -> bool {
        self.verification_hash() == *hash
    }
}

impl fmt::Debug for DeletionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeletionSecret(..)")
    }
}

// ============================================================================
// UnencryptedEmailPacket
// ============================================================================

/// One fragment of an email byte stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnencryptedEmailPacket {
    pub message_id: MessageId,
    pub fragment_index: u16,
    pub fragment_count: u16,
    pub payload: Vec<u8>,
    pub deletion_secret: DeletionSecret,
}

impl UnencryptedEmailPacket {
    /// Encoded size of everything but the payload
    pub const OVERHEAD: usize = HEADER_LEN + 16 + 2 + 2 + 2 + 32;

    /// Largest payload whose encrypted form still fits the `E` packet's
    /// ciphertext field
    pub fn max_payload_len(scheme: SchemeId) -> usize {
        scheme
            .scheme()
            .max_plaintext_len(usize::from(u16::MAX))
            .saturating_sub(Self::OVERHEAD)
    }

    pub fn new(
        message_id: MessageId,
        fragment_index: u16,
        fragment_count: u16,
        payload: Vec<u8>,
        deletion_secret: DeletionSecret,
    ) -> Result<Self> {
        if fragment_count == 0 || fragment_index >= fragment_count {
            return Err(PacketError::Invalid(format!(
                "fragment index {} out of range for count {}",
                fragment_index, fragment_count
            )));
        }
        Ok(Self {
            message_id,
            fragment_index,
            fragment_count,
            payload,
            deletion_secret,
        })
    }

    /// Encrypt for `destination`
    pub fn encrypt(&self, destination: &EmailDestination) -> Result<EncryptedEmailPacket> {
        let plaintext = self.to_bytes()?;
        let ciphertext = destination.encrypt(&plaintext)?;
        Ok(EncryptedEmailPacket::new(
            destination.scheme(),
            ciphertext,
            self.deletion_secret.verification_hash(),
        ))
    }
}

impl WirePacket for UnencryptedEmailPacket {
    const TYPE: PacketType = PacketType::UnencryptedEmail;

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&self.message_id.0);
        out.extend_from_slice(&self.fragment_index.to_be_bytes());
        out.extend_from_slice(&self.fragment_count.to_be_bytes());
        put_u16_prefixed(out, &self.payload, "fragment payload")?;
        out.extend_from_slice(&self.deletion_secret.0);
        Ok(())
    }

    fn decode_body(reader: &mut Reader<'_>) -> Result<Self> {
        let message_id = MessageId(reader.read_array()?);
        let fragment_index = reader.read_u16()?;
        let fragment_count = reader.read_u16()?;
        let payload = reader.read_u16_prefixed()?.to_vec();
        let deletion_secret = DeletionSecret(reader.read_array()?);
        Self::new(message_id, fragment_index, fragment_count, payload, deletion_secret)
    }
}

// ============================================================================
// EncryptedEmailPacket
// ============================================================================

/// A fragment encrypted to one recipient, stored in the DHT under
/// `SHA-256(ciphertext)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedEmailPacket {
    pub dht_key: Hash256,
    /// Seconds since the epoch, set by the storing node
    pub store_time: u32,
    pub deletion_hash: Hash256,
    pub scheme: SchemeId,
    pub ciphertext: Vec<u8>,
}

impl EncryptedEmailPacket {
    pub fn new(scheme: SchemeId, ciphertext: Vec<u8>, deletion_hash: Hash256) -> Self {
        Self {
            dht_key: Hash256::digest(&ciphertext),
            store_time: 0,
            deletion_hash,
            scheme,
            ciphertext,
        }
    }

    /// Decrypt with `identity`. Fails with `CryptoError::DecryptionFailed`
    /// when the packet was not encrypted for this identity.
    pub fn decrypt(&self, identity: &EmailIdentity) -> Result<UnencryptedEmailPacket> {
        if identity.scheme() != self.scheme {
            return Err(CryptoError::DecryptionFailed.into());
        }
        let plaintext = identity.decrypt(&self.ciphertext)?;
        let packet = UnencryptedEmailPacket::from_bytes(&plaintext)?;
        if !packet.deletion_secret.verifies(&self.deletion_hash) {
            return Err(PacketError::VerificationMismatch);
        }
        Ok(packet)
    }
}

impl WirePacket for EncryptedEmailPacket {
    const TYPE: PacketType = PacketType::Email;

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(self.dht_key.as_bytes());
        out.extend_from_slice(&self.store_time.to_be_bytes());
        out.extend_from_slice(self.deletion_hash.as_bytes());
        out.push(self.scheme.as_u8());
        put_u16_prefixed(out, &self.ciphertext, "ciphertext")
    }

    fn decode_body(reader: &mut Reader<'_>) -> Result<Self> {
        let dht_key = reader.read_hash()?;
        let store_time = reader.read_u32()?;
        let deletion_hash = reader.read_hash()?;
        let scheme = SchemeId::from_u8(reader.read_u8()?)?;
        let ciphertext = reader.read_u16_prefixed()?.to_vec();
        if Hash256::digest(&ciphertext) != dht_key {
            return Err(PacketError::KeyMismatch);
        }
        Ok(Self {
            dht_key,
            store_time,
            deletion_hash,
            scheme,
            ciphertext,
        })
    }
}
