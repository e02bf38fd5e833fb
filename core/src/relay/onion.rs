// Onion layers for relayed DHT stores
//
// Each layer is encrypted to one relay's X25519 transport key with a fresh
// ephemeral key, XChaCha20-Poly1305, and the layer's correlation id as
// associated data. Layer plaintext:
//
//   0x00 ‖ encoded DHT packet                      (final hop: store it)
//   0x01 ‖ nextHop(32) ‖ encoded inner RelayRequest (forward it)
//
// Every layer gets its own correlation id and proof-of-work stamp, so two
// hops of the same chain share nothing visible.

use super::{pow, RelayError, Result};
use crate::packet::codec::Reader;
use crate::packet::relay::LAYER_NONCE_LEN;
use crate::packet::{CorrelationId, DhtPacket, RelayRequest, WirePacket};
use crate::transport::{Destination, NodeKeys};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;
use x25519_dalek::{EphemeralSecret, PublicKey};

/// Longest relay chain a sender may build
pub const MAX_RELAY_HOPS: usize = 5;

const LAYER_STORE: u8 = 0;
const LAYER_FORWARD: u8 = 1;

/// Result of peeling one layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Peeled {
    Forward {
        next_hop: Destination,
        request: RelayRequest,
    },
    Store(DhtPacket),
}

fn derive_layer_key(shared_secret: &[u8]) -> chacha20poly1305::Key {
    let key_bytes = blake3::derive_key("dmail relay layer key v1", shared_secret);
    *chacha20poly1305::Key::from_slice(&key_bytes)
}

/// Encrypt one layer for `relay`, stamped with `pow_bits` of work
fn seal_layer(plaintext: &[u8], relay: &Destination, pow_bits: u8) -> Result<RelayRequest> {
    let ephemeral = EphemeralSecret::random_from_rng(rand::thread_rng());
    let ephemeral_key = PublicKey::from(&ephemeral).to_bytes();
    let shared = ephemeral.diffie_hellman(&PublicKey::from(*relay.as_bytes()));

    let mut nonce = [0u8; LAYER_NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let correlation_id = CorrelationId::random();

    let cipher = XChaCha20Poly1305::new(&derive_layer_key(shared.as_bytes()));
    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &correlation_id.0,
            },
        )
        .map_err(|_| RelayError::EncryptionFailed)?;

    let mut request = RelayRequest {
        correlation_id,
        pow_nonce: 0,
        ephemeral_key,
        nonce,
        ciphertext,
    };
    pow::stamp(&mut request, pow_bits)?;
    Ok(request)
}

/// Wrap `packet` for the relay chain `path`. The returned request goes to
/// `path[0]`; the last relay performs the DHT store.
pub fn wrap_for_relays(packet: &DhtPacket, path: &[Destination], pow_bits: u8) -> Result<RelayRequest> {
    let (last, _) = path.split_last().ok_or(RelayError::EmptyPath)?;
    if path.len() > MAX_RELAY_HOPS {
        return Err(RelayError::InvalidLayer(format!(
            "{} hops exceeds the maximum of {}",
            path.len(),
            MAX_RELAY_HOPS
        )));
    }

    let mut plaintext = vec![LAYER_STORE];
    plaintext.extend_from_slice(&packet.encode()?);
    let mut request = seal_layer(&plaintext, last, pow_bits)?;

    for pair in path.windows(2).rev() {
        let (relay, next_hop) = (&pair[0], &pair[1]);
        let inner = request.to_bytes()?;
        let mut plaintext = Vec::with_capacity(1 + 32 + inner.len());
        plaintext.push(LAYER_FORWARD);
        plaintext.extend_from_slice(next_hop.as_bytes());
        plaintext.extend_from_slice(&inner);
        request = seal_layer(&plaintext, relay, pow_bits)?;
    }
    Ok(request)
}

/// Remove the layer addressed to `keys`
pub fn peel(request: &RelayRequest, keys: &NodeKeys) -> Result<Peeled> {
    let shared = keys
        .secret()
        .diffie_hellman(&PublicKey::from(request.ephemeral_key));
    let cipher = XChaCha20Poly1305::new(&derive_layer_key(shared.as_bytes()));
    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(&request.nonce),
            Payload {
                msg: &request.ciphertext,
                aad: &request.correlation_id.0,
            },
        )
        .map_err(|_| RelayError::DecryptionFailed)?;

    let (&kind, body) = plaintext
        .split_first()
        .ok_or_else(|| RelayError::InvalidLayer("empty layer".to_string()))?;
    match kind {
        LAYER_STORE => Ok(Peeled::Store(DhtPacket::decode(body)?)),
        LAYER_FORWARD => {
            let mut reader = Reader::new(body);
            let next_hop = Destination(reader.read_array()?);
            let inner = RelayRequest::from_bytes(reader.read_bytes(reader.remaining())?)?;
            Ok(Peeled::Forward {
                next_hop,
                request: inner,
            })
        }
        other => Err(RelayError::InvalidLayer(format!("unknown layer kind {}", other))),
    }
}
