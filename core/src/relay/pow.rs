// Proof-of-work stamps on relay layers
//
// valid = leading_zero_bits(SHA-256(work_input || nonce_be)) >= bits
//
// The work input is hashed once; each attempt only clones the hasher state
// and feeds the 8 counter bytes.

use super::{RelayError, Result};
use crate::packet::RelayRequest;
use sha2::{Digest, Sha256};

/// Cap on stamp difficulty accepted by `mine`
pub const MAX_POW_BITS: u8 = 32;

/// Give up after this many attempts
const MAX_ITERATIONS: u64 = 1 << 36;

/// Count leading zero bits of a digest
pub fn leading_zero_bits(hash: &[u8]) -> u32 {
    let mut count = 0;
    for &byte in hash {
        if byte == 0 {
            count += 8;
        } else {
            count += byte.leading_zeros();
            break;
        }
    }
    count
}

fn work_bits(base: &Sha256, nonce: u64) -> u32 {
    let hash = base.clone().chain_update(nonce.to_be_bytes()).finalize();
    leading_zero_bits(&hash)
}

/// Find a counter giving at least `bits` leading zero bits over `input`.
/// CPU bound; async callers should use `spawn_blocking`.
pub fn mine(input: &[u8], bits: u8) -> Result<u64> {
    if bits > MAX_POW_BITS {
        return Err(RelayError::InvalidLayer(format!(
            "proof-of-work difficulty {} exceeds {}",
            bits, MAX_POW_BITS
        )));
    }
    let base = Sha256::new().chain_update(input);
    (0..MAX_ITERATIONS)
        .find(|&nonce| work_bits(&base, nonce) >= bits as u32)
        .ok_or(RelayError::WorkNotFound)
}

/// Leading zero bits achieved by `nonce` over `input`
pub fn work_of(input: &[u8], nonce: u64) -> u32 {
    work_bits(&Sha256::new().chain_update(input), nonce)
}

/// Stamp a relay request in place
pub fn stamp(request: &mut RelayRequest, bits: u8) -> Result<()> {
    request.pow_nonce = mine(&request.work_input(), bits)?;
    Ok(())
}

/// Check the stamp of a relay request
pub fn check(request: &RelayRequest, min_bits: u8) -> Result<()> {
    let have = work_of(&request.work_input(), request.pow_nonce);
    if have < min_bits as u32 {
        return Err(RelayError::InsufficientWork {
            have,
            need: min_bits as u32,
        });
    }
    Ok(())
}
