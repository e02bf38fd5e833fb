//! Cryptography module — pluggable hybrid-encryption and signature schemes
//!
//! Every email identity is bound to one `CryptoScheme`. The scheme id is
//! carried next to every key, ciphertext and signature so that a node can
//! handle peers using a different algorithm family than its own identities.
//!
//! Schemes:
//! - `EcP256`  — ECDH-256 + ECDSA-256 (NIST P-256), AES-256-CBC bulk cipher
//! - `EcP384`  — ECDH-384 + ECDSA-384 (NIST P-384), AES-256-CBC bulk cipher
//! - `Lattice` — Kyber-768 KEM + Dilithium-3 signatures, AES-256-CBC bulk cipher

pub mod hash;
pub mod keys;
pub mod lattice;
pub mod nist;
pub mod symmetric;

pub use hash::Hash256;
pub use keys::{PrivateKeyPair, PublicKeyPair};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use zeroize::Zeroizing;

/// Crypto errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Unknown crypto scheme id: {0}")]
    UnknownScheme(u8),
    #[error("Invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
    #[error("Invalid Base64 encoding")]
    InvalidBase64,
    #[error("Invalid key material: {0}")]
    InvalidKey(String),
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed: wrong key or corrupted ciphertext")]
    DecryptionFailed,
    #[error("Invalid signature encoding")]
    InvalidSignature,
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// Numeric algorithm id embedded in keys, ciphertexts and signatures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SchemeId {
    /// ECDH-256 / ECDSA-256
    EcP256 = 1,
    /// ECDH-384 / ECDSA-384
    EcP384 = 2,
    /// Kyber-768 / Dilithium-3
    Lattice = 3,
}

impl SchemeId {
    /// All supported schemes, weakest first
    pub const ALL: [SchemeId; 3] = [SchemeId::EcP256, SchemeId::EcP384, SchemeId::Lattice];

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(SchemeId::EcP256),
            2 => Ok(SchemeId::EcP384),
            3 => Ok(SchemeId::Lattice),
            other => Err(CryptoError::UnknownScheme(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Resolve the implementation for this id
    pub fn scheme(self) -> &'static dyn CryptoScheme {
        match self {
            SchemeId::EcP256 => &nist::EcP256,
            SchemeId::EcP384 => &nist::EcP384,
            SchemeId::Lattice => &lattice::KyberDilithium,
        }
    }
}

impl fmt::Display for SchemeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme().name())
    }
}

/// A freshly generated asymmetric key pair (raw encoded forms)
pub struct KeyPair {
    pub public: Vec<u8>,
    pub private: Zeroizing<Vec<u8>>,
}

/// One algorithm family: key generation, fixed-length codecs, hybrid
/// encryption and signatures.
///
/// Implementations are stateless apart from their algorithm parameters.
pub trait CryptoScheme: Send + Sync {
    fn id(&self) -> SchemeId;

    /// Human readable name, e.g. "ECDH-256/ECDSA-256"
    fn name(&self) -> &'static str;

    fn encryption_public_len(&self) -> usize;
    fn signing_public_len(&self) -> usize;
    fn encryption_private_len(&self) -> usize;
    fn signing_private_len(&self) -> usize;
    fn signature_len(&self) -> usize;

    /// Bytes placed in front of the IV: ephemeral point or KEM ciphertext
    fn encapsulation_len(&self) -> usize;

    /// Largest ciphertext `encrypt` produces for `plaintext_len` bytes
    fn ciphertext_len(&self, plaintext_len: usize) -> usize {
        self.encapsulation_len() + symmetric::padded_len(plaintext_len)
    }

    /// Largest plaintext whose ciphertext fits in `ciphertext_limit` bytes
    fn max_plaintext_len(&self, ciphertext_limit: usize) -> usize {
        let blocks = ciphertext_limit.saturating_sub(self.encapsulation_len() + symmetric::IV_LEN)
            / symmetric::BLOCK_LEN;
        // PKCS#7 always adds at least one byte
        (blocks * symmetric::BLOCK_LEN).saturating_sub(1)
    }

    /// Leading byte every public key of this scheme starts with, guaranteed by
    /// key generation. Base64 forms leave it out.
    fn public_key_prefix(&self) -> Option<u8> {
        None
    }

    fn generate_encryption_key_pair(&self) -> KeyPair;
    fn generate_signing_key_pair(&self) -> KeyPair;

    /// Hybrid-encrypt `data` for the holder of `recipient_key`
    fn encrypt(&self, data: &[u8], recipient_key: &[u8]) -> Result<Vec<u8>>;

    /// Inverse of `encrypt`. Fails with `DecryptionFailed` if the ciphertext was
    /// not produced for `private_key`.
    fn decrypt(&self, data: &[u8], private_key: &[u8]) -> Result<Vec<u8>>;

    fn sign(&self, data: &[u8], private_key: &[u8]) -> Result<Vec<u8>>;

    /// Returns `Ok(false)` for a well-formed signature that does not verify
    fn verify(&self, data: &[u8], signature: &[u8], public_key: &[u8]) -> Result<bool>;

    fn public_key_pair_len(&self) -> usize {
        self.encryption_public_len() + self.signing_public_len()
    }

    fn private_key_pair_len(&self) -> usize {
        self.encryption_private_len() + self.signing_private_len()
    }

    /// Length of the Base64 form of a public key pair
    fn public_base64_len(&self) -> usize {
        let stripped = if self.public_key_prefix().is_some() { 2 } else { 0 };
        base64_len(self.public_key_pair_len() - stripped)
    }

    /// Length of the Base64 form of a private key pair
    fn private_base64_len(&self) -> usize {
        base64_len(self.private_key_pair_len())
    }

    /// Generate a complete key set: (public keys, private keys)
    fn generate_key_pairs(&self) -> (PublicKeyPair, PrivateKeyPair) {
        let encryption = self.generate_encryption_key_pair();
        let signing = self.generate_signing_key_pair();
        let public = PublicKeyPair::new(self.id(), encryption.public, signing.public);
        let private = PrivateKeyPair::new(
            self.id(),
            encryption.private.to_vec(),
            signing.private.to_vec(),
        );
        (public, private)
    }
}

/// Length of unpadded Base64 for `n` bytes
pub fn base64_len(n: usize) -> usize {
    (n * 4 + 2) / 3
}

/// Encode bytes as URL-safe Base64 without padding
pub fn to_base64(data: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

/// Decode URL-safe unpadded Base64
pub fn from_base64(data: &str) -> Result<Vec<u8>> {
    use base64::Engine as _;
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(data.trim())
        .map_err(|_| CryptoError::InvalidBase64)
}

/// Encode a signature with its scheme id prefix
pub fn encode_signature(scheme: SchemeId, signature: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + signature.len());
    out.push(scheme.as_u8());
    out.extend_from_slice(signature);
    out
}

/// Split a scheme-tagged signature into (scheme, raw signature)
pub fn decode_signature(data: &[u8]) -> Result<(SchemeId, &[u8])> {
    let (&id, raw) = data.split_first().ok_or(CryptoError::InvalidSignature)?;
    let scheme = SchemeId::from_u8(id)?;
    if raw.len() != scheme.scheme().signature_len() {
        return Err(CryptoError::InvalidSignature);
    }
    Ok((scheme, raw))
}
