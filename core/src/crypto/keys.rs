// Public and private key pairs with fixed-length binary and Base64 codecs
//
// Binary form: encryptionKey || signingKey, lengths fixed per scheme.
// Base64 form: same bytes, minus the constant prefix byte of each public key
// when the scheme has one. The scheme is recovered from the Base64 length.

use super::{from_base64, to_base64, CryptoError, Result, SchemeId};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Public halves of an encryption key and a signing key
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKeyPair {
    pub scheme: SchemeId,
    pub encryption_key: Vec<u8>,
    pub signing_key: Vec<u8>,
}

impl PublicKeyPair {
    pub fn new(scheme: SchemeId, encryption_key: Vec<u8>, signing_key: Vec<u8>) -> Self {
        Self {
            scheme,
            encryption_key,
            signing_key,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encryption_key.len() + self.signing_key.len());
        out.extend_from_slice(&self.encryption_key);
        out.extend_from_slice(&self.signing_key);
        out
    }

    pub fn from_bytes(scheme: SchemeId, bytes: &[u8]) -> Result<Self> {
        let implementation = scheme.scheme();
        let expected = implementation.public_key_pair_len();
        if bytes.len() != expected {
            return Err(CryptoError::InvalidKeyLength {
                expected,
                actual: bytes.len(),
            });
        }
        let (encryption, signing) = bytes.split_at(implementation.encryption_public_len());
        if let Some(prefix) = implementation.public_key_prefix() {
            if encryption[0] != prefix || signing[0] != prefix {
                return Err(CryptoError::InvalidKey(
                    "public key does not carry the scheme prefix".to_string(),
                ));
            }
        }
        Ok(Self::new(scheme, encryption.to_vec(), signing.to_vec()))
    }

    pub fn to_base64(&self) -> String {
        match self.scheme.scheme().public_key_prefix() {
            Some(_) => {
                let mut stripped = Vec::with_capacity(self.encryption_key.len() + self.signing_key.len());
                stripped.extend_from_slice(&self.encryption_key[1..]);
                stripped.extend_from_slice(&self.signing_key[1..]);
                to_base64(&stripped)
            }
            None => to_base64(&self.to_bytes()),
        }
    }

    /// Parse a Base64 public key pair; the scheme is detected from the length
    pub fn from_base64(text: &str) -> Result<Self> {
        let text = text.trim();
        let scheme = scheme_for_public_base64(text.len())?;
        let bytes = from_base64(text)?;
        Self::from_stripped_bytes(scheme, &bytes)
    }

    fn from_stripped_bytes(scheme: SchemeId, bytes: &[u8]) -> Result<Self> {
        let implementation = scheme.scheme();
        match implementation.public_key_prefix() {
            Some(prefix) => {
                let enc_len = implementation.encryption_public_len() - 1;
                let sign_len = implementation.signing_public_len() - 1;
                if bytes.len() != enc_len + sign_len {
                    return Err(CryptoError::InvalidKeyLength {
                        expected: enc_len + sign_len,
                        actual: bytes.len(),
                    });
                }
                let mut encryption = Vec::with_capacity(enc_len + 1);
                encryption.push(prefix);
                encryption.extend_from_slice(&bytes[..enc_len]);
                let mut signing = Vec::with_capacity(sign_len + 1);
                signing.push(prefix);
                signing.extend_from_slice(&bytes[enc_len..]);
                Ok(Self::new(scheme, encryption, signing))
            }
            None => Self::from_bytes(scheme, bytes),
        }
    }
}

impl fmt::Debug for PublicKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKeyPair")
            .field("scheme", &self.scheme)
            .field("encryption_key", &hex::encode(&self.encryption_key[..self.encryption_key.len().min(8)]))
            .finish()
    }
}

/// Private halves of an encryption key and a signing key.
/// Key material is wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct PrivateKeyPair {
    #[zeroize(skip)]
    pub scheme: SchemeId,
    pub encryption_key: Vec<u8>,
    pub signing_key: Vec<u8>,
}

impl PrivateKeyPair {
    pub fn new(scheme: SchemeId, encryption_key: Vec<u8>, signing_key: Vec<u8>) -> Self {
        Self {
            scheme,
            encryption_key,
            signing_key,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encryption_key.len() + self.signing_key.len());
        out.extend_from_slice(&self.encryption_key);
        out.extend_from_slice(&self.signing_key);
        out
    }

    pub fn from_bytes(scheme: SchemeId, bytes: &[u8]) -> Result<Self> {
        let implementation = scheme.scheme();
        let expected = implementation.private_key_pair_len();
        if bytes.len() != expected {
            return Err(CryptoError::InvalidKeyLength {
                expected,
                actual: bytes.len(),
            });
        }
        let (encryption, signing) = bytes.split_at(implementation.encryption_private_len());
        Ok(Self::new(scheme, encryption.to_vec(), signing.to_vec()))
    }

    pub fn to_base64(&self) -> String {
        to_base64(&self.to_bytes())
    }

    pub fn from_base64(scheme: SchemeId, text: &str) -> Result<Self> {
        let bytes = zeroize::Zeroizing::new(from_base64(text)?);
        Self::from_bytes(scheme, &bytes)
    }
}

impl fmt::Debug for PrivateKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKeyPair")
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}

/// Detect the scheme of a Base64 public key pair from its length
pub fn scheme_for_public_base64(len: usize) -> Result<SchemeId> {
    SchemeId::ALL
        .into_iter()
        .find(|id| id.scheme().public_base64_len() == len)
        .ok_or(CryptoError::InvalidKeyLength {
            expected: SchemeId::EcP256.scheme().public_base64_len(),
            actual: len,
        })
}

/// Detect the scheme of a Base64 `public || private` export from its length
pub fn scheme_for_export_base64(len: usize) -> Result<SchemeId> {
    SchemeId::ALL
        .into_iter()
        .find(|id| {
            let scheme = id.scheme();
            scheme.public_base64_len() + scheme.private_base64_len() == len
        })
        .ok_or(CryptoError::InvalidKeyLength {
            expected: SchemeId::EcP256.scheme().public_base64_len()
                + SchemeId::EcP256.scheme().private_base64_len(),
            actual: len,
        })
}
