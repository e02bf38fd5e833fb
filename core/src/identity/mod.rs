// Email identities: public destinations and the private keys behind them

mod store;

pub use store::IdentityStore;

use crate::crypto::{
    self, keys::scheme_for_export_base64, CryptoError, Hash256, PrivateKeyPair, PublicKeyPair,
    SchemeId,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Storage error: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("No identity with hash {0}")]
    NotFound(Hash256),
    #[error("Identity already exists: {0}")]
    Duplicate(Hash256),
}

pub type Result<T> = std::result::Result<T, IdentityError>;

// ============================================================================
// EmailDestination
// ============================================================================

/// The public half of an email identity. Immutable once constructed.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailDestination {
    keys: PublicKeyPair,
    hash: Hash256,
}

impl EmailDestination {
    pub fn new(keys: PublicKeyPair) -> Self {
        let hash = Hash256::digest_parts(&[&keys.encryption_key, &keys.signing_key]);
        Self { keys, hash }
    }

    pub fn from_base64(text: &str) -> Result<Self> {
        Ok(Self::new(PublicKeyPair::from_base64(text)?))
    }

    pub fn from_bytes(scheme: SchemeId, bytes: &[u8]) -> Result<Self> {
        Ok(Self::new(PublicKeyPair::from_bytes(scheme, bytes)?))
    }

    /// SHA-256 over both public keys; the DHT key of this destination's index
    pub fn hash(&self) -> Hash256 {
        self.hash
    }

    pub fn scheme(&self) -> SchemeId {
        self.keys.scheme
    }

    pub fn public_keys(&self) -> &PublicKeyPair {
        &self.keys
    }

    pub fn to_base64(&self) -> String {
        self.keys.to_base64()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.keys.to_bytes()
    }

    /// Hybrid-encrypt data for this destination
    pub fn encrypt(&self, data: &[u8]) -> crypto::Result<Vec<u8>> {
        self.keys.scheme.scheme().encrypt(data, &self.keys.encryption_key)
    }

    /// Verify a raw (untagged) signature made by this destination
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> crypto::Result<bool> {
        self.keys
            .scheme
            .scheme()
            .verify(data, signature, &self.keys.signing_key)
    }
}

impl fmt::Display for EmailDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for EmailDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EmailDestination({}, {})", self.keys.scheme, self.hash.short())
    }
}

// ============================================================================
// EmailIdentity
// ============================================================================

/// A destination plus its private keys and display metadata
#[derive(Clone, Serialize, Deserialize)]
pub struct EmailIdentity {
    destination: EmailDestination,
    private_keys: PrivateKeyPair,
    pub display_name: String,
    pub description: String,
    pub is_default: bool,
    pub created_at: u64,
}

impl EmailIdentity {
    /// Generate fresh keys for `scheme`
    pub fn generate(scheme: SchemeId, display_name: &str) -> Self {
        let (public, private) = scheme.scheme().generate_key_pairs();
        Self::from_keys(public, private, display_name)
    }

    pub fn from_keys(public: PublicKeyPair, private: PrivateKeyPair, display_name: &str) -> Self {
        Self {
            destination: EmailDestination::new(public),
            private_keys: private,
            display_name: display_name.to_string(),
            description: String::new(),
            is_default: false,
            created_at: crate::unix_time(),
        }
    }

    pub fn destination(&self) -> &EmailDestination {
        &self.destination
    }

    pub fn hash(&self) -> Hash256 {
        self.destination.hash()
    }

    pub fn scheme(&self) -> SchemeId {
        self.destination.scheme()
    }

    pub fn private_keys(&self) -> &PrivateKeyPair {
        &self.private_keys
    }

    /// Decrypt data addressed to this identity
    pub fn decrypt(&self, data: &[u8]) -> crypto::Result<Vec<u8>> {
        self.scheme()
            .scheme()
            .decrypt(data, &self.private_keys.encryption_key)
    }

    /// Sign data; the result carries the scheme id prefix
    pub fn sign(&self, data: &[u8]) -> crypto::Result<Vec<u8>> {
        let raw = self
            .scheme()
            .scheme()
            .sign(data, &self.private_keys.signing_key)?;
        Ok(crypto::encode_signature(self.scheme(), &raw))
    }

    /// `public || private` Base64, importable with `import_base64`
    pub fn export_base64(&self) -> String {
        let mut text = self.destination.to_base64();
        text.push_str(&self.private_keys.to_base64());
        text
    }

    pub fn import_base64(text: &str, display_name: &str) -> Result<Self> {
        let text = text.trim();
        let scheme = scheme_for_export_base64(text.len())?;
        let public_len = scheme.scheme().public_base64_len();
        let (public, private) = text.split_at(public_len);
        let public = PublicKeyPair::from_base64(public)?;
        let private = PrivateKeyPair::from_base64(scheme, private)?;
        Ok(Self::from_keys(public, private, display_name))
    }
}

impl fmt::Debug for EmailIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmailIdentity")
            .field("display_name", &self.display_name)
            .field("destination", &self.destination)
            .field("is_default", &self.is_default)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_hash_covers_both_keys() {
        let identity = EmailIdentity::generate(SchemeId::EcP256, "alice");
        let keys = identity.destination().public_keys();
        let mut concatenated = keys.encryption_key.clone();
        concatenated.extend_from_slice(&keys.signing_key);
        assert_eq!(identity.hash(), Hash256::digest(&concatenated));
    }

    #[test]
    fn test_destination_base64_roundtrip() {
        let identity = EmailIdentity::generate(SchemeId::EcP384, "bob");
        let text = identity.destination().to_base64();
        assert_eq!(text.len(), 128);
        let parsed = EmailDestination::from_base64(&text).unwrap();
        assert_eq!(&parsed, identity.destination());
        assert_eq!(parsed.hash(), identity.hash());
    }

    #[test]
    fn test_encrypt_for_destination_decrypt_with_identity() {
        let identity = EmailIdentity::generate(SchemeId::EcP256, "carol");
        let ciphertext = identity.destination().encrypt(b"hello").unwrap();
        assert_eq!(identity.decrypt(&ciphertext).unwrap(), b"hello");
    }

    #[test]
    fn test_sign_carries_scheme_id() {
        let identity = EmailIdentity::generate(SchemeId::EcP256, "dave");
        let signature = identity.sign(b"data").unwrap();
        let (scheme, raw) = crypto::decode_signature(&signature).unwrap();
        assert_eq!(scheme, SchemeId::EcP256);
        assert!(identity.destination().verify(b"data", raw).unwrap());
    }

    #[test]
    fn test_export_import() {
        for scheme in [SchemeId::EcP256, SchemeId::EcP384] {
            let identity = EmailIdentity::generate(scheme, "erin");
            let exported = identity.export_base64();
            let imported = EmailIdentity::import_base64(&exported, "erin again").unwrap();
            assert_eq!(imported.hash(), identity.hash());
            assert_eq!(
                imported.private_keys().to_bytes(),
                identity.private_keys().to_bytes()
            );
        }
        assert!(matches!(
            EmailIdentity::import_base64("short", "x"),
            Err(IdentityError::Crypto(_))
        ));
    }
}
