// Lattice scheme: Kyber-768 key encapsulation + Dilithium-3 signatures
//
// Encryption: Kyber encapsulates a fresh random 256-bit secret to the
// recipient's public key; that secret keys AES-256-CBC for the payload.
// Output: kem_ciphertext || IV || AES ciphertext

use super::{symmetric, CryptoError, CryptoScheme, KeyPair, Result, SchemeId};
use pqcrypto_dilithium::dilithium3;
use pqcrypto_kyber::kyber768;
use pqcrypto_traits::kem::{
    Ciphertext as _, PublicKey as _, SecretKey as _, SharedSecret as _,
};
use pqcrypto_traits::sign::{
    DetachedSignature as _, PublicKey as _, SecretKey as _,
};
use zeroize::{Zeroize, Zeroizing};

/// Kyber-768 / Dilithium-3
#[derive(Debug, Clone, Copy, Default)]
pub struct KyberDilithium;

impl KyberDilithium {
    fn key_len_check(bytes: &[u8], expected: usize) -> Result<()> {
        if bytes.len() != expected {
            return Err(CryptoError::InvalidKeyLength {
                expected,
                actual: bytes.len(),
            });
        }
        Ok(())
    }

    fn shared_key(secret: &[u8]) -> Result<[u8; symmetric::KEY_LEN]> {
        secret
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("unexpected KEM secret size".to_string()))
    }
}

impl CryptoScheme for KyberDilithium {
    fn id(&self) -> SchemeId {
        SchemeId::Lattice
    }

    fn name(&self) -> &'static str {
        "KYBER-768/DILITHIUM-3"
    }

    fn encryption_public_len(&self) -> usize {
        kyber768::public_key_bytes()
    }

    fn signing_public_len(&self) -> usize {
        dilithium3::public_key_bytes()
    }

    fn encryption_private_len(&self) -> usize {
        kyber768::secret_key_bytes()
    }

    fn signing_private_len(&self) -> usize {
        dilithium3::secret_key_bytes()
    }

    fn signature_len(&self) -> usize {
        dilithium3::signature_bytes()
    }

    fn encapsulation_len(&self) -> usize {
        kyber768::ciphertext_bytes()
    }

    fn generate_encryption_key_pair(&self) -> KeyPair {
        let (public, secret) = kyber768::keypair();
        KeyPair {
            public: public.as_bytes().to_vec(),
            private: Zeroizing::new(secret.as_bytes().to_vec()),
        }
    }

    fn generate_signing_key_pair(&self) -> KeyPair {
        let (public, secret) = dilithium3::keypair();
        KeyPair {
            public: public.as_bytes().to_vec(),
            private: Zeroizing::new(secret.as_bytes().to_vec()),
        }
    }

    fn encrypt(&self, data: &[u8], recipient_key: &[u8]) -> Result<Vec<u8>> {
        Self::key_len_check(recipient_key, kyber768::public_key_bytes())?;
        let public = kyber768::PublicKey::from_bytes(recipient_key)
            .map_err(|_| CryptoError::InvalidKey("invalid Kyber public key".to_string()))?;

        let (shared, kem_ciphertext) = kyber768::encapsulate(&public);
        let mut key = Self::shared_key(shared.as_bytes())?;
        let ciphertext = symmetric::encrypt(&key, data);
        key.zeroize();
        let ciphertext = ciphertext?;

        let mut out = Vec::with_capacity(kem_ciphertext.as_bytes().len() + ciphertext.len());
        out.extend_from_slice(kem_ciphertext.as_bytes());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8], private_key: &[u8]) -> Result<Vec<u8>> {
        Self::key_len_check(private_key, kyber768::secret_key_bytes())?;
        let kem_len = kyber768::ciphertext_bytes();
        if data.len() < kem_len + 2 * symmetric::IV_LEN {
            return Err(CryptoError::DecryptionFailed);
        }
        let secret = kyber768::SecretKey::from_bytes(private_key)
            .map_err(|_| CryptoError::InvalidKey("invalid Kyber secret key".to_string()))?;
        let (kem_bytes, ciphertext) = data.split_at(kem_len);
        let kem_ciphertext =
            kyber768::Ciphertext::from_bytes(kem_bytes).map_err(|_| CryptoError::DecryptionFailed)?;

        // Kyber decapsulation never fails outright; a foreign ciphertext yields
        // an unrelated secret and the AES padding check rejects it.
        let shared = kyber768::decapsulate(&kem_ciphertext, &secret);
        let mut key = Self::shared_key(shared.as_bytes())?;
        let plaintext = symmetric::decrypt(&key, ciphertext);
        key.zeroize();
        plaintext
    }

    fn sign(&self, data: &[u8], private_key: &[u8]) -> Result<Vec<u8>> {
        Self::key_len_check(private_key, dilithium3::secret_key_bytes())?;
        let secret = dilithium3::SecretKey::from_bytes(private_key)
            .map_err(|_| CryptoError::InvalidKey("invalid Dilithium secret key".to_string()))?;
        let signature = dilithium3::detached_sign(data, &secret);
        Ok(signature.as_bytes().to_vec())
    }

    fn verify(&self, data: &[u8], signature: &[u8], public_key: &[u8]) -> Result<bool> {
        Self::key_len_check(public_key, dilithium3::public_key_bytes())?;
        let public = dilithium3::PublicKey::from_bytes(public_key)
            .map_err(|_| CryptoError::InvalidKey("invalid Dilithium public key".to_string()))?;
        let signature = dilithium3::DetachedSignature::from_bytes(signature)
            .map_err(|_| CryptoError::InvalidSignature)?;
        Ok(dilithium3::verify_detached_signature(&signature, data, &public).is_ok())
    }
}
