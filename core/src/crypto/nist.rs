// NIST elliptic-curve schemes: ECDH key agreement + ECDSA signatures
//
// Encryption flow:
// 1. Generate an ephemeral key pair on the recipient's curve
// 2. ECDH: ephemeral_secret × recipient_public → shared_secret
// 3. KDF: SHA-256(shared_secret) → AES-256 key
// 4. AES-256-CBC/PKCS7 with a random IV
// 5. Output: ephemeral_public (SEC1 compressed) || IV || ciphertext
//
// Public keys are always generated with an even y-coordinate, so their
// compressed encoding starts with 0x02 and the Base64 forms can omit it.

use super::{symmetric, CryptoError, CryptoScheme, KeyPair, Result, SchemeId};
use rand::rngs::OsRng;
use zeroize::{Zeroize, Zeroizing};

/// SEC1 tag of a compressed point with even y
pub const EVEN_Y_PREFIX: u8 = 0x02;

macro_rules! nist_scheme {
    (
        $(#[$meta:meta])*
        $name:ident, $curve:ident, $id:expr, $label:expr, point_len = $point_len:expr, scalar_len = $scalar_len:expr
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl $name {
            /// Compressed SEC1 point length
            pub const POINT_LEN: usize = $point_len;
            /// Private scalar length
            pub const SCALAR_LEN: usize = $scalar_len;

            fn even_secret() -> $curve::SecretKey {
                use $curve::elliptic_curve::sec1::ToEncodedPoint;
                loop {
                    let secret = $curve::SecretKey::random(&mut OsRng);
                    if secret.public_key().to_encoded_point(true).as_bytes()[0] == EVEN_Y_PREFIX {
                        return secret;
                    }
                }
            }

            fn even_signing_key() -> $curve::ecdsa::SigningKey {
                loop {
                    let key = $curve::ecdsa::SigningKey::random(&mut OsRng);
                    if key.verifying_key().to_encoded_point(true).as_bytes()[0] == EVEN_Y_PREFIX {
                        return key;
                    }
                }
            }

            fn parse_public(bytes: &[u8]) -> Result<$curve::PublicKey> {
                if bytes.len() != Self::POINT_LEN {
                    return Err(CryptoError::InvalidKeyLength {
                        expected: Self::POINT_LEN,
                        actual: bytes.len(),
                    });
                }
                $curve::PublicKey::from_sec1_bytes(bytes)
                    .map_err(|_| CryptoError::InvalidKey("not a point on the curve".to_string()))
            }

            fn check_private_len(bytes: &[u8]) -> Result<()> {
                if bytes.len() != Self::SCALAR_LEN {
                    return Err(CryptoError::InvalidKeyLength {
                        expected: Self::SCALAR_LEN,
                        actual: bytes.len(),
                    });
                }
                Ok(())
            }
        }

        impl CryptoScheme for $name {
            fn id(&self) -> SchemeId {
                $id
            }

            fn name(&self) -> &'static str {
                $label
            }

            fn encryption_public_len(&self) -> usize {
                Self::POINT_LEN
            }

            fn signing_public_len(&self) -> usize {
                Self::POINT_LEN
            }

            fn encryption_private_len(&self) -> usize {
                Self::SCALAR_LEN
            }

            fn signing_private_len(&self) -> usize {
                Self::SCALAR_LEN
            }

            fn signature_len(&self) -> usize {
                2 * Self::SCALAR_LEN
            }

            fn encapsulation_len(&self) -> usize {
                Self::POINT_LEN
            }

            fn public_key_prefix(&self) -> Option<u8> {
                Some(EVEN_Y_PREFIX)
            }

            fn generate_encryption_key_pair(&self) -> KeyPair {
                use $curve::elliptic_curve::sec1::ToEncodedPoint;
                let secret = Self::even_secret();
                KeyPair {
                    public: secret.public_key().to_encoded_point(true).as_bytes().to_vec(),
                    private: Zeroizing::new(secret.to_bytes().to_vec()),
                }
            }

            fn generate_signing_key_pair(&self) -> KeyPair {
                let key = Self::even_signing_key();
                KeyPair {
                    public: key.verifying_key().to_encoded_point(true).as_bytes().to_vec(),
                    private: Zeroizing::new(key.to_bytes().to_vec()),
                }
            }

            fn encrypt(&self, data: &[u8], recipient_key: &[u8]) -> Result<Vec<u8>> {
                use $curve::elliptic_curve::sec1::ToEncodedPoint;
                let recipient = Self::parse_public(recipient_key)?;

                let ephemeral = $curve::ecdh::EphemeralSecret::random(&mut OsRng);
                let ephemeral_public = ephemeral.public_key().to_encoded_point(true);
                let shared = ephemeral.diffie_hellman(&recipient);

                let mut key = symmetric::derive_key(shared.raw_secret_bytes());
                let ciphertext = symmetric::encrypt(&key, data);
                key.zeroize();
                let ciphertext = ciphertext?;

                let mut out = Vec::with_capacity(Self::POINT_LEN + ciphertext.len());
                out.extend_from_slice(ephemeral_public.as_bytes());
                out.extend_from_slice(&ciphertext);
                Ok(out)
            }

            fn decrypt(&self, data: &[u8], private_key: &[u8]) -> Result<Vec<u8>> {
                Self::check_private_len(private_key)?;
                if data.len() < Self::POINT_LEN + 2 * symmetric::IV_LEN {
                    return Err(CryptoError::DecryptionFailed);
                }
                let secret = $curve::SecretKey::from_slice(private_key)
                    .map_err(|_| CryptoError::InvalidKey("invalid private scalar".to_string()))?;
                let (ephemeral_bytes, ciphertext) = data.split_at(Self::POINT_LEN);
                let ephemeral = $curve::PublicKey::from_sec1_bytes(ephemeral_bytes)
                    .map_err(|_| CryptoError::DecryptionFailed)?;

                let shared = $curve::ecdh::diffie_hellman(
                    secret.to_nonzero_scalar(),
                    ephemeral.as_affine(),
                );
                let mut key = symmetric::derive_key(shared.raw_secret_bytes());
                let plaintext = symmetric::decrypt(&key, ciphertext);
                key.zeroize();
                plaintext
            }

            fn sign(&self, data: &[u8], private_key: &[u8]) -> Result<Vec<u8>> {
                use $curve::ecdsa::signature::Signer;
                Self::check_private_len(private_key)?;
                let key = $curve::ecdsa::SigningKey::from_slice(private_key)
                    .map_err(|_| CryptoError::InvalidKey("invalid signing key".to_string()))?;
                let signature: $curve::ecdsa::Signature = key.sign(data);
                Ok(signature.to_bytes().to_vec())
            }

            fn verify(&self, data: &[u8], signature: &[u8], public_key: &[u8]) -> Result<bool> {
                use $curve::ecdsa::signature::Verifier;
                if public_key.len() != Self::POINT_LEN {
                    return Err(CryptoError::InvalidKeyLength {
                        expected: Self::POINT_LEN,
                        actual: public_key.len(),
                    });
                }
                let key = $curve::ecdsa::VerifyingKey::from_sec1_bytes(public_key)
                    .map_err(|_| CryptoError::InvalidKey("invalid verifying key".to_string()))?;
                let signature = $curve::ecdsa::Signature::from_slice(signature)
                    .map_err(|_| CryptoError::InvalidSignature)?;
                Ok(key.verify(data, &signature).is_ok())
            }
        }
    };
}

nist_scheme!(
    /// ECDH-256 / ECDSA-256 on NIST P-256
    EcP256, p256, SchemeId::EcP256, "ECDH-256/ECDSA-256", point_len = 33, scalar_len = 32
);

nist_scheme!(
    /// ECDH-384 / ECDSA-384 on NIST P-384
    EcP384, p384, SchemeId::EcP384, "ECDH-384/ECDSA-384", point_len = 49, scalar_len = 48
);
