// AES-256-CBC with PKCS#7 padding — bulk cipher shared by all hybrid schemes
//
// Output layout: IV (16 bytes) || ciphertext

use super::{CryptoError, Result};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use sha2::{Digest, Sha256};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES block / IV size
pub const IV_LEN: usize = 16;

pub const BLOCK_LEN: usize = 16;

/// Symmetric key size (256 bits)
pub const KEY_LEN: usize = 32;

/// Derive the AES key from a key-agreement shared secret
pub fn derive_key(shared_secret: &[u8]) -> [u8; KEY_LEN] {
    Sha256::digest(shared_secret).into()
}

/// Output length of `encrypt` for `plaintext_len` bytes
pub fn padded_len(plaintext_len: usize) -> usize {
    IV_LEN + (plaintext_len / BLOCK_LEN + 1) * BLOCK_LEN
}

/// Encrypt with a fresh random IV
pub fn encrypt(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let encryptor =
        Aes256CbcEnc::new_from_slices(key, &iv).map_err(|_| CryptoError::EncryptionFailed)?;
    let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt `IV || ciphertext`
pub fn decrypt(key: &[u8; KEY_LEN], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 2 * IV_LEN || (data.len() - IV_LEN) % IV_LEN != 0 {
        return Err(CryptoError::DecryptionFailed);
    }
    let (iv, ciphertext) = data.split_at(IV_LEN);
    let decryptor =
        Aes256CbcDec::new_from_slices(key, iv).map_err(|_| CryptoError::DecryptionFailed)?;
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let key = derive_key(b"shared secret");
        let ciphertext = encrypt(&key, b"hello world").unwrap();
        assert_eq!(ciphertext.len(), IV_LEN + 16);
        assert_eq!(decrypt(&key, &ciphertext).unwrap(), b"hello world");
    }

    #[test]
    fn test_block_aligned_plaintext_gets_full_pad_block() {
        let key = derive_key(b"k");
        let ciphertext = encrypt(&key, &[1u8; 32]).unwrap();
        assert_eq!(ciphertext.len(), IV_LEN + 48);
    }

    #[test]
    fn test_random_iv() {
        let key = derive_key(b"k");
        let a = encrypt(&key, b"same").unwrap();
        let b = encrypt(&key, b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_truncated_input_rejected() {
        let key = derive_key(b"k");
        assert_eq!(decrypt(&key, &[0u8; 16]), Err(CryptoError::DecryptionFailed));
        assert_eq!(decrypt(&key, &[0u8; 40]), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_wrong_key_rejected_or_garbled() {
        let ciphertext = encrypt(&derive_key(b"a"), b"secret payload").unwrap();
        match decrypt(&derive_key(b"b"), &ciphertext) {
            Err(e) => assert_eq!(e, CryptoError::DecryptionFailed),
            Ok(plain) => assert_ne!(plain, b"secret payload"),
        }
    }
}
