//! Encryption of externally stored soup entries using ChaCha20-Poly1305.
//!
//! Files are written as `nonce || ciphertext`. The file key is derived from the
//! store's database key so one key unlocks both.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{StoreError, StoreResult};

/// Size of nonce in bytes (96 bits for ChaCha20-Poly1305).
pub const NONCE_SIZE: usize = 12;

/// Size of authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

const KEY_CONTEXT: &[u8] = b"smartstore/external-entry/v1";

/// Cipher for one store's external entry files
#[derive(Clone)]
pub struct EntryCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for EntryCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryCipher").finish_non_exhaustive()
    }
}

impl EntryCipher {
    pub fn from_store_key(store_key: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KEY_CONTEXT);
        hasher.update(store_key.as_bytes());
        Self {
            key: hasher.finalize().into(),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> StoreResult<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(&self.key.into());

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| StoreError::Crypto(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> StoreResult<Vec<u8>> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(StoreError::Crypto("data too short".to_string()));
        }
        let cipher = ChaCha20Poly1305::new(&self.key.into());
        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                StoreError::Crypto("decryption failed (wrong key or tampered data)".to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = EntryCipher::from_store_key("secret");
        let sealed = cipher.encrypt(br#"{"a":1}"#).unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + 7 + TAG_SIZE);
        assert_eq!(cipher.decrypt(&sealed).unwrap(), br#"{"a":1}"#);
    }

    #[test]
    fn test_nonce_is_random() {
        let cipher = EntryCipher::from_store_key("secret");
        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = EntryCipher::from_store_key("one").encrypt(b"data").unwrap();
        let err = EntryCipher::from_store_key("two").decrypt(&sealed).unwrap_err();
        assert!(matches!(err, StoreError::Crypto(_)));
    }

    #[test]
    fn test_truncated_data_fails() {
        let cipher = EntryCipher::from_store_key("secret");
        assert!(cipher.decrypt(&[0u8; 4]).is_err());
    }
}
