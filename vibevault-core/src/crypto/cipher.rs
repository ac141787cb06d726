//! AES-256-GCM encryption for vault entries and sync envelopes.
//!
//! - 256-bit key, 96-bit random nonce, 128-bit authentication tag
//! - Ciphertext and tag are one contiguous buffer (tag is the last 16
//!   bytes); the nonce is stored and transmitted separately
//! - Decryption fails closed on any tag mismatch

use crate::crypto::{CryptoError, Result};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use zeroize::Zeroize;

/// Nonce length in bytes.
pub const NONCE_LEN: usize = 12;
/// Authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// A 32-byte symmetric key, zeroized on drop.
///
/// Used for both the at-rest vault key (Argon2id-derived) and the
/// per-sync session key (HKDF-derived).
#[derive(Clone)]
pub struct VaultKey {
    key: [u8; 32],
}

impl VaultKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Generate a random key.
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        Self { key: key.into() }
    }

    /// Raw key bytes (use sparingly).
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl Drop for VaultKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VaultKey(..)")
    }
}

/// A ciphertext with its nonce. `ciphertext` includes the trailing tag.
#[derive(Debug, Clone)]
pub struct Encrypted {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

/// Encrypt data under a fresh random nonce.
pub fn encrypt(key: &VaultKey, plaintext: &[u8]) -> Result<Encrypted> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let nonce_bytes: [u8; NONCE_LEN] = nonce.into();

    // aes-gcm appends the tag, so this is ciphertext || tag already
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(format!("{}", e)))?;

    Ok(Encrypted {
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Decrypt a `ciphertext || tag` buffer. Fails closed on tag mismatch.
pub fn decrypt(key: &VaultKey, nonce: &[u8], ciphertext_with_tag: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::InvalidNonce(format!(
            "expected {} bytes, got {}",
            NONCE_LEN,
            nonce.len()
        )));
    }
    if ciphertext_with_tag.len() < TAG_LEN {
        return Err(CryptoError::DecryptionFailed(
            "Ciphertext too short - missing auth tag".to_string(),
        ));
    }

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let nonce_arr: [u8; NONCE_LEN] = nonce.try_into().expect("length checked above");
    let nonce = Nonce::from(nonce_arr);

    cipher
        .decrypt(&nonce, ciphertext_with_tag)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let key = VaultKey::generate();
        let plaintext = b"Hello, World! This is a test.";

        let encrypted = encrypt(&key, plaintext).unwrap();
        let decrypted = decrypt(&key, &encrypted.nonce, &encrypted.ciphertext).unwrap();

        assert_eq!(plaintext.to_vec(), decrypted);
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let key = VaultKey::generate();

        let encrypted = encrypt(&key, b"").unwrap();
        // Tag only
        assert_eq!(encrypted.ciphertext.len(), TAG_LEN);

        let decrypted = decrypt(&key, &encrypted.nonce, &encrypted.ciphertext).unwrap();
        assert!(decrypted.is_empty());
    }

    #[test]
    fn nonces_are_fresh_per_encryption() {
        let key = VaultKey::generate();
        let plaintext = b"Same data";

        let a = encrypt(&key, plaintext).unwrap();
        let b = encrypt(&key, plaintext).unwrap();

        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
        assert_eq!(
            decrypt(&key, &a.nonce, &a.ciphertext).unwrap(),
            decrypt(&key, &b.nonce, &b.ciphertext).unwrap()
        );
    }

    #[test]
    fn wrong_key_fails() {
        let key1 = VaultKey::generate();
        let key2 = VaultKey::generate();

        let encrypted = encrypt(&key1, b"Secret data").unwrap();
        assert!(matches!(
            decrypt(&key2, &encrypted.nonce, &encrypted.ciphertext),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn single_bit_flips_are_detected() {
        let key = VaultKey::generate();
        let encrypted = encrypt(&key, b"Original data").unwrap();

        // Every byte of ciphertext and tag
        for i in 0..encrypted.ciphertext.len() {
            let mut tampered = encrypted.ciphertext.clone();
            tampered[i] ^= 0x01;
            assert!(
                decrypt(&key, &encrypted.nonce, &tampered).is_err(),
                "flip at ciphertext byte {} went undetected",
                i
            );
        }

        // Every byte of the nonce
        for i in 0..NONCE_LEN {
            let mut nonce = encrypted.nonce;
            nonce[i] ^= 0x01;
            assert!(
                decrypt(&key, &nonce, &encrypted.ciphertext).is_err(),
                "flip at nonce byte {} went undetected",
                i
            );
        }
    }

    #[test]
    fn truncated_ciphertext_fails() {
        let key = VaultKey::generate();
        let encrypted = encrypt(&key, b"Secret data").unwrap();

        let truncated = &encrypted.ciphertext[..encrypted.ciphertext.len() - 1];
        assert!(decrypt(&key, &encrypted.nonce, truncated).is_err());
        assert!(decrypt(&key, &encrypted.nonce, &[0u8; TAG_LEN - 1]).is_err());
    }

    #[test]
    fn bad_nonce_length_rejected() {
        let key = VaultKey::generate();
        let encrypted = encrypt(&key, b"data").unwrap();
        assert!(decrypt(&key, &[0u8; 11], &encrypted.ciphertext).is_err());
    }
}
