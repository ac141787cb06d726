//! Argon2id password hashing and key derivation.
//!
//! Both the authentication hash and the encryption key use Argon2id
//! with m=19456 KiB, t=2, p=1 and a 32-byte output. The parameters are
//! part of the cross-device contract: desktop and mobile must derive
//! byte-identical keys from the same password and salt.

use crate::crypto::{CryptoError, Result};
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};

/// Memory cost in KiB.
pub const KDF_M_COST: u32 = 19_456;
/// Iteration count.
pub const KDF_T_COST: u32 = 2;
/// Parallelism lanes.
pub const KDF_P_COST: u32 = 1;
/// Output length in bytes.
pub const KDF_OUTPUT_LEN: usize = 32;

/// Length of the authentication salt in bytes.
pub const AUTH_SALT_LEN: usize = 16;
/// Length of the encryption salt in bytes.
pub const ENCRYPTION_SALT_LEN: usize = 32;

fn argon2() -> Result<Argon2<'static>> {
    let params = Params::new(KDF_M_COST, KDF_T_COST, KDF_P_COST, Some(KDF_OUTPUT_LEN))
        .map_err(|e| CryptoError::KdfFailed(format!("Invalid parameters: {}", e)))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Hash a master password for authentication storage.
///
/// Returns the standard PHC string (`$argon2id$v=19$m=19456,t=2,p=1$...`),
/// which embeds the salt and parameters for later verification.
pub fn hash_password(password: &[u8], auth_salt: &[u8; AUTH_SALT_LEN]) -> Result<String> {
    let salt = SaltString::encode_b64(auth_salt)
        .map_err(|e| CryptoError::KdfFailed(format!("Failed to encode salt: {}", e)))?;

    let hash = argon2()?
        .hash_password(password, &salt)
        .map_err(|e| CryptoError::KdfFailed(format!("Hashing failed: {}", e)))?;

    Ok(hash.to_string())
}

/// Verify a master password against a stored PHC string.
///
/// The stored string is re-parsed; its embedded parameters drive the
/// recomputation, so old hashes keep verifying across parameter bumps.
pub fn verify_password(password: &[u8], stored: &str) -> Result<bool> {
    let parsed = PasswordHash::new(stored)
        .map_err(|e| CryptoError::KdfFailed(format!("Invalid stored hash: {}", e)))?;

    Ok(argon2()?.verify_password(password, &parsed).is_ok())
}

/// Derive the 32-byte AES-256-GCM vault key from the master password.
///
/// Runs over `encryption_salt`, which is independent of the
/// authentication salt so the stored hash cannot be turned into the
/// data key.
pub fn derive_encryption_key(
    password: &[u8],
    encryption_salt: &[u8; ENCRYPTION_SALT_LEN],
) -> Result<[u8; KDF_OUTPUT_LEN]> {
    let mut key = [0u8; KDF_OUTPUT_LEN];
    argon2()?
        .hash_password_into(password, encryption_salt, &mut key)
        .map_err(|e| CryptoError::KdfFailed(format!("Key derivation failed: {}", e)))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn random_salt<const N: usize>() -> [u8; N] {
        let mut salt = [0u8; N];
        rand::thread_rng().fill_bytes(&mut salt);
        salt
    }

    #[test]
    fn hash_produces_phc_string_with_parameters() {
        let salt = random_salt::<AUTH_SALT_LEN>();
        let hash = hash_password(b"correct horse battery staple", &salt).unwrap();

        assert!(hash.starts_with("$argon2id$"));
        assert!(hash.contains("m=19456,t=2,p=1"));
    }

    #[test]
    fn verify_accepts_correct_password() {
        let salt = random_salt::<AUTH_SALT_LEN>();
        let hash = hash_password(b"hunter2hunter2", &salt).unwrap();

        assert!(verify_password(b"hunter2hunter2", &hash).unwrap());
    }

    #[test]
    fn verify_rejects_wrong_password() {
        let salt = random_salt::<AUTH_SALT_LEN>();
        let hash = hash_password(b"hunter2hunter2", &salt).unwrap();

        assert!(!verify_password(b"hunter3hunter3", &hash).unwrap());
    }

    #[test]
    fn verify_rejects_garbage_hash() {
        assert!(verify_password(b"pw", "not-a-phc-string").is_err());
    }

    #[test]
    fn derivation_is_deterministic() {
        let salt = random_salt::<ENCRYPTION_SALT_LEN>();

        let key1 = derive_encryption_key(b"master password", &salt).unwrap();
        let key2 = derive_encryption_key(b"master password", &salt).unwrap();
        assert_eq!(key1, key2);

        let key3 = derive_encryption_key(b"other password", &salt).unwrap();
        assert_ne!(key1, key3);

        let other_salt = random_salt::<ENCRYPTION_SALT_LEN>();
        let key4 = derive_encryption_key(b"master password", &other_salt).unwrap();
        assert_ne!(key1, key4);
    }

    #[test]
    fn derived_key_differs_from_auth_hash_output() {
        // Same password, disjoint salts: the auth hash must not leak the
        // encryption key.
        let auth_salt = random_salt::<AUTH_SALT_LEN>();
        let enc_salt = random_salt::<ENCRYPTION_SALT_LEN>();

        let hash = hash_password(b"shared password", &auth_salt).unwrap();
        let key = derive_encryption_key(b"shared password", &enc_salt).unwrap();

        assert!(!hash.contains(&hex::encode(key)));
    }
}
