//! Short-authentication-string pairing.
//!
//! The peripheral shows a random 6-digit code and publishes an
//! ephemeral P-256 public key. The central proves it saw the same code
//! by sending `its_public_key || HMAC-SHA256(code, its_public_key)`.
//! Both sides then run ECDH and stretch the shared secret through
//! HKDF-SHA256 into the 32-byte session key.

use crate::crypto::VaultKey;
use crate::{Result, SyncErrorKind, VaultError};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p256::{ecdh::EphemeralSecret, elliptic_curve::sec1::ToEncodedPoint, PublicKey};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// HKDF `info` label binding keys to this protocol revision.
const HKDF_INFO: &[u8] = b"vibevault-sync-v1";

/// Compressed SEC1 point length.
pub const PUBLIC_KEY_LEN: usize = 33;
/// HMAC-SHA256 output length.
pub const PAIRING_MAC_LEN: usize = 32;

/// Generate a random 6-digit pairing code.
pub fn generate_pairing_code() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{:06}", u32::from_le_bytes(bytes) % 1_000_000)
}

/// HMAC over public key bytes, keyed by the pairing code.
pub fn pairing_mac(code: &str, public_key: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(code.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(public_key);
    mac.finalize().into_bytes().to_vec()
}

/// Constant-time verification of a peer's pairing MAC.
pub fn verify_pairing_mac(code: &str, public_key: &[u8], mac: &[u8]) -> bool {
    let mut expected = HmacSha256::new_from_slice(code.as_bytes())
        .expect("hmac accepts any key length");
    expected.update(public_key);
    expected.verify_slice(mac).is_ok()
}

/// An ephemeral ECDH keypair, generated fresh per pairing attempt.
pub struct EphemeralKeys {
    secret: EphemeralSecret,
    public_bytes: Vec<u8>,
}

impl EphemeralKeys {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut rand::thread_rng());
        let public_bytes = PublicKey::from(&secret)
            .to_encoded_point(true)
            .as_bytes()
            .to_vec();
        Self {
            secret,
            public_bytes,
        }
    }

    /// Our public key, compressed (33 bytes).
    pub fn public_bytes(&self) -> &[u8] {
        &self.public_bytes
    }

    /// Complete the key agreement. Consumes the secret so a keypair can
    /// never be reused across pairing attempts.
    pub fn agree(self, peer_public: &[u8]) -> Result<VaultKey> {
        let peer = PublicKey::from_sec1_bytes(peer_public)
            .map_err(|_| VaultError::Sync(SyncErrorKind::CryptoMismatch))?;

        let shared = self.secret.diffie_hellman(&peer);

        let hkdf = Hkdf::<Sha256>::new(None, shared.raw_secret_bytes());
        let mut session_key = [0u8; 32];
        hkdf.expand(HKDF_INFO, &mut session_key)
            .map_err(|_| VaultError::Sync(SyncErrorKind::CryptoMismatch))?;

        Ok(VaultKey::from_bytes(session_key))
    }
}

/// Split a central's pairing write into `(public_key, mac)`.
pub fn split_pairing_payload(payload: &[u8]) -> Result<(&[u8], &[u8])> {
    if payload.len() != PUBLIC_KEY_LEN + PAIRING_MAC_LEN {
        return Err(VaultError::Sync(SyncErrorKind::CryptoMismatch));
    }
    Ok(payload.split_at(PUBLIC_KEY_LEN))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairing_code_is_six_digits() {
        for _ in 0..100 {
            let code = generate_pairing_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn both_sides_derive_the_same_session_key() {
        let desktop = EphemeralKeys::generate();
        let phone = EphemeralKeys::generate();

        let desktop_pub = desktop.public_bytes().to_vec();
        let phone_pub = phone.public_bytes().to_vec();
        assert_eq!(desktop_pub.len(), PUBLIC_KEY_LEN);

        let key_a = desktop.agree(&phone_pub).unwrap();
        let key_b = phone.agree(&desktop_pub).unwrap();
        assert_eq!(key_a.as_bytes(), key_b.as_bytes());
        assert_ne!(key_a.as_bytes(), &[0u8; 32]);
    }

    #[test]
    fn distinct_pairings_yield_distinct_keys() {
        let a1 = EphemeralKeys::generate();
        let b1 = EphemeralKeys::generate();
        let b1_pub = b1.public_bytes().to_vec();
        let key1 = a1.agree(&b1_pub).unwrap();

        let a2 = EphemeralKeys::generate();
        let b2 = EphemeralKeys::generate();
        let b2_pub = b2.public_bytes().to_vec();
        let key2 = a2.agree(&b2_pub).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn garbage_public_key_is_rejected() {
        let keys = EphemeralKeys::generate();
        assert!(keys.agree(&[0u8; PUBLIC_KEY_LEN]).is_err());
    }

    #[test]
    fn mac_verifies_with_the_right_code_only() {
        let keys = EphemeralKeys::generate();
        let mac = pairing_mac("123456", keys.public_bytes());
        assert_eq!(mac.len(), PAIRING_MAC_LEN);

        assert!(verify_pairing_mac("123456", keys.public_bytes(), &mac));
        assert!(!verify_pairing_mac("654321", keys.public_bytes(), &mac));
    }

    #[test]
    fn mac_binds_the_public_key() {
        let keys = EphemeralKeys::generate();
        let other = EphemeralKeys::generate();
        let mac = pairing_mac("123456", keys.public_bytes());

        // A swapped-in attacker key must not verify
        assert!(!verify_pairing_mac("123456", other.public_bytes(), &mac));
    }

    #[test]
    fn pairing_payload_split() {
        let payload = vec![0u8; PUBLIC_KEY_LEN + PAIRING_MAC_LEN];
        let (public, mac) = split_pairing_payload(&payload).unwrap();
        assert_eq!(public.len(), PUBLIC_KEY_LEN);
        assert_eq!(mac.len(), PAIRING_MAC_LEN);

        assert!(split_pairing_payload(&[0u8; 10]).is_err());
        assert!(split_pairing_payload(&[0u8; 66]).is_err());
    }
}
