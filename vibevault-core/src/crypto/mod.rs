//! Cryptographic primitives for the vault core.
//!
//! This module provides:
//! - Argon2id password hashing and key derivation
//! - AES-256-GCM encryption/decryption
//! - Zeroization utilities

pub mod cipher;
pub mod kdf;
pub mod zero;

pub use cipher::{decrypt, encrypt, Encrypted, VaultKey};
pub use kdf::{derive_encryption_key, hash_password, verify_password, KDF_OUTPUT_LEN};
pub use zero::SecureBuffer;

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KdfFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Invalid nonce: {0}")]
    InvalidNonce(String),

    #[error("Authentication failed - data may have been tampered with")]
    AuthenticationFailed,

    #[error("Key agreement failed: {0}")]
    KeyAgreementFailed(String),
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;
