//! VibeVault Core Library
//!
//! This library provides the security and sync core for VibeVault:
//! cryptographic operations, the encrypted store, session management,
//! TOTP generation, and BLE peer-to-peer synchronization.

pub mod api;
pub mod auth;
pub mod ble;
pub mod config;
pub mod crypto;
pub mod lockout;
pub mod session;
pub mod store;
pub mod sync;
pub mod totp;
pub mod vault;

pub use api::VibeVault;
pub use config::CoreConfig;
pub use crypto::{CryptoError, VaultKey};
pub use session::{SessionManager, SessionToken};
pub use store::Store;
pub use sync::{SyncDirection, SyncSnapshot};
pub use totp::TotpCode;
pub use vault::{EntryPayload, VaultEntry};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, VaultError>;

/// Error taxonomy surfaced to the UI as tagged values.
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("No user is registered on this device")]
    NotRegistered,

    #[error("A user is already registered on this device")]
    AlreadyRegistered,

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Too many failed attempts. Try again in {0} seconds")]
    TooManyAttempts(u64),

    #[error("Session expired. Please unlock the vault again")]
    SessionExpired,

    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("Not found")]
    NotFound,

    #[error("Conflict")]
    Conflict,

    #[error("Stored data failed an integrity check")]
    Decrypt,

    #[error("Database error: {0}")]
    Store(String),

    #[error("Sync error: {0}")]
    Sync(SyncErrorKind),

    #[error("Crypto error: {0}")]
    Crypto(String),
}

impl VaultError {
    /// Shorthand for a field validation failure.
    pub fn validation(field: &str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failure categories of the sync state machine.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    #[error("another sync is already in progress")]
    Busy,
    #[error("the peer did not respond in time")]
    Timeout,
    #[error("a transfer frame was corrupted")]
    FramingError,
    #[error("pairing verification failed")]
    CryptoMismatch,
    #[error("the peer aborted the sync")]
    PeerAbort,
    #[error("the sync was cancelled")]
    Cancelled,
}

impl From<SyncErrorKind> for VaultError {
    fn from(kind: SyncErrorKind) -> Self {
        VaultError::Sync(kind)
    }
}

impl From<crypto::CryptoError> for VaultError {
    fn from(e: crypto::CryptoError) -> Self {
        match e {
            crypto::CryptoError::AuthenticationFailed => VaultError::Decrypt,
            other => VaultError::Crypto(other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for VaultError {
    fn from(e: rusqlite::Error) -> Self {
        VaultError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::Store(format!("payload serialization: {}", e))
    }
}
