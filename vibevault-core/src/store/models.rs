//! Row types for the vault database.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The registered user (singleton per device).
#[derive(Debug, Clone)]
pub struct User {
    pub username: String,
    /// Argon2id PHC string over `auth_salt`.
    pub password_hash: String,
    pub auth_salt: Vec<u8>,
    pub encryption_salt: Vec<u8>,
}

/// An entry grouping. At least one profile exists after migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: i64,
    pub name: String,
    pub created_at: String,
    /// Count of non-deleted entries, for list rendering.
    pub entry_count: i64,
}

/// A vault entry row. `deleted_at.is_some()` marks a tombstone.
#[derive(Debug, Clone)]
pub struct EntryRow {
    pub id: i64,
    /// Sync identity; immutable after creation.
    pub entry_uuid: Uuid,
    pub label: String,
    /// `ciphertext || tag` under the vault key. Empty for tombstones.
    pub data_blob: Vec<u8>,
    pub nonce: Vec<u8>,
    pub profile_id: i64,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
    /// Strictly increases on every mutation, including soft-delete.
    pub sync_version: i64,
}

impl EntryRow {
    pub fn is_tombstone(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A previously-paired sync peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairedDevice {
    pub id: i64,
    pub device_id: String,
    pub device_name: String,
    /// Peer's long-term public key, compressed SEC1 (33 bytes).
    #[serde(skip)]
    pub public_key: Vec<u8>,
    pub paired_at: String,
    pub last_sync_at: Option<String>,
}

/// Direction of a sync session from the local device's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    Push,
    Pull,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "push" => Self::Push,
            _ => Self::Pull,
        }
    }
}

/// Outcome recorded for a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Success,
    Partial,
    Failed,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "partial" => Self::Partial,
            _ => Self::Failed,
        }
    }
}

/// One row of the sync history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLogRow {
    pub id: i64,
    pub device_id: String,
    pub direction: SyncDirection,
    pub entries_sent: i64,
    pub entries_received: i64,
    pub status: SyncOutcome,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_roundtrip() {
        for d in [SyncDirection::Push, SyncDirection::Pull] {
            assert_eq!(SyncDirection::parse(d.as_str()), d);
        }
    }

    #[test]
    fn outcome_roundtrip() {
        for s in [SyncOutcome::Success, SyncOutcome::Partial, SyncOutcome::Failed] {
            assert_eq!(SyncOutcome::parse(s.as_str()), s);
        }
    }

    #[test]
    fn tombstone_flag_follows_deleted_at() {
        let mut row = EntryRow {
            id: 1,
            entry_uuid: Uuid::new_v4(),
            label: "example.com".to_string(),
            data_blob: vec![1, 2, 3],
            nonce: vec![0; 12],
            profile_id: 1,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
            deleted_at: None,
            sync_version: 1,
        };
        assert!(!row.is_tombstone());
        row.deleted_at = Some("2026-01-02T00:00:00Z".to_string());
        assert!(row.is_tombstone());
    }
}
