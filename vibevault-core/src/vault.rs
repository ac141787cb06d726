//! Vault service: encrypt on save, decrypt on read.
//!
//! All encryption happens here, keyed by the session's vault key. The
//! UI sees plaintext payloads and opaque ids only; ciphertext never
//! leaves the core.

use crate::crypto::{cipher, zero::SecureBuffer};
use crate::session::{SessionManager, SessionToken};
use crate::store::Store;
use crate::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::warn;
use uuid::Uuid;
use zeroize::Zeroize;

/// The plaintext contents of an entry. Serialized as canonical JSON
/// before encryption; every field is nullable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPayload {
    pub username: Option<String>,
    pub password: Option<String>,
    pub totp_secret: Option<String>,
    pub notes: Option<String>,
}

/// A decrypted entry as returned to the UI.
#[derive(Debug, Clone, Serialize)]
pub struct VaultEntry {
    pub id: i64,
    pub entry_uuid: Uuid,
    pub label: String,
    pub payload: EntryPayload,
}

pub struct VaultService {
    store: Arc<Mutex<Store>>,
    sessions: Arc<SessionManager>,
}

impl VaultService {
    pub fn new(store: Arc<Mutex<Store>>, sessions: Arc<SessionManager>) -> Self {
        Self { store, sessions }
    }

    /// Encrypt and insert a new entry. Returns its sync identity.
    pub fn save(
        &self,
        token: &SessionToken,
        label: &str,
        payload: &EntryPayload,
        profile_id: Option<i64>,
    ) -> Result<Uuid> {
        let label = label.trim();
        if label.is_empty() {
            return Err(VaultError::validation("label", "must not be empty"));
        }

        let key = self.sessions.key_for(token)?;
        let profile_id = match profile_id {
            Some(id) => id,
            None => self.sessions.profile_id(token)?,
        };

        let mut plaintext = serde_json::to_vec(payload)?;
        let encrypted = cipher::encrypt(&key, &plaintext)?;
        plaintext.zeroize();

        let entry_uuid = Uuid::new_v4();
        self.store()?.insert_entry(
            &entry_uuid,
            label,
            &encrypted.ciphertext,
            &encrypted.nonce,
            profile_id,
        )?;

        Ok(entry_uuid)
    }

    /// Re-encrypt an existing entry, bumping its version.
    pub fn update(
        &self,
        token: &SessionToken,
        id: i64,
        label: &str,
        payload: &EntryPayload,
    ) -> Result<()> {
        let label = label.trim();
        if label.is_empty() {
            return Err(VaultError::validation("label", "must not be empty"));
        }

        let key = self.sessions.key_for(token)?;

        let store = self.store()?;
        let row = store.get_entry(id)?.ok_or(VaultError::NotFound)?;
        if row.is_tombstone() {
            return Err(VaultError::NotFound);
        }

        let mut plaintext = serde_json::to_vec(payload)?;
        let encrypted = cipher::encrypt(&key, &plaintext)?;
        plaintext.zeroize();

        store.update_entry(id, label, &encrypted.ciphertext, &encrypted.nonce)
    }

    /// Decrypt every active entry of the session's profile.
    ///
    /// A row that fails authentication is dropped from the result and
    /// logged; the whole call fails only when no row survives.
    pub fn get_all(&self, token: &SessionToken) -> Result<Vec<VaultEntry>> {
        let key = self.sessions.key_for(token)?;
        let profile_id = self.sessions.profile_id(token)?;

        let rows = self.store()?.get_active_entries(profile_id)?;
        let total = rows.len();

        let mut entries = Vec::with_capacity(total);
        for row in rows {
            match cipher::decrypt(&key, &row.nonce, &row.data_blob) {
                Ok(plaintext) => {
                    let plaintext = SecureBuffer::new(plaintext);
                    match serde_json::from_slice(plaintext.as_bytes()) {
                        Ok(payload) => entries.push(VaultEntry {
                            id: row.id,
                            entry_uuid: row.entry_uuid,
                            label: row.label,
                            payload,
                        }),
                        Err(e) => {
                            warn!(entry_id = row.id, error = %e, "dropping entry with malformed payload");
                        }
                    }
                }
                Err(_) => {
                    warn!(entry_id = row.id, "dropping entry that failed authentication");
                }
            }
        }

        if entries.is_empty() && total > 0 {
            return Err(VaultError::Decrypt);
        }
        Ok(entries)
    }

    /// Decrypt a single entry by local id.
    pub fn get(&self, token: &SessionToken, id: i64) -> Result<VaultEntry> {
        let key = self.sessions.key_for(token)?;

        let row = self.store()?.get_entry(id)?.ok_or(VaultError::NotFound)?;
        if row.is_tombstone() {
            return Err(VaultError::NotFound);
        }

        let plaintext = SecureBuffer::new(cipher::decrypt(&key, &row.nonce, &row.data_blob)?);
        let payload = serde_json::from_slice(plaintext.as_bytes())?;

        Ok(VaultEntry {
            id: row.id,
            entry_uuid: row.entry_uuid,
            label: row.label,
            payload,
        })
    }

    /// Tombstone an entry.
    pub fn soft_delete(&self, token: &SessionToken, id: i64) -> Result<()> {
        self.sessions.touch(token)?;
        self.store()?.soft_delete_entry(id)
    }

    fn store(&self) -> Result<std::sync::MutexGuard<'_, Store>> {
        self.store
            .lock()
            .map_err(|_| VaultError::Store("store mutex poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::VaultKey;
    use std::time::Duration;

    fn setup() -> (VaultService, SessionToken) {
        let store = Arc::new(Mutex::new(Store::in_memory().unwrap()));
        let sessions = Arc::new(SessionManager::new(Duration::from_secs(600)));
        let token = sessions.create(VaultKey::generate(), 1);
        (VaultService::new(store, sessions), token)
    }

    fn sample_payload() -> EntryPayload {
        EntryPayload {
            username: Some("a".to_string()),
            password: Some("p".to_string()),
            totp_secret: None,
            notes: Some(String::new()),
        }
    }

    #[test]
    fn save_and_read_back_byte_for_byte() {
        let (vault, token) = setup();
        let payload = sample_payload();

        let uuid = vault.save(&token, "github.com", &payload, None).unwrap();

        let entries = vault.get_all(&token).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_uuid, uuid);
        assert_eq!(entries[0].label, "github.com");
        assert_eq!(entries[0].payload, payload);
    }

    #[test]
    fn payload_json_uses_camel_case_totp_field() {
        let payload = EntryPayload {
            totp_secret: Some("JBSWY3DPEHPK3PXP".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"totpSecret\""));
    }

    #[test]
    fn empty_label_rejected() {
        let (vault, token) = setup();
        assert!(matches!(
            vault.save(&token, "  ", &sample_payload(), None),
            Err(VaultError::Validation { .. })
        ));
    }

    #[test]
    fn update_reencrypts_and_bumps() {
        let (vault, token) = setup();
        vault
            .save(&token, "github.com", &sample_payload(), None)
            .unwrap();
        let id = vault.get_all(&token).unwrap()[0].id;

        let mut changed = sample_payload();
        changed.password = Some("rotated".to_string());
        vault.update(&token, id, "github.com", &changed).unwrap();

        let entry = vault.get(&token, id).unwrap();
        assert_eq!(entry.payload.password.as_deref(), Some("rotated"));
    }

    #[test]
    fn delete_hides_entry_from_listing() {
        let (vault, token) = setup();
        vault
            .save(&token, "github.com", &sample_payload(), None)
            .unwrap();
        let id = vault.get_all(&token).unwrap()[0].id;

        vault.soft_delete(&token, id).unwrap();
        assert!(vault.get_all(&token).unwrap().is_empty());
        assert!(matches!(vault.get(&token, id), Err(VaultError::NotFound)));
    }

    #[test]
    fn stale_token_fails_with_session_expired() {
        let (vault, _) = setup();
        let err = vault
            .get_all(&SessionToken::from("not-a-token"))
            .unwrap_err();
        assert!(matches!(err, VaultError::SessionExpired));
    }

    #[test]
    fn corrupted_row_is_dropped_not_fatal() {
        let (vault, token) = setup();
        vault.save(&token, "good.com", &sample_payload(), None).unwrap();
        vault.save(&token, "bad.com", &sample_payload(), None).unwrap();

        // Corrupt the second row's ciphertext directly
        {
            let store = vault.store.lock().unwrap();
            store
                .conn()
                .execute(
                    "UPDATE vault_entries SET data_blob = x'DEADBEEF' WHERE label = 'bad.com'",
                    [],
                )
                .unwrap();
        }

        let entries = vault.get_all(&token).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].label, "good.com");
    }

    #[test]
    fn all_rows_corrupt_is_a_decrypt_error() {
        let (vault, token) = setup();
        vault.save(&token, "only.com", &sample_payload(), None).unwrap();

        {
            let store = vault.store.lock().unwrap();
            store
                .conn()
                .execute("UPDATE vault_entries SET data_blob = x'DEADBEEF'", [])
                .unwrap();
        }

        assert!(matches!(vault.get_all(&token), Err(VaultError::Decrypt)));
    }

    #[test]
    fn entries_are_scoped_to_the_active_profile() {
        let (vault, token) = setup();
        let work_id = {
            let store = vault.store.lock().unwrap();
            store.create_profile("Work").unwrap()
        };

        vault
            .save(&token, "personal.com", &sample_payload(), None)
            .unwrap();
        vault
            .save(&token, "work.com", &sample_payload(), Some(work_id))
            .unwrap();

        let personal = vault.get_all(&token).unwrap();
        assert_eq!(personal.len(), 1);
        assert_eq!(personal[0].label, "personal.com");

        vault.sessions.set_profile_id(&token, work_id).unwrap();
        let work = vault.get_all(&token).unwrap();
        assert_eq!(work.len(), 1);
        assert_eq!(work[0].label, "work.com");
    }
}
