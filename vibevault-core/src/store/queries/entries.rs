//! Vault entry queries: versioned writes, tombstones, sync reads.

use crate::store::{models::EntryRow, now_utc, Store};
use crate::{Result, VaultError};
use rusqlite::{params, types::Type, OptionalExtension, Row};
use uuid::Uuid;

fn map_entry(row: &Row) -> rusqlite::Result<EntryRow> {
    let uuid_text: String = row.get(1)?;
    let entry_uuid = Uuid::parse_str(&uuid_text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;

    Ok(EntryRow {
        id: row.get(0)?,
        entry_uuid,
        label: row.get(2)?,
        data_blob: row.get(3)?,
        nonce: row.get(4)?,
        profile_id: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        deleted_at: row.get(8)?,
        sync_version: row.get(9)?,
    })
}

const ENTRY_COLUMNS: &str = "id, entry_uuid, label, data_blob, nonce, profile_id,
                             created_at, updated_at, deleted_at, sync_version";

impl Store {
    /// Insert a freshly encrypted entry with `sync_version = 1`.
    pub fn insert_entry(
        &self,
        entry_uuid: &Uuid,
        label: &str,
        data_blob: &[u8],
        nonce: &[u8],
        profile_id: i64,
    ) -> Result<i64> {
        let now = now_utc();
        self.conn().execute(
            "INSERT INTO vault_entries
                 (entry_uuid, label, data_blob, nonce, profile_id,
                  created_at, updated_at, deleted_at, sync_version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, NULL, 1)",
            params![entry_uuid.to_string(), label, data_blob, nonce, profile_id, now],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    /// Re-encrypting update: bumps `sync_version`, refreshes `updated_at`.
    pub fn update_entry(
        &self,
        id: i64,
        label: &str,
        data_blob: &[u8],
        nonce: &[u8],
    ) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE vault_entries
             SET label = ?1, data_blob = ?2, nonce = ?3,
                 updated_at = ?4, sync_version = sync_version + 1
             WHERE id = ?5 AND deleted_at IS NULL",
            params![label, data_blob, nonce, now_utc(), id],
        )?;
        if changed == 0 {
            return Err(VaultError::NotFound);
        }
        Ok(())
    }

    /// Turn an entry into a tombstone: `deleted_at` set, payload zeroed,
    /// `sync_version` bumped. The row is kept for sync propagation.
    pub fn soft_delete_entry(&self, id: i64) -> Result<()> {
        let now = now_utc();
        let changed = self.conn().execute(
            "UPDATE vault_entries
             SET deleted_at = ?1, updated_at = ?1,
                 data_blob = x'', nonce = x'',
                 sync_version = sync_version + 1
             WHERE id = ?2 AND deleted_at IS NULL",
            params![now, id],
        )?;
        if changed == 0 {
            return Err(VaultError::NotFound);
        }
        Ok(())
    }

    /// Fetch one entry by local id, tombstoned or not.
    pub fn get_entry(&self, id: i64) -> Result<Option<EntryRow>> {
        let entry = self
            .conn()
            .query_row(
                &format!("SELECT {} FROM vault_entries WHERE id = ?1", ENTRY_COLUMNS),
                params![id],
                map_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// Fetch one entry by its sync identity.
    pub fn get_entry_by_uuid(&self, entry_uuid: &Uuid) -> Result<Option<EntryRow>> {
        let entry = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {} FROM vault_entries WHERE entry_uuid = ?1",
                    ENTRY_COLUMNS
                ),
                params![entry_uuid.to_string()],
                map_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// Non-deleted entries of a profile, for list rendering.
    pub fn get_active_entries(&self, profile_id: i64) -> Result<Vec<EntryRow>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {} FROM vault_entries
             WHERE profile_id = ?1 AND deleted_at IS NULL
             ORDER BY id",
            ENTRY_COLUMNS
        ))?;

        let rows = stmt.query_map(params![profile_id], map_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// All entries of a profile above a sync version, tombstones
    /// included. `since = 0` yields the full profile.
    pub fn get_all_entries_since(&self, profile_id: i64, since: i64) -> Result<Vec<EntryRow>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {} FROM vault_entries
             WHERE profile_id = ?1 AND sync_version > ?2
             ORDER BY id",
            ENTRY_COLUMNS
        ))?;

        let rows = stmt.query_map(params![profile_id, since], map_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Write an inbound row verbatim, keyed by `entry_uuid`.
    ///
    /// Inserts when the uuid is unknown, otherwise overwrites in place
    /// keeping the local surrogate id. `sync_version` and `updated_at`
    /// are taken from the row as-is; the merge layer has already
    /// decided this row wins.
    pub fn upsert_by_uuid(&self, row: &EntryRow) -> Result<()> {
        self.in_transaction(|tx| {
            Self::ensure_profile_for_sync(tx, row.profile_id)?;

            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM vault_entries WHERE entry_uuid = ?1",
                    params![row.entry_uuid.to_string()],
                    |r| r.get(0),
                )
                .optional()?;

            match existing {
                None => {
                    tx.execute(
                        "INSERT INTO vault_entries
                             (entry_uuid, label, data_blob, nonce, profile_id,
                              created_at, updated_at, deleted_at, sync_version)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                        params![
                            row.entry_uuid.to_string(),
                            row.label,
                            row.data_blob,
                            row.nonce,
                            row.profile_id,
                            row.created_at,
                            row.updated_at,
                            row.deleted_at,
                            row.sync_version,
                        ],
                    )?;
                }
                Some(id) => {
                    tx.execute(
                        "UPDATE vault_entries
                         SET label = ?1, data_blob = ?2, nonce = ?3, profile_id = ?4,
                             updated_at = ?5, deleted_at = ?6, sync_version = ?7
                         WHERE id = ?8",
                        params![
                            row.label,
                            row.data_blob,
                            row.nonce,
                            row.profile_id,
                            row.updated_at,
                            row.deleted_at,
                            row.sync_version,
                            id,
                        ],
                    )?;
                }
            }
            Ok(())
        })
    }

    /// Hard-delete tombstones older than the given number of days.
    /// Explicit maintenance only; sync relies on tombstones staying put.
    pub fn prune_tombstones(&self, older_than_days: u32) -> Result<usize> {
        let deleted = self.conn().execute(
            "DELETE FROM vault_entries WHERE deleted_at IS NOT NULL
             AND deleted_at < datetime('now', ?1)",
            params![format!("-{} days", older_than_days)],
        )?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_sample(store: &Store, label: &str) -> (i64, Uuid) {
        let uuid = Uuid::new_v4();
        let id = store
            .insert_entry(&uuid, label, &[0xAB; 48], &[0x01; 12], 1)
            .unwrap();
        (id, uuid)
    }

    #[test]
    fn insert_starts_at_version_one() {
        let store = Store::in_memory().unwrap();
        let (id, uuid) = insert_sample(&store, "github.com");

        let row = store.get_entry(id).unwrap().unwrap();
        assert_eq!(row.entry_uuid, uuid);
        assert_eq!(row.sync_version, 1);
        assert_eq!(row.created_at, row.updated_at);
        assert!(!row.is_tombstone());
    }

    #[test]
    fn update_bumps_version_and_timestamp() {
        let store = Store::in_memory().unwrap();
        let (id, _) = insert_sample(&store, "github.com");
        let before = store.get_entry(id).unwrap().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(2));
        store
            .update_entry(id, "github.com", &[0xCD; 48], &[0x02; 12])
            .unwrap();

        let after = store.get_entry(id).unwrap().unwrap();
        assert_eq!(after.sync_version, before.sync_version + 1);
        assert!(after.updated_at > before.updated_at);
        assert_eq!(after.entry_uuid, before.entry_uuid, "sync identity is immutable");
    }

    #[test]
    fn soft_delete_keeps_identity_and_bumps_version() {
        let store = Store::in_memory().unwrap();
        let (id, uuid) = insert_sample(&store, "github.com");

        store.soft_delete_entry(id).unwrap();

        let row = store.get_entry(id).unwrap().unwrap();
        assert!(row.is_tombstone());
        assert_eq!(row.entry_uuid, uuid);
        assert_eq!(row.sync_version, 2);
        assert!(row.data_blob.is_empty(), "payload zeroed on delete");

        // Second delete is NotFound: the row is already a tombstone
        assert!(matches!(
            store.soft_delete_entry(id),
            Err(VaultError::NotFound)
        ));
    }

    #[test]
    fn active_entries_exclude_tombstones() {
        let store = Store::in_memory().unwrap();
        let (id1, _) = insert_sample(&store, "a.example.com");
        let (_, _) = insert_sample(&store, "b.example.com");

        store.soft_delete_entry(id1).unwrap();

        let active = store.get_active_entries(1).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].label, "b.example.com");
    }

    #[test]
    fn since_zero_includes_tombstones() {
        let store = Store::in_memory().unwrap();
        let (id1, _) = insert_sample(&store, "a.example.com");
        insert_sample(&store, "b.example.com");
        store.soft_delete_entry(id1).unwrap();

        let all = store.get_all_entries_since(1, 0).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|e| e.is_tombstone()));

        let newer = store.get_all_entries_since(1, 1).unwrap();
        assert_eq!(newer.len(), 1, "only the tombstone is past version 1");
    }

    #[test]
    fn upsert_inserts_then_overwrites() {
        let store = Store::in_memory().unwrap();
        let uuid = Uuid::new_v4();

        let inbound = EntryRow {
            id: 0,
            entry_uuid: uuid,
            label: "remote.example.com".to_string(),
            data_blob: vec![9; 32],
            nonce: vec![7; 12],
            profile_id: 1,
            created_at: "2026-01-01T00:00:00.000000Z".to_string(),
            updated_at: "2026-01-01T00:00:00.000000Z".to_string(),
            deleted_at: None,
            sync_version: 3,
        };
        store.upsert_by_uuid(&inbound).unwrap();

        let row = store.get_entry_by_uuid(&uuid).unwrap().unwrap();
        assert_eq!(row.sync_version, 3, "incoming version written verbatim");

        let mut newer = inbound.clone();
        newer.sync_version = 5;
        newer.label = "renamed.example.com".to_string();
        store.upsert_by_uuid(&newer).unwrap();

        let row2 = store.get_entry_by_uuid(&uuid).unwrap().unwrap();
        assert_eq!(row2.id, row.id, "local surrogate id kept");
        assert_eq!(row2.sync_version, 5);
        assert_eq!(row2.label, "renamed.example.com");
    }

    #[test]
    fn upsert_creates_missing_profile() {
        let store = Store::in_memory().unwrap();
        let inbound = EntryRow {
            id: 0,
            entry_uuid: Uuid::new_v4(),
            label: "x".to_string(),
            data_blob: vec![],
            nonce: vec![],
            profile_id: 42,
            created_at: "2026-01-01T00:00:00.000000Z".to_string(),
            updated_at: "2026-01-01T00:00:00.000000Z".to_string(),
            deleted_at: Some("2026-01-02T00:00:00.000000Z".to_string()),
            sync_version: 2,
        };
        store.upsert_by_uuid(&inbound).unwrap();

        let profile = store.get_profile(42).unwrap().unwrap();
        assert!(profile.name.starts_with("Synced Profile"));
    }
}
