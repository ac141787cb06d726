//! Profile queries with the deletion guards.

use crate::store::{models::Profile, now_utc, Store};
use crate::{Result, VaultError};
use rusqlite::{params, OptionalExtension};

impl Store {
    /// Create a profile. The name must be non-empty and unique.
    pub fn create_profile(&self, name: &str) -> Result<i64> {
        let name = name.trim();
        if name.is_empty() {
            return Err(VaultError::validation("profile name", "must not be empty"));
        }

        let result = self.conn().execute(
            "INSERT INTO profiles (name, created_at) VALUES (?1, ?2)",
            params![name, now_utc()],
        );

        match result {
            Ok(_) => Ok(self.conn().last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(VaultError::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// List profiles with their non-deleted entry counts, oldest first.
    pub fn list_profiles(&self) -> Result<Vec<Profile>> {
        let mut stmt = self.conn().prepare(
            "SELECT p.id, p.name, p.created_at, COUNT(v.id)
             FROM profiles p
             LEFT JOIN vault_entries v ON v.profile_id = p.id AND v.deleted_at IS NULL
             GROUP BY p.id
             ORDER BY p.id",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(Profile {
                id: row.get(0)?,
                name: row.get(1)?,
                created_at: row.get(2)?,
                entry_count: row.get(3)?,
            })
        })?;

        let mut profiles = Vec::new();
        for row in rows {
            profiles.push(row?);
        }
        Ok(profiles)
    }

    /// Fetch a single profile by id.
    pub fn get_profile(&self, id: i64) -> Result<Option<Profile>> {
        let profile = self
            .conn()
            .query_row(
                "SELECT p.id, p.name, p.created_at,
                        (SELECT COUNT(*) FROM vault_entries v
                         WHERE v.profile_id = p.id AND v.deleted_at IS NULL)
                 FROM profiles p WHERE p.id = ?1",
                params![id],
                |row| {
                    Ok(Profile {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created_at: row.get(2)?,
                        entry_count: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(profile)
    }

    /// Rename a profile.
    pub fn rename_profile(&self, id: i64, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(VaultError::validation("profile name", "must not be empty"));
        }

        let changed = match self.conn().execute(
            "UPDATE profiles SET name = ?1 WHERE id = ?2",
            params![name, id],
        ) {
            Ok(n) => n,
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(VaultError::Conflict)
            }
            Err(e) => return Err(e.into()),
        };

        if changed == 0 {
            return Err(VaultError::NotFound);
        }
        Ok(())
    }

    /// Delete a profile. Refused while it holds non-deleted entries or
    /// when it is the last profile.
    pub fn delete_profile(&self, id: i64) -> Result<()> {
        let active_entries: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM vault_entries
             WHERE profile_id = ?1 AND deleted_at IS NULL",
            params![id],
            |row| row.get(0),
        )?;
        if active_entries > 0 {
            return Err(VaultError::Conflict);
        }

        let total: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM profiles", [], |row| row.get(0))?;
        if total <= 1 {
            return Err(VaultError::Conflict);
        }

        let deleted = self
            .conn()
            .execute("DELETE FROM profiles WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(VaultError::NotFound);
        }
        Ok(())
    }

    /// Smallest profile id; the fallback active profile.
    pub fn default_profile_id(&self) -> Result<i64> {
        let id: i64 = self
            .conn()
            .query_row("SELECT MIN(id) FROM profiles", [], |row| row.get(0))?;
        Ok(id)
    }

    /// Ensure a profile row exists for an inbound sync `profile_id`,
    /// creating a placeholder when the peer's profile is unknown here.
    pub(crate) fn ensure_profile_for_sync(
        tx: &rusqlite::Transaction,
        profile_id: i64,
    ) -> rusqlite::Result<()> {
        let exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM profiles WHERE id = ?1",
            params![profile_id],
            |row| row.get(0),
        )?;
        if exists > 0 {
            return Ok(());
        }

        let base = format!("Synced Profile {}", profile_id);
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO profiles (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![profile_id, base, now_utc()],
        )?;
        if inserted == 0 {
            // Name collision with an existing profile under another id
            tx.execute(
                "INSERT INTO profiles (id, name, created_at) VALUES (?1, ?2, ?3)",
                params![profile_id, format!("{} ({})", base, now_utc()), now_utc()],
            )?;
        }
        Ok(())
    }
}
