//! Additive, idempotent schema migrations.
//!
//! Every statement either creates a missing object or adds a missing
//! column with a backfill, so running at first open is always safe.
//! Rows predating the sync columns get `entry_uuid` backfilled with a
//! fresh UUID and `sync_version = 1`.

use crate::{Result, VaultError};
use rusqlite::{params, Connection};
use uuid::Uuid;

pub fn run(conn: &Connection) -> Result<()> {
    create_users(conn)?;
    create_profiles(conn)?;
    create_vault_entries(conn)?;
    create_paired_devices(conn)?;
    create_sync_log(conn)?;
    create_indexes(conn)?;
    seed_default_profile(conn)?;
    Ok(())
}

fn create_users(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS users (
            username TEXT PRIMARY KEY,
            password_hash TEXT NOT NULL,
            auth_salt BLOB NOT NULL,
            encryption_salt BLOB NOT NULL
        )",
        [],
    )
    .map_err(|e| VaultError::Store(format!("Failed to create users table: {}", e)))?;
    Ok(())
}

fn create_profiles(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS profiles (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        )",
        [],
    )
    .map_err(|e| VaultError::Store(format!("Failed to create profiles table: {}", e)))?;
    Ok(())
}

fn create_vault_entries(conn: &Connection) -> Result<()> {
    let table_exists: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='vault_entries'",
            [],
            |row| row.get::<_, i64>(0).map(|c| c > 0),
        )
        .unwrap_or(false);

    if !table_exists {
        conn.execute(
            "CREATE TABLE vault_entries (
                id INTEGER PRIMARY KEY,
                entry_uuid TEXT NOT NULL UNIQUE,
                label TEXT NOT NULL,
                data_blob BLOB NOT NULL,
                nonce BLOB NOT NULL,
                profile_id INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT,
                sync_version INTEGER NOT NULL DEFAULT 1,
                FOREIGN KEY (profile_id) REFERENCES profiles(id)
            )",
            [],
        )
        .map_err(|e| VaultError::Store(format!("Failed to create vault_entries: {}", e)))?;
        return Ok(());
    }

    // Older databases predate the sync columns; add them one by one.
    if !column_exists(conn, "vault_entries", "entry_uuid") {
        conn.execute("ALTER TABLE vault_entries ADD COLUMN entry_uuid TEXT", [])
            .map_err(|e| VaultError::Store(format!("Failed to add entry_uuid: {}", e)))?;
    }
    if !column_exists(conn, "vault_entries", "created_at") {
        conn.execute(
            "ALTER TABLE vault_entries ADD COLUMN created_at TEXT NOT NULL DEFAULT ''",
            [],
        )
        .map_err(|e| VaultError::Store(format!("Failed to add created_at: {}", e)))?;
    }
    if !column_exists(conn, "vault_entries", "updated_at") {
        conn.execute(
            "ALTER TABLE vault_entries ADD COLUMN updated_at TEXT NOT NULL DEFAULT ''",
            [],
        )
        .map_err(|e| VaultError::Store(format!("Failed to add updated_at: {}", e)))?;
    }
    if !column_exists(conn, "vault_entries", "deleted_at") {
        conn.execute("ALTER TABLE vault_entries ADD COLUMN deleted_at TEXT", [])
            .map_err(|e| VaultError::Store(format!("Failed to add deleted_at: {}", e)))?;
    }
    if !column_exists(conn, "vault_entries", "sync_version") {
        conn.execute(
            "ALTER TABLE vault_entries ADD COLUMN sync_version INTEGER NOT NULL DEFAULT 1",
            [],
        )
        .map_err(|e| VaultError::Store(format!("Failed to add sync_version: {}", e)))?;
    }

    backfill_entry_uuids(conn)?;
    Ok(())
}

fn create_paired_devices(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS paired_devices (
            id INTEGER PRIMARY KEY,
            device_id TEXT NOT NULL UNIQUE,
            device_name TEXT NOT NULL,
            public_key BLOB NOT NULL,
            shared_secret BLOB NOT NULL,
            paired_at TEXT NOT NULL,
            last_sync_at TEXT
        )",
        [],
    )
    .map_err(|e| VaultError::Store(format!("Failed to create paired_devices: {}", e)))?;
    Ok(())
}

fn create_sync_log(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sync_log (
            id INTEGER PRIMARY KEY,
            device_id TEXT NOT NULL,
            direction TEXT NOT NULL,
            entries_sent INTEGER NOT NULL DEFAULT 0,
            entries_received INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            error_message TEXT
        )",
        [],
    )
    .map_err(|e| VaultError::Store(format!("Failed to create sync_log: {}", e)))?;
    Ok(())
}

fn create_indexes(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_vault_entry_uuid ON vault_entries (entry_uuid)",
        [],
    )
    .map_err(|e| VaultError::Store(format!("Failed to create entry_uuid index: {}", e)))?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_vault_profile_deleted
         ON vault_entries (profile_id, deleted_at)",
        [],
    )
    .map_err(|e| VaultError::Store(format!("Failed to create profile index: {}", e)))?;
    Ok(())
}

fn seed_default_profile(conn: &Connection) -> Result<()> {
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM profiles", [], |row| row.get(0))
        .unwrap_or(0);

    if count == 0 {
        conn.execute(
            "INSERT INTO profiles (name, created_at) VALUES ('Personal', ?1)",
            params![super::now_utc()],
        )
        .map_err(|e| VaultError::Store(format!("Failed to seed default profile: {}", e)))?;
    }
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> bool {
    conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        params![table, column],
        |row| row.get::<_, i64>(0).map(|c| c > 0),
    )
    .unwrap_or(false)
}

fn backfill_entry_uuids(conn: &Connection) -> Result<()> {
    let mut stmt = conn
        .prepare("SELECT id FROM vault_entries WHERE entry_uuid IS NULL")
        .map_err(|e| VaultError::Store(format!("Failed to prepare backfill: {}", e)))?;

    let ids: Vec<i64> = stmt
        .query_map([], |row| row.get(0))
        .map_err(|e| VaultError::Store(format!("Failed to scan for backfill: {}", e)))?
        .filter_map(|r| r.ok())
        .collect();

    for id in ids {
        conn.execute(
            "UPDATE vault_entries SET entry_uuid = ?1 WHERE id = ?2",
            params![Uuid::new_v4().to_string(), id],
        )
        .map_err(|e| VaultError::Store(format!("Failed to backfill entry_uuid: {}", e)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();

        let profile_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM profiles", [], |r| r.get(0))
            .unwrap();
        assert_eq!(profile_count, 1, "default profile seeded exactly once");
    }

    #[test]
    fn legacy_entries_table_gains_sync_columns() {
        let conn = Connection::open_in_memory().unwrap();
        // Pre-sync schema: no uuid, no versioning
        conn.execute_batch(
            "CREATE TABLE vault_entries (
                id INTEGER PRIMARY KEY,
                label TEXT NOT NULL,
                data_blob BLOB NOT NULL,
                nonce BLOB NOT NULL,
                profile_id INTEGER NOT NULL DEFAULT 1
            );
            INSERT INTO vault_entries (label, data_blob, nonce)
            VALUES ('old.example.com', x'00', x'000000000000000000000000');",
        )
        .unwrap();

        run(&conn).unwrap();

        let (uuid, version): (Option<String>, i64) = conn
            .query_row(
                "SELECT entry_uuid, sync_version FROM vault_entries LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();

        let uuid = uuid.expect("entry_uuid backfilled");
        assert!(Uuid::parse_str(&uuid).is_ok());
        assert_eq!(version, 1);
    }

    #[test]
    fn default_profile_is_personal() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();

        let name: String = conn
            .query_row("SELECT name FROM profiles ORDER BY id LIMIT 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(name, "Personal");
    }
}
