//! Database layer: schema, migrations, and row-level operations.
//!
//! A `Store` owns a single SQLite connection. Callers serialize access
//! through a mutex; every public operation that issues more than one
//! statement runs in one transaction.

pub mod migrations;
pub mod models;
pub mod queries;

pub use models::{
    EntryRow, PairedDevice, Profile, SyncDirection, SyncLogRow, SyncOutcome, User,
};

use crate::{Result, VaultError};
use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;

/// Current timestamp as RFC 3339 UTC with microsecond precision.
///
/// The fixed shape keeps timestamps lexicographically comparable,
/// which the merge tie-break relies on.
pub(crate) fn now_utc() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Owner of the SQLite connection and schema.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (and migrate) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| VaultError::Store(format!("Failed to open database: {}", e)))?;
        Self::prepare(conn)
    }

    /// Open a fresh in-memory database for testing.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| VaultError::Store(format!("Failed to open in-memory DB: {}", e)))?;
        Self::prepare(conn)
    }

    fn prepare(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON")
            .map_err(|e| VaultError::Store(format!("Failed to enable foreign keys: {}", e)))?;
        migrations::run(&conn)?;
        Ok(Self { conn })
    }

    /// Direct access to the underlying connection.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run `f` inside a transaction, retrying once on a database error
    /// before surfacing it.
    pub(crate) fn in_transaction<T>(
        &self,
        f: impl Fn(&rusqlite::Transaction) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut last_err = None;
        for _ in 0..2 {
            let tx = self.conn.unchecked_transaction()?;
            match f(&tx) {
                Ok(value) => {
                    tx.commit()?;
                    return Ok(value);
                }
                Err(e) => {
                    let _ = tx.rollback();
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.expect("retry loop ran").into())
    }
}
