//! Sync history queries.

use crate::store::{
    models::{SyncDirection, SyncLogRow, SyncOutcome},
    Store,
};
use crate::Result;
use rusqlite::params;

impl Store {
    /// Append one row to the sync history.
    #[allow(clippy::too_many_arguments)]
    pub fn append_sync_log(
        &self,
        device_id: &str,
        direction: SyncDirection,
        entries_sent: i64,
        entries_received: i64,
        status: SyncOutcome,
        started_at: &str,
        completed_at: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO sync_log
                 (device_id, direction, entries_sent, entries_received,
                  status, started_at, completed_at, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                device_id,
                direction.as_str(),
                entries_sent,
                entries_received,
                status.as_str(),
                started_at,
                completed_at,
                error_message,
            ],
        )?;
        Ok(())
    }

    /// Most recent sync history rows, newest first.
    pub fn recent_sync_history(&self, limit: u32) -> Result<Vec<SyncLogRow>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, device_id, direction, entries_sent, entries_received,
                    status, started_at, completed_at, error_message
             FROM sync_log ORDER BY started_at DESC, id DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit], |row| {
            let direction: String = row.get(2)?;
            let status: String = row.get(5)?;
            Ok(SyncLogRow {
                id: row.get(0)?,
                device_id: row.get(1)?,
                direction: SyncDirection::parse(&direction),
                entries_sent: row.get(3)?,
                entries_received: row.get(4)?,
                status: SyncOutcome::parse(&status),
                started_at: row.get(6)?,
                completed_at: row.get(7)?,
                error_message: row.get(8)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_back() {
        let store = Store::in_memory().unwrap();
        store
            .append_sync_log(
                "phone-1",
                SyncDirection::Push,
                12,
                0,
                SyncOutcome::Success,
                "2026-01-01T10:00:00.000000Z",
                Some("2026-01-01T10:00:05.000000Z"),
                None,
            )
            .unwrap();
        store
            .append_sync_log(
                "phone-1",
                SyncDirection::Pull,
                0,
                3,
                SyncOutcome::Failed,
                "2026-01-02T10:00:00.000000Z",
                None,
                Some("a transfer frame was corrupted"),
            )
            .unwrap();

        let history = store.recent_sync_history(50).unwrap();
        assert_eq!(history.len(), 2);
        // Newest first
        assert_eq!(history[0].status, SyncOutcome::Failed);
        assert_eq!(history[0].direction, SyncDirection::Pull);
        assert!(history[0].completed_at.is_none());
        assert_eq!(history[1].entries_sent, 12);
    }

    #[test]
    fn limit_is_honored() {
        let store = Store::in_memory().unwrap();
        for i in 0..5 {
            store
                .append_sync_log(
                    "phone-1",
                    SyncDirection::Push,
                    i,
                    0,
                    SyncOutcome::Success,
                    &format!("2026-01-0{}T00:00:00.000000Z", i + 1),
                    None,
                    None,
                )
                .unwrap();
        }
        assert_eq!(store.recent_sync_history(3).unwrap().len(), 3);
    }
}
