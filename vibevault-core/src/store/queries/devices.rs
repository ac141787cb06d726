//! Paired device bookkeeping.

use crate::store::{models::PairedDevice, now_utc, Store};
use crate::{Result, VaultError};
use rusqlite::{params, OptionalExtension};

impl Store {
    /// Record a successful pairing. Re-pairing a known `device_id`
    /// refreshes its name and keys.
    pub fn upsert_device(
        &self,
        device_id: &str,
        device_name: &str,
        public_key: &[u8],
        shared_secret: &[u8],
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO paired_devices
                 (device_id, device_name, public_key, shared_secret, paired_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(device_id) DO UPDATE SET
                 device_name = excluded.device_name,
                 public_key = excluded.public_key,
                 shared_secret = excluded.shared_secret",
            params![device_id, device_name, public_key, shared_secret, now_utc()],
        )?;
        Ok(())
    }

    /// All paired devices, most recently paired first.
    pub fn list_devices(&self) -> Result<Vec<PairedDevice>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, device_id, device_name, public_key, paired_at, last_sync_at
             FROM paired_devices ORDER BY paired_at DESC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(PairedDevice {
                id: row.get(0)?,
                device_id: row.get(1)?,
                device_name: row.get(2)?,
                public_key: row.get(3)?,
                paired_at: row.get(4)?,
                last_sync_at: row.get(5)?,
            })
        })?;

        let mut devices = Vec::new();
        for row in rows {
            devices.push(row?);
        }
        Ok(devices)
    }

    /// Look up a paired device by its identifier.
    pub fn get_device(&self, device_id: &str) -> Result<Option<PairedDevice>> {
        let device = self
            .conn()
            .query_row(
                "SELECT id, device_id, device_name, public_key, paired_at, last_sync_at
                 FROM paired_devices WHERE device_id = ?1",
                params![device_id],
                |row| {
                    Ok(PairedDevice {
                        id: row.get(0)?,
                        device_id: row.get(1)?,
                        device_name: row.get(2)?,
                        public_key: row.get(3)?,
                        paired_at: row.get(4)?,
                        last_sync_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(device)
    }

    /// Remove a paired device.
    pub fn forget_device(&self, device_id: &str) -> Result<()> {
        let deleted = self.conn().execute(
            "DELETE FROM paired_devices WHERE device_id = ?1",
            params![device_id],
        )?;
        if deleted == 0 {
            return Err(VaultError::NotFound);
        }
        Ok(())
    }

    /// Stamp a completed sync on a paired device.
    pub fn touch_last_sync(&self, device_id: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE paired_devices SET last_sync_at = ?1 WHERE device_id = ?2",
            params![now_utc(), device_id],
        )?;
        Ok(())
    }
}
