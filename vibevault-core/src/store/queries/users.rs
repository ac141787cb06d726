//! User registration queries. One user row per device.

use crate::store::{models::User, Store};
use crate::{Result, VaultError};
use rusqlite::{params, OptionalExtension};

impl Store {
    /// Insert the device user. Fails with `AlreadyRegistered` if a user
    /// row already exists.
    pub fn register_user(&self, user: &User) -> Result<()> {
        if self.is_registered()? {
            return Err(VaultError::AlreadyRegistered);
        }
        self.conn().execute(
            "INSERT INTO users (username, password_hash, auth_salt, encryption_salt)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                user.username,
                user.password_hash,
                user.auth_salt,
                user.encryption_salt
            ],
        )?;
        Ok(())
    }

    /// Fetch a user row by username.
    pub fn get_user(&self, username: &str) -> Result<Option<User>> {
        let user = self
            .conn()
            .query_row(
                "SELECT username, password_hash, auth_salt, encryption_salt
                 FROM users WHERE username = ?1",
                params![username],
                |row| {
                    Ok(User {
                        username: row.get(0)?,
                        password_hash: row.get(1)?,
                        auth_salt: row.get(2)?,
                        encryption_salt: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    /// Whether any user is registered on this device.
    pub fn is_registered(&self) -> Result<bool> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count > 0)
    }
}
