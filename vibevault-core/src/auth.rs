//! Registration and unlock flow.
//!
//! Argon2id work runs on a blocking worker so the caller's executor
//! stays responsive. On unlock the derived vault key goes straight
//! into the session table and never crosses this boundary.

use crate::crypto::{kdf, VaultKey};
use crate::lockout::RateLimiter;
use crate::session::{SessionManager, SessionToken};
use crate::store::{models::User, Store};
use crate::{CoreConfig, Result, VaultError};
use rand::RngCore;
use std::sync::{Arc, Mutex};
use tracing::info;
use zeroize::Zeroize;

pub struct AuthService {
    store: Arc<Mutex<Store>>,
    sessions: Arc<SessionManager>,
    limiter: RateLimiter,
}

impl AuthService {
    pub fn new(store: Arc<Mutex<Store>>, sessions: Arc<SessionManager>, config: &CoreConfig) -> Self {
        Self {
            store,
            sessions,
            limiter: RateLimiter::new(
                config.max_unlock_attempts,
                config.base_cooldown,
                config.max_cooldown,
            ),
        }
    }

    /// Whether a user is registered on this device.
    pub fn check_registration(&self) -> Result<bool> {
        self.store()?.is_registered()
    }

    /// Register the device user: fresh salts, Argon2id PHC hash.
    pub async fn register(&self, username: &str, password: &str) -> Result<()> {
        let username = username.trim().to_string();
        if username.is_empty() {
            return Err(VaultError::validation("username", "must not be empty"));
        }
        if password.is_empty() {
            return Err(VaultError::validation("password", "must not be empty"));
        }

        let mut auth_salt = [0u8; kdf::AUTH_SALT_LEN];
        rand::thread_rng().fill_bytes(&mut auth_salt);
        let mut encryption_salt = [0u8; kdf::ENCRYPTION_SALT_LEN];
        rand::thread_rng().fill_bytes(&mut encryption_salt);

        let password = password.to_string();
        let password_hash =
            tokio::task::spawn_blocking(move || kdf::hash_password(password.as_bytes(), &auth_salt))
                .await
                .map_err(|e| VaultError::Crypto(format!("hash worker failed: {}", e)))??;

        self.store()?.register_user(&User {
            username: username.clone(),
            password_hash,
            auth_salt: auth_salt.to_vec(),
            encryption_salt: encryption_salt.to_vec(),
        })?;

        info!(%username, "user registered");
        Ok(())
    }

    /// Verify the master password and open a session.
    ///
    /// Returns the opaque session token; the derived key is held only
    /// by the session table.
    pub async fn unlock(&self, username: &str, password: &str) -> Result<SessionToken> {
        self.limiter.check(username)?;

        let user = match self.store()?.get_user(username)? {
            Some(user) => user,
            None => {
                self.limiter.record_failure(username);
                return Err(VaultError::InvalidCredentials);
            }
        };

        let password_owned = password.to_string();
        let stored_hash = user.password_hash.clone();
        let verified = tokio::task::spawn_blocking(move || {
            kdf::verify_password(password_owned.as_bytes(), &stored_hash)
        })
        .await
        .map_err(|e| VaultError::Crypto(format!("verify worker failed: {}", e)))??;

        if !verified {
            self.limiter.record_failure(username);
            return Err(VaultError::InvalidCredentials);
        }
        self.limiter.reset(username);

        let encryption_salt: [u8; kdf::ENCRYPTION_SALT_LEN] = user
            .encryption_salt
            .as_slice()
            .try_into()
            .map_err(|_| VaultError::Store("corrupt encryption salt".to_string()))?;

        let password_owned = password.to_string();
        let mut raw_key = tokio::task::spawn_blocking(move || {
            kdf::derive_encryption_key(password_owned.as_bytes(), &encryption_salt)
        })
        .await
        .map_err(|e| VaultError::Crypto(format!("kdf worker failed: {}", e)))??;

        let key = VaultKey::from_bytes(raw_key);
        raw_key.zeroize();

        let profile_id = self.store()?.default_profile_id()?;
        let token = self.sessions.create(key, profile_id);

        info!(%username, "vault unlocked");
        Ok(token)
    }

    /// Destroy the session eagerly.
    pub fn lock(&self, token: &SessionToken) {
        self.sessions.lock(token);
        info!("vault locked");
    }

    /// Keep the session alive.
    pub fn touch_activity(&self, token: &SessionToken) -> Result<()> {
        self.sessions.touch(token)
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
    use std::time::Duration;

    fn service() -> AuthService {
        let store = Arc::new(Mutex::new(Store::in_memory().unwrap()));
        let sessions = Arc::new(SessionManager::new(Duration::from_secs(600)));
        AuthService::new(store, sessions, &CoreConfig::default())
    }

    #[tokio::test]
    async fn register_then_unlock() {
        let auth = service();
        assert!(!auth.check_registration().unwrap());

        auth.register("alice", "correct horse battery staple")
            .await
            .unwrap();
        assert!(auth.check_registration().unwrap());

        let token = auth
            .unlock("alice", "correct horse battery staple")
            .await
            .unwrap();
        auth.touch_activity(&token).unwrap();
    }

    #[tokio::test]
    async fn double_registration_rejected() {
        let auth = service();
        auth.register("alice", "pw-one-pw-one").await.unwrap();

        let err = auth.register("bob", "pw-two-pw-two").await.unwrap_err();
        assert!(matches!(err, VaultError::AlreadyRegistered));
    }

    #[tokio::test]
    async fn wrong_password_is_invalid_credentials() {
        let auth = service();
        auth.register("alice", "right password").await.unwrap();

        let err = auth.unlock("alice", "wrong password").await.unwrap_err();
        assert!(matches!(err, VaultError::InvalidCredentials));
    }

    #[tokio::test]
    async fn unknown_user_is_indistinguishable_from_bad_password() {
        let auth = service();
        auth.register("alice", "right password").await.unwrap();

        let err = auth.unlock("mallory", "whatever").await.unwrap_err();
        assert!(matches!(err, VaultError::InvalidCredentials));
    }

    #[tokio::test]
    async fn rate_limit_kicks_in_after_five_failures() {
        let auth = service();
        auth.register("alice", "right password").await.unwrap();

        for _ in 0..5 {
            let err = auth.unlock("alice", "bad guess").await.unwrap_err();
            assert!(matches!(err, VaultError::InvalidCredentials));
        }

        // Sixth attempt fails fast, even with the right password
        let err = auth.unlock("alice", "right password").await.unwrap_err();
        assert!(matches!(err, VaultError::TooManyAttempts(secs) if secs >= 29));
    }

    #[tokio::test]
    async fn lock_invalidates_token() {
        let auth = service();
        auth.register("alice", "master password").await.unwrap();
        let token = auth.unlock("alice", "master password").await.unwrap();

        auth.lock(&token);
        assert!(matches!(
            auth.touch_activity(&token),
            Err(VaultError::SessionExpired)
        ));
    }
}
