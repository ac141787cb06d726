//! The core API consumed by the UI shell.
//!
//! One `VibeVault` per process wires the store, session table, auth,
//! vault, TOTP, and sync services together. Every operation except
//! registration status, registration, and unlock requires a valid
//! session token.

use crate::auth::AuthService;
use crate::ble::transport::{BleEvent, BleLink, PeerInfo};
use crate::config::CoreConfig;
use crate::session::{SessionManager, SessionToken};
use crate::store::{
    models::{PairedDevice, Profile, SyncLogRow},
    Store,
};
use crate::sync::{SyncEngine, SyncSnapshot};
use crate::totp::{self, TotpCode};
use crate::vault::{EntryPayload, VaultEntry, VaultService};
use crate::{Result, VaultError};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub struct VibeVault {
    store: Arc<Mutex<Store>>,
    sessions: Arc<SessionManager>,
    auth: AuthService,
    vault: VaultService,
    sync: SyncEngine,
}

impl VibeVault {
    /// Open (creating and migrating as needed) the vault database.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_config(Store::open(path)?, CoreConfig::default())
    }

    /// Fresh in-memory instance for testing.
    pub fn in_memory() -> Result<Self> {
        Self::with_config(Store::in_memory()?, CoreConfig::default())
    }

    pub fn with_config(store: Store, config: CoreConfig) -> Result<Self> {
        let store = Arc::new(Mutex::new(store));
        let sessions = Arc::new(SessionManager::new(config.idle_timeout));

        let auth = AuthService::new(Arc::clone(&store), Arc::clone(&sessions), &config);
        let vault = VaultService::new(Arc::clone(&store), Arc::clone(&sessions));
        let sync = SyncEngine::new(Arc::clone(&store), Arc::clone(&sessions), config.sync);

        Ok(Self {
            store,
            sessions,
            auth,
            vault,
            sync,
        })
    }

    /// Start the background inactivity sweeper. Call once after the
    /// runtime is up.
    pub fn start_sweeper(&self, config: &CoreConfig) -> JoinHandle<()> {
        self.sessions.spawn_sweeper(config.sweep_interval)
    }

    // --- auth --------------------------------------------------------------

    pub fn check_registration(&self) -> Result<bool> {
        self.auth.check_registration()
    }

    pub async fn register_user(&self, username: &str, password: &str) -> Result<()> {
        self.auth.register(username, password).await
    }

    pub async fn unlock_vault(&self, username: &str, password: &str) -> Result<SessionToken> {
        self.auth.unlock(username, password).await
    }

    pub fn lock_vault(&self, token: &SessionToken) {
        self.auth.lock(token)
    }

    pub fn touch_activity(&self, token: &SessionToken) -> Result<()> {
        self.auth.touch_activity(token)
    }

    // --- vault entries -----------------------------------------------------

    pub fn save_entry(
        &self,
        token: &SessionToken,
        label: &str,
        payload: &EntryPayload,
        profile_id: Option<i64>,
    ) -> Result<Uuid> {
        self.vault.save(token, label, payload, profile_id)
    }

    pub fn update_entry(
        &self,
        token: &SessionToken,
        id: i64,
        label: &str,
        payload: &EntryPayload,
    ) -> Result<()> {
        self.vault.update(token, id, label, payload)
    }

    pub fn delete_entry(&self, token: &SessionToken, id: i64) -> Result<()> {
        self.vault.soft_delete(token, id)
    }

    pub fn get_all_entries(&self, token: &SessionToken) -> Result<Vec<VaultEntry>> {
        self.vault.get_all(token)
    }

    pub fn get_entry(&self, token: &SessionToken, id: i64) -> Result<VaultEntry> {
        self.vault.get(token, id)
    }

    // --- totp --------------------------------------------------------------

    /// Generate a TOTP code for a secret at the current time.
    pub fn get_totp_token(&self, token: &SessionToken, secret: &str) -> Result<TotpCode> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| VaultError::Validation {
                field: "clock".to_string(),
                reason: e.to_string(),
            })?
            .as_secs() as i64;
        self.get_totp_token_at(token, secret, now)
    }

    /// Timestamp-injected variant, used by tests and clock mocking.
    pub fn get_totp_token_at(
        &self,
        token: &SessionToken,
        secret: &str,
        timestamp: i64,
    ) -> Result<TotpCode> {
        self.sessions.touch(token)?;
        totp::generate(secret, timestamp)
    }

    // --- profiles ----------------------------------------------------------

    pub fn create_profile(&self, token: &SessionToken, name: &str) -> Result<i64> {
        self.sessions.touch(token)?;
        self.store()?.create_profile(name)
    }

    pub fn get_all_profiles(&self, token: &SessionToken) -> Result<Vec<Profile>> {
        self.sessions.touch(token)?;
        self.store()?.list_profiles()
    }

    pub fn rename_profile(&self, token: &SessionToken, id: i64, name: &str) -> Result<()> {
        self.sessions.touch(token)?;
        self.store()?.rename_profile(id, name)
    }

    pub fn delete_profile(&self, token: &SessionToken, id: i64) -> Result<()> {
        self.sessions.touch(token)?;
        self.store()?.delete_profile(id)?;

        // A session pointing at the deleted profile falls back to the
        // default one.
        if self.sessions.profile_id(token)? == id {
            let fallback = self.store()?.default_profile_id()?;
            self.sessions.set_profile_id(token, fallback)?;
        }
        Ok(())
    }

    pub fn get_active_profile(&self, token: &SessionToken) -> Result<i64> {
        self.sessions.profile_id(token)
    }

    pub fn set_active_profile(&self, token: &SessionToken, id: i64) -> Result<()> {
        if self.store()?.get_profile(id)?.is_none() {
            return Err(VaultError::NotFound);
        }
        self.sessions.set_profile_id(token, id)
    }

    // --- sync --------------------------------------------------------------

    /// Advertise and send this device's entries to the peer.
    pub fn sync_start_push<L: BleLink>(
        &self,
        token: &SessionToken,
        link: L,
        events: tokio::sync::mpsc::UnboundedReceiver<BleEvent>,
    ) -> Result<()> {
        self.sync.start_push(token, link, events)
    }

    /// Advertise and receive the peer's entries.
    pub fn sync_start_pull<L: BleLink>(
        &self,
        token: &SessionToken,
        link: L,
        events: tokio::sync::mpsc::UnboundedReceiver<BleEvent>,
    ) -> Result<()> {
        self.sync.start_pull(token, link, events)
    }

    /// Central role: scan for a peripheral and adopt its direction.
    pub fn sync_start_central<L: BleLink>(
        &self,
        token: &SessionToken,
        link: L,
        events: tokio::sync::mpsc::UnboundedReceiver<BleEvent>,
    ) -> Result<()> {
        self.sync.start_central(token, link, events)
    }

    pub fn sync_cancel(&self, token: &SessionToken) -> Result<()> {
        self.sessions.touch(token)?;
        self.sync.cancel()
    }

    pub fn sync_state(&self, token: &SessionToken) -> Result<SyncSnapshot> {
        self.sessions.touch(token)?;
        Ok(self.sync.state())
    }

    pub fn submit_pairing_code(&self, token: &SessionToken, code: &str) -> Result<()> {
        self.sessions.touch(token)?;
        self.sync.submit_pairing_code(code)
    }

    pub fn select_sync_peer(&self, token: &SessionToken, peer: PeerInfo) -> Result<()> {
        self.sessions.touch(token)?;
        self.sync.select_peer(peer)
    }

    // --- devices & history -------------------------------------------------

    pub fn get_paired_devices(&self, token: &SessionToken) -> Result<Vec<PairedDevice>> {
        self.sessions.touch(token)?;
        self.store()?.list_devices()
    }

    pub fn forget_device(&self, token: &SessionToken, device_id: &str) -> Result<()> {
        self.sessions.touch(token)?;
        self.store()?.forget_device(device_id)
    }

    pub fn get_sync_history(&self, token: &SessionToken) -> Result<Vec<SyncLogRow>> {
        self.sessions.touch(token)?;
        self.store()?.recent_sync_history(50)
    }

    /// Hard-delete tombstones older than the given age. Explicit
    /// maintenance; never run implicitly.
    pub fn prune_tombstones(&self, token: &SessionToken, older_than_days: u32) -> Result<usize> {
        self.sessions.touch(token)?;
        self.store()?.prune_tombstones(older_than_days)
    }

    fn store(&self) -> Result<std::sync::MutexGuard<'_, Store>> {
        self.store
            .lock()
            .map_err(|_| VaultError::Store("store mutex poisoned".to_string()))
    }
}
