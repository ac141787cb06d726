//! In-memory session table: token -> encryption key.
//!
//! The vault key lives only here. Sessions expire after an inactivity
//! window, enforced both lazily on access and eagerly by a background
//! sweeper. Dropping a session zeroizes its key.

use crate::crypto::VaultKey;
use crate::{Result, VaultError};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tracing::debug;

/// An opaque session token handed to the UI. 256 bits of OS entropy.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SessionToken(String);

impl SessionToken {
    fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

struct Session {
    key: VaultKey,
    last_activity: Instant,
    profile_id: i64,
}

/// Owner of all unlocked sessions.
pub struct SessionManager {
    idle_timeout: Duration,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Install a new session and return its token.
    pub fn create(&self, key: VaultKey, profile_id: i64) -> SessionToken {
        let token = SessionToken::generate();
        let mut sessions = self.sessions.lock().expect("session mutex poisoned");
        sessions.insert(
            token.as_str().to_string(),
            Session {
                key,
                last_activity: Instant::now(),
                profile_id,
            },
        );
        token
    }

    /// Validate a token, refresh its activity stamp, and run `f` on the
    /// live session. Expired sessions are dropped on the spot.
    fn with_session<T>(&self, token: &SessionToken, f: impl FnOnce(&mut Session) -> T) -> Result<T> {
        let mut sessions = self.sessions.lock().expect("session mutex poisoned");

        // Constant-time token lookup: high-entropy tokens make timing
        // probes useless, but the comparison stays branchless anyway.
        let stored_key = sessions
            .keys()
            .find(|k| {
                k.as_bytes().len() == token.as_str().len()
                    && k.as_bytes().ct_eq(token.as_str().as_bytes()).into()
            })
            .cloned();

        let Some(stored_key) = stored_key else {
            return Err(VaultError::SessionExpired);
        };

        let expired = sessions
            .get(&stored_key)
            .map(|s| s.last_activity.elapsed() > self.idle_timeout)
            .unwrap_or(true);
        if expired {
            sessions.remove(&stored_key);
            debug!("session expired on access");
            return Err(VaultError::SessionExpired);
        }

        let session = sessions.get_mut(&stored_key).expect("checked above");
        session.last_activity = Instant::now();
        Ok(f(session))
    }

    /// Clone of the session's vault key. The clone zeroizes on drop.
    pub fn key_for(&self, token: &SessionToken) -> Result<VaultKey> {
        self.with_session(token, |s| s.key.clone())
    }

    /// Refresh the inactivity stamp without doing anything else.
    pub fn touch(&self, token: &SessionToken) -> Result<()> {
        self.with_session(token, |_| ())
    }

    /// The session's active profile.
    pub fn profile_id(&self, token: &SessionToken) -> Result<i64> {
        self.with_session(token, |s| s.profile_id)
    }

    /// Switch the session's active profile.
    pub fn set_profile_id(&self, token: &SessionToken, profile_id: i64) -> Result<()> {
        self.with_session(token, |s| s.profile_id = profile_id)
    }

    /// Destroy one session, zeroizing its key.
    pub fn lock(&self, token: &SessionToken) {
        let mut sessions = self.sessions.lock().expect("session mutex poisoned");
        sessions.remove(token.as_str());
    }

    /// Drop every idle session. Returns how many were invalidated.
    pub fn sweep(&self) -> usize {
        let mut sessions = self.sessions.lock().expect("session mutex poisoned");
        let before = sessions.len();
        sessions.retain(|_, s| s.last_activity.elapsed() <= self.idle_timeout);
        before - sessions.len()
    }

    /// Background task that sweeps idle sessions at a fixed interval.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await; // immediate first tick
            loop {
                timer.tick().await;
                let swept = manager.sweep();
                if swept > 0 {
                    tracing::info!(count = swept, "auto-locked idle sessions");
                }
            }
        })
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        // Sessions drop with the map; each VaultKey zeroizes itself.
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.clear();
        }
    }
}
