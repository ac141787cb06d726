//! Failed-unlock rate limiting, keyed by username.
//!
//! After `max_attempts` consecutive failures the account enters a
//! cooldown that doubles with each further failure: 30 s, 60 s, 120 s,
//! capped at 15 minutes. A successful unlock clears the counter.

use crate::{Result, VaultError};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct AttemptState {
    failures: u32,
    last_failure: Instant,
}

/// In-memory sliding counter of failed unlock attempts.
pub struct RateLimiter {
    max_attempts: u32,
    base_cooldown: Duration,
    max_cooldown: Duration,
    state: Mutex<HashMap<String, AttemptState>>,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, base_cooldown: Duration, max_cooldown: Duration) -> Self {
        Self {
            max_attempts,
            base_cooldown,
            max_cooldown,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Fail fast with `TooManyAttempts` while the username is cooling
    /// down. Call before doing any expensive verification work.
    pub fn check(&self, username: &str) -> Result<()> {
        let state = self.state.lock().expect("rate limiter mutex poisoned");
        let Some(attempt) = state.get(username) else {
            return Ok(());
        };

        let Some(cooldown) = self.cooldown_for(attempt.failures) else {
            return Ok(());
        };

        let elapsed = attempt.last_failure.elapsed();
        if elapsed < cooldown {
            let remaining = cooldown - elapsed;
            // Round up so the caller never retries a second early
            let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
            return Err(VaultError::TooManyAttempts(secs.max(1)));
        }
        Ok(())
    }

    /// Record one failed unlock.
    pub fn record_failure(&self, username: &str) {
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");
        let attempt = state.entry(username.to_string()).or_insert(AttemptState {
            failures: 0,
            last_failure: Instant::now(),
        });
        attempt.failures += 1;
        attempt.last_failure = Instant::now();
    }

    /// Clear the counter after a successful unlock.
    pub fn reset(&self, username: &str) {
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");
        state.remove(username);
    }

    fn cooldown_for(&self, failures: u32) -> Option<Duration> {
        if failures < self.max_attempts {
            return None;
        }
        let excess = (failures - self.max_attempts).min(10);
        let cooldown = self.base_cooldown * 2u32.pow(excess);
        Some(cooldown.min(self.max_cooldown))
    }
}
