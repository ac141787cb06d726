//! Core tunables: session, rate-limit, and sync timing parameters.

use std::time::Duration;

/// Configuration for the core services.
///
/// Both peers of a sync MUST agree on the wire-visible constants
/// (chunk sizing lives in [`crate::ble::protocol`]); everything here
/// is local policy and may differ between devices.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Sessions idle longer than this are invalidated.
    pub idle_timeout: Duration,
    /// How often the background sweeper scans for idle sessions.
    pub sweep_interval: Duration,
    /// Consecutive failed unlocks before the cooldown kicks in.
    pub max_unlock_attempts: u32,
    /// First cooldown after the attempt limit is reached.
    pub base_cooldown: Duration,
    /// Upper bound for the exponential cooldown.
    pub max_cooldown: Duration,
    /// Sync timing knobs.
    pub sync: SyncTimeouts,
}

/// Per-phase deadlines of a sync session. Expiry aborts the sync.
#[derive(Debug, Clone, Copy)]
pub struct SyncTimeouts {
    /// Peer discovery (scanning / waiting for a central).
    pub scan: Duration,
    /// Pairing-code entry on the central.
    pub pairing: Duration,
    /// Waiting for an ACK of the current chunk window.
    pub chunk_ack: Duration,
    /// Whole session, from start to COMPLETE.
    pub overall: Duration,
}

impl Default for SyncTimeouts {
    fn default() -> Self {
        Self {
            scan: Duration::from_secs(30),
            pairing: Duration::from_secs(60),
            chunk_ack: Duration::from_secs(5),
            overall: Duration::from_secs(120),
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(5),
            max_unlock_attempts: 5,
            base_cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(15 * 60),
            sync: SyncTimeouts::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_policy() {
        let config = CoreConfig::default();
        assert_eq!(config.idle_timeout, Duration::from_secs(600));
        assert_eq!(config.max_unlock_attempts, 5);
        assert_eq!(config.base_cooldown, Duration::from_secs(30));
        assert_eq!(config.max_cooldown, Duration::from_secs(900));
        assert_eq!(config.sync.scan, Duration::from_secs(30));
        assert_eq!(config.sync.pairing, Duration::from_secs(60));
        assert_eq!(config.sync.chunk_ack, Duration::from_secs(5));
        assert_eq!(config.sync.overall, Duration::from_secs(120));
    }
}
