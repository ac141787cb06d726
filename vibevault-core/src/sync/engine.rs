//! Async driver for the sync state machine.
//!
//! Owns the radio link for the lifetime of one sync session, executes
//! the machine's actions (radio commands, timers, bundle crypto), and
//! feeds completions back in as events. Only one session runs at a
//! time; concurrent starts fail with `Busy`. The session key is
//! dropped (and zeroized) when the session ends, whatever the outcome.

use crate::ble::transport::{BleAction, BleEvent, BleLink, PeerInfo, RadioCommand, TimeoutPhase};
use crate::config::SyncTimeouts;
use crate::crypto::{cipher, VaultKey};
use crate::session::{SessionManager, SessionToken};
use crate::store::{models::SyncDirection, models::SyncOutcome, now_utc, Store};
use crate::sync::machine::SyncMachine;
use crate::sync::merge::{self, MergeStats};
use crate::sync::wire::{self, Envelope};
use crate::sync::SyncSnapshot;
use crate::vault::EntryPayload;
use crate::{Result, SyncErrorKind, VaultError};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

struct EngineShared {
    active: AtomicBool,
    snapshot: Mutex<SyncSnapshot>,
    event_tx: Mutex<Option<mpsc::UnboundedSender<BleEvent>>>,
}

/// Entry point for running sync sessions.
pub struct SyncEngine {
    store: Arc<Mutex<Store>>,
    sessions: Arc<SessionManager>,
    timeouts: SyncTimeouts,
    shared: Arc<EngineShared>,
}

impl SyncEngine {
    pub fn new(store: Arc<Mutex<Store>>, sessions: Arc<SessionManager>, timeouts: SyncTimeouts) -> Self {
        Self {
            store,
            sessions,
            timeouts,
            shared: Arc::new(EngineShared {
                active: AtomicBool::new(false),
                snapshot: Mutex::new(SyncSnapshot::Idle),
                event_tx: Mutex::new(None),
            }),
        }
    }

    /// Desktop: advertise and send our bundle to the peer.
    pub fn start_push<L: BleLink>(
        &self,
        token: &SessionToken,
        link: L,
        events: mpsc::UnboundedReceiver<BleEvent>,
    ) -> Result<()> {
        self.start(
            token,
            SyncMachine::new_peripheral(crate::ble::protocol::SyncMode::Push),
            Some(SyncDirection::Push),
            link,
            events,
        )
    }

    /// Desktop: advertise and receive the peer's bundle.
    pub fn start_pull<L: BleLink>(
        &self,
        token: &SessionToken,
        link: L,
        events: mpsc::UnboundedReceiver<BleEvent>,
    ) -> Result<()> {
        self.start(
            token,
            SyncMachine::new_peripheral(crate::ble::protocol::SyncMode::Pull),
            Some(SyncDirection::Pull),
            link,
            events,
        )
    }

    /// Central role: scan, adopt the peripheral's direction.
    pub fn start_central<L: BleLink>(
        &self,
        token: &SessionToken,
        link: L,
        events: mpsc::UnboundedReceiver<BleEvent>,
    ) -> Result<()> {
        self.start(token, SyncMachine::new_central(), None, link, events)
    }

    fn start<L: BleLink>(
        &self,
        token: &SessionToken,
        machine: SyncMachine,
        direction: Option<SyncDirection>,
        link: L,
        events: mpsc::UnboundedReceiver<BleEvent>,
    ) -> Result<()> {
        if self.shared.active.swap(true, Ordering::SeqCst) {
            return Err(VaultError::Sync(SyncErrorKind::Busy));
        }

        let setup = (|| -> Result<(VaultKey, i64)> {
            let key = self.sessions.key_for(token)?;
            let profile_id = self.sessions.profile_id(token)?;
            Ok((key, profile_id))
        })();
        let (vault_key, profile_id) = match setup {
            Ok(pair) => pair,
            Err(e) => {
                self.shared.active.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        // One queue feeds the machine; external radio events are
        // forwarded into it so UI injections share the same ordering.
        let (tx, rx) = mpsc::unbounded_channel();
        let forward = tx.clone();
        let mut external = events;
        tokio::spawn(async move {
            while let Some(event) = external.recv().await {
                if forward.send(event).is_err() {
                    break;
                }
            }
        });

        *self.shared.event_tx.lock().expect("engine mutex poisoned") = Some(tx.clone());
        *self.shared.snapshot.lock().expect("engine mutex poisoned") = machine.snapshot();

        let driver = Driver {
            link,
            machine,
            direction,
            store: Arc::clone(&self.store),
            vault_key,
            profile_id,
            session_key: None,
            peer_public: None,
            peer_name: None,
            peer_address: None,
            event_tx: tx,
            timeouts: self.timeouts,
            timer_gens: Arc::new(Mutex::new(HashMap::new())),
            stats: MergeStats::default(),
            entries_sent: 0,
            envelopes_received: 0,
            started_at: now_utc(),
            shared: Arc::clone(&self.shared),
        };

        tokio::spawn(driver.run(rx));
        Ok(())
    }

    /// Current state snapshot for the UI.
    pub fn state(&self) -> SyncSnapshot {
        self.shared
            .snapshot
            .lock()
            .expect("engine mutex poisoned")
            .clone()
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Central: the user picked a peer from the scan list.
    pub fn select_peer(&self, peer: PeerInfo) -> Result<()> {
        self.inject(BleEvent::PeerSelected(peer))
    }

    /// Central: the user typed the peripheral's code.
    pub fn submit_pairing_code(&self, code: &str) -> Result<()> {
        self.inject(BleEvent::CodeSubmitted(code.trim().to_string()))
    }

    /// Abort the running session.
    pub fn cancel(&self) -> Result<()> {
        self.inject(BleEvent::Cancel)
    }

    fn inject(&self, event: BleEvent) -> Result<()> {
        let guard = self.shared.event_tx.lock().expect("engine mutex poisoned");
        if let Some(tx) = guard.as_ref() {
            if tx.send(event).is_ok() {
                return Ok(());
            }
        }
        Err(VaultError::Sync(SyncErrorKind::Cancelled))
    }
}

struct Driver<L: BleLink> {
    link: L,
    machine: SyncMachine,
    direction: Option<SyncDirection>,
    store: Arc<Mutex<Store>>,
    vault_key: VaultKey,
    profile_id: i64,
    session_key: Option<VaultKey>,
    peer_public: Option<Vec<u8>>,
    peer_name: Option<String>,
    /// BLE address of the selected peer (central role only).
    peer_address: Option<String>,
    event_tx: mpsc::UnboundedSender<BleEvent>,
    timeouts: SyncTimeouts,
    timer_gens: Arc<Mutex<HashMap<TimeoutPhase, u64>>>,
    stats: MergeStats,
    entries_sent: u32,
    envelopes_received: u32,
    started_at: String,
    shared: Arc<EngineShared>,
}

impl<L: BleLink> Driver<L> {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<BleEvent>) {
        let actions = self.machine.start();
        self.apply(actions);
        self.publish();

        while !self.machine.is_terminal() {
            let Some(event) = events.recv().await else {
                break;
            };
            if let BleEvent::PeerSelected(ref peer) = event {
                self.peer_name = peer.name.clone();
                self.peer_address = Some(peer.address.clone());
            }
            let actions = self.machine.step(event);
            self.apply(actions);
            self.publish();
        }

        self.finalize();
    }

    fn apply(&mut self, actions: Vec<BleAction>) {
        for action in actions {
            match action {
                BleAction::Radio(command) => {
                    if let RadioCommand::Connect(ref peer) = command {
                        self.peer_name = peer.name.clone();
                        self.peer_address = Some(peer.address.clone());
                    }
                    if let Err(e) = self.link.execute(command) {
                        warn!(error = %e, "radio command failed");
                        let _ = self
                            .event_tx
                            .send(BleEvent::TransferFailed(SyncErrorKind::Timeout));
                    }
                }
                BleAction::ArmTimeout(phase) => self.arm_timeout(phase),
                BleAction::ClearTimeout(phase) => self.clear_timeout(phase),
                BleAction::SessionEstablished { key, peer_public } => {
                    info!("sync session key established");
                    self.session_key = Some(key);
                    self.peer_public = Some(peer_public);
                }
                BleAction::PrepareBundle => {
                    let event = match self.prepare_bundle() {
                        Ok(bytes) => BleEvent::BundleReady(bytes),
                        Err(e) => {
                            warn!(error = %e, "bundle preparation failed");
                            BleEvent::TransferFailed(SyncErrorKind::CryptoMismatch)
                        }
                    };
                    let _ = self.event_tx.send(event);
                }
                BleAction::IngestBundle(bytes) => {
                    let event = match self.ingest_bundle(&bytes) {
                        Ok(received) => BleEvent::IngestDone { received },
                        Err(VaultError::Sync(kind)) => BleEvent::TransferFailed(kind),
                        Err(e) => {
                            warn!(error = %e, "bundle ingestion failed");
                            BleEvent::TransferFailed(SyncErrorKind::CryptoMismatch)
                        }
                    };
                    let _ = self.event_tx.send(event);
                }
            }
        }
    }

    fn arm_timeout(&self, phase: TimeoutPhase) {
        let duration = self.duration_for(phase);
        let generation = {
            let mut gens = self.timer_gens.lock().expect("timer mutex poisoned");
            let counter = gens.entry(phase).or_insert(0);
            *counter += 1;
            *counter
        };

        let gens = Arc::clone(&self.timer_gens);
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let still_armed = gens
                .lock()
                .map(|g| g.get(&phase) == Some(&generation))
                .unwrap_or(false);
            if still_armed {
                let _ = tx.send(BleEvent::Timeout(phase));
            }
        });
    }

    fn clear_timeout(&self, phase: TimeoutPhase) {
        let mut gens = self.timer_gens.lock().expect("timer mutex poisoned");
        *gens.entry(phase).or_insert(0) += 1;
    }

    fn duration_for(&self, phase: TimeoutPhase) -> Duration {
        match phase {
            TimeoutPhase::Scan => self.timeouts.scan,
            TimeoutPhase::Pairing => self.timeouts.pairing,
            TimeoutPhase::ChunkAck => self.timeouts.chunk_ack,
            TimeoutPhase::Overall => self.timeouts.overall,
        }
    }

    /// Collect the active profile (tombstones included), decrypt each
    /// entry under the vault key, and re-encrypt it under the session
    /// key with a fresh nonce.
    fn prepare_bundle(&mut self) -> Result<Vec<u8>> {
        let session_key = self
            .session_key
            .as_ref()
            .ok_or(VaultError::Sync(SyncErrorKind::CryptoMismatch))?;

        let rows = {
            let store = self.store.lock().map_err(store_poisoned)?;
            store.get_all_entries_since(self.profile_id, 0)?
        };

        let mut envelopes = Vec::with_capacity(rows.len());
        for row in rows {
            let plaintext = if row.is_tombstone() {
                serde_json::to_vec(&EntryPayload::default())?
            } else {
                cipher::decrypt(&self.vault_key, &row.nonce, &row.data_blob)?
            };

            let encrypted = cipher::encrypt(session_key, &plaintext)?;
            let is_tombstone = row.is_tombstone();
            envelopes.push(Envelope {
                entry_uuid: row.entry_uuid,
                profile_id: row.profile_id as u64,
                sync_version: row.sync_version as u64,
                updated_at: row.updated_at,
                label: row.label,
                is_tombstone,
                nonce: encrypted.nonce,
                ciphertext: encrypted.ciphertext,
            });
        }

        self.entries_sent = envelopes.len() as u32;
        info!(entries = self.entries_sent, "outgoing bundle prepared");
        Ok(wire::encode_bundle(&envelopes))
    }

    /// Decode and merge an inbound bundle, envelope by envelope.
    fn ingest_bundle(&mut self, bytes: &[u8]) -> Result<u32> {
        let session_key = self
            .session_key
            .as_ref()
            .ok_or(VaultError::Sync(SyncErrorKind::CryptoMismatch))?;

        let envelopes = wire::decode_bundle(bytes)?;
        self.envelopes_received = envelopes.len() as u32;

        let store = self.store.lock().map_err(store_poisoned)?;
        merge::ingest_bundle(
            &store,
            &self.vault_key,
            session_key,
            &envelopes,
            &mut self.stats,
        )?;

        info!(
            received = self.envelopes_received,
            inserted = self.stats.inserted,
            updated = self.stats.updated,
            deleted = self.stats.deleted,
            skipped = self.stats.skipped,
            "inbound bundle merged"
        );
        Ok(self.envelopes_received)
    }

    fn publish(&self) {
        *self.shared.snapshot.lock().expect("engine mutex poisoned") = self.machine.snapshot();
    }

    fn finalize(mut self) {
        let outcome = if self.machine.is_complete() {
            SyncOutcome::Success
        } else if self.stats.applied() > 0 {
            SyncOutcome::Partial
        } else {
            SyncOutcome::Failed
        };

        // The BLE address identifies the peer when we connected to it
        // (central); a peripheral only knows the key it paired with.
        let device_id = self
            .peer_address
            .clone()
            .or_else(|| self.peer_public.as_deref().map(device_id_from_key))
            .unwrap_or_else(|| "unpaired".to_string());

        let result = (|| -> Result<()> {
            let store = self.store.lock().map_err(store_poisoned)?;

            // A failed session never records a pairing: the central may
            // have derived a key the peripheral went on to reject.
            if outcome != SyncOutcome::Failed {
                if let (Some(public_key), Some(session_key)) =
                    (self.peer_public.as_deref(), self.session_key.as_ref())
                {
                    let name = self
                        .peer_name
                        .clone()
                        .unwrap_or_else(|| "Paired device".to_string());
                    store.upsert_device(&device_id, &name, public_key, session_key.as_bytes())?;
                    if outcome == SyncOutcome::Success {
                        store.touch_last_sync(&device_id)?;
                    }
                }
            }

            let direction = self
                .direction
                .or_else(|| self.machine.direction())
                .unwrap_or(SyncDirection::Pull);
            let completed_at = match outcome {
                SyncOutcome::Failed => None,
                _ => Some(now_utc()),
            };
            store.append_sync_log(
                &device_id,
                direction,
                self.entries_sent as i64,
                self.envelopes_received as i64,
                outcome,
                &self.started_at,
                completed_at.as_deref(),
                self.machine.failure().map(|k| k.to_string()).as_deref(),
            )?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!(error = %e, "failed to record sync outcome");
        }

        // Session key (and our copy of the vault key) zeroize on drop.
        self.session_key = None;

        info!(?outcome, "sync session finished");
        self.publish();
        *self
            .shared
            .event_tx
            .lock()
            .expect("engine mutex poisoned") = None;
        self.shared.active.store(false, Ordering::SeqCst);
    }
}

fn store_poisoned<T>(_: T) -> VaultError {
    VaultError::Store("store mutex poisoned".to_string())
}

/// Stable identifier for a peer derived from its public key.
fn device_id_from_key(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_is_stable_and_short() {
        let id1 = device_id_from_key(&[0x02; 33]);
        let id2 = device_id_from_key(&[0x02; 33]);
        let other = device_id_from_key(&[0x03; 33]);

        assert_eq!(id1, id2);
        assert_ne!(id1, other);
        assert_eq!(id1.len(), 16);
    }
}
