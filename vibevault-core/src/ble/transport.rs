//! The seam between the sync state machine and a radio.
//!
//! The machine is a pure function of `(state, event)`; everything with
//! a side effect is described by an action and executed by the driver.
//! Radio-facing actions go through [`BleLink`], which a real GATT
//! stack implements. [`loopback_pair`] wires two links together in
//! process so both ends of the protocol can be exercised in tests.

use crate::ble::protocol::SyncMode;
use crate::crypto::VaultKey;
use crate::{Result, SyncErrorKind, VaultError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Which side of the GATT connection this device plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BleRole {
    /// Advertiser; the desktop.
    Peripheral,
    /// Scanner; the mobile peer.
    Central,
}

/// A peer seen during scanning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub address: String,
    pub name: Option<String>,
}

/// Timer phases the machine can arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutPhase {
    Scan,
    Pairing,
    ChunkAck,
    Overall,
}

/// Everything the sync state machine reacts to: radio traffic, user
/// input, timers, and completions reported by the driver.
#[derive(Debug)]
pub enum BleEvent {
    /// A peer appeared in the scan results (central).
    Discovered(PeerInfo),
    /// The GATT connection is up.
    Connected,
    /// The link dropped.
    Disconnected,
    /// A characteristic value arrived: a write we received, a read
    /// response, or a notification.
    Characteristic { uuid: Uuid, data: Vec<u8> },
    /// User picked a peer from the scan results (central).
    PeerSelected(PeerInfo),
    /// User typed the pairing code (central).
    CodeSubmitted(String),
    /// User cancelled the sync.
    Cancel,
    /// An armed timer fired.
    Timeout(TimeoutPhase),
    /// Driver: outgoing bundle is encrypted and ready (sender).
    BundleReady(Vec<u8>),
    /// Driver: a received bundle was merged (receiver).
    IngestDone { received: u32 },
    /// Driver: bundle preparation or ingestion failed.
    TransferFailed(SyncErrorKind),
}

/// Radio operations, executed by a [`BleLink`].
#[derive(Debug, Clone)]
pub enum RadioCommand {
    /// Peripheral: advertise the service, exposing the mode byte and
    /// our pairing public key for the central to read.
    Advertise { mode: SyncMode, pairing_value: Vec<u8> },
    /// Central: scan for the service UUID.
    Scan,
    /// Central: connect and discover the four characteristics.
    Connect(PeerInfo),
    /// Central: read a characteristic value.
    Read(Uuid),
    /// Ship bytes to the peer on a characteristic. Centrals write,
    /// peripherals notify; the link picks the GATT verb.
    Send { uuid: Uuid, data: Vec<u8> },
    /// Tear the connection down.
    Disconnect,
}

/// Side effects requested by the machine.
#[derive(Debug)]
pub enum BleAction {
    Radio(RadioCommand),
    ArmTimeout(TimeoutPhase),
    ClearTimeout(TimeoutPhase),
    /// Pairing finished; the driver owns the session key from here.
    SessionEstablished {
        key: VaultKey,
        peer_public: Vec<u8>,
    },
    /// Sender: collect, re-encrypt, and frame the outgoing bundle.
    PrepareBundle,
    /// Receiver: decrypt and merge a fully reassembled bundle.
    IngestBundle(Vec<u8>),
}

/// A radio endpoint. Implemented by the bluer peripheral adapter and
/// by the in-process loopback below.
pub trait BleLink: Send + 'static {
    fn execute(&mut self, command: RadioCommand) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-process loopback link
// ---------------------------------------------------------------------------

struct LoopbackBus {
    advertising: Option<(SyncMode, Vec<u8>)>,
    scanning: bool,
    connected: bool,
    peripheral_tx: mpsc::UnboundedSender<BleEvent>,
    central_tx: mpsc::UnboundedSender<BleEvent>,
    /// Test hook: corrupts the nth Send on a characteristic.
    corrupt: HashMap<Uuid, u32>,
    send_counts: HashMap<Uuid, u32>,
}

/// One endpoint of a loopback pair.
pub struct LoopbackLink {
    role: BleRole,
    bus: Arc<Mutex<LoopbackBus>>,
}

/// Build a connected pair of loopback links plus their event streams:
/// `(peripheral, central)`.
pub fn loopback_pair() -> (
    (LoopbackLink, mpsc::UnboundedReceiver<BleEvent>),
    (LoopbackLink, mpsc::UnboundedReceiver<BleEvent>),
) {
    let (peripheral_tx, peripheral_rx) = mpsc::unbounded_channel();
    let (central_tx, central_rx) = mpsc::unbounded_channel();

    let bus = Arc::new(Mutex::new(LoopbackBus {
        advertising: None,
        scanning: false,
        connected: false,
        peripheral_tx,
        central_tx,
        corrupt: HashMap::new(),
        send_counts: HashMap::new(),
    }));

    (
        (
            LoopbackLink {
                role: BleRole::Peripheral,
                bus: Arc::clone(&bus),
            },
            peripheral_rx,
        ),
        (
            LoopbackLink {
                role: BleRole::Central,
                bus,
            },
            central_rx,
        ),
    )
}

impl LoopbackLink {
    /// Flip one byte of the `nth` frame (0-based) later sent on the
    /// given characteristic, in either direction.
    pub fn corrupt_nth_send(&self, uuid: Uuid, nth: u32) {
        let mut bus = self.bus.lock().expect("loopback bus poisoned");
        bus.corrupt.insert(uuid, nth);
    }
}

impl BleLink for LoopbackLink {
    fn execute(&mut self, command: RadioCommand) -> Result<()> {
        let mut bus = self.bus.lock().expect("loopback bus poisoned");
        match command {
            RadioCommand::Advertise {
                mode,
                pairing_value,
            } => {
                bus.advertising = Some((mode, pairing_value));
                if bus.scanning {
                    let _ = bus.central_tx.send(BleEvent::Discovered(loopback_peer()));
                }
            }
            RadioCommand::Scan => {
                bus.scanning = true;
                if bus.advertising.is_some() {
                    let _ = bus.central_tx.send(BleEvent::Discovered(loopback_peer()));
                }
            }
            RadioCommand::Connect(_) => {
                if bus.advertising.is_none() {
                    return Err(VaultError::Sync(SyncErrorKind::Timeout));
                }
                bus.connected = true;
                let _ = bus.peripheral_tx.send(BleEvent::Connected);
                let _ = bus.central_tx.send(BleEvent::Connected);
            }
            RadioCommand::Read(uuid) => {
                let Some((mode, pairing_value)) = bus.advertising.clone() else {
                    return Err(VaultError::Sync(SyncErrorKind::Timeout));
                };
                let data = if uuid == crate::ble::uuids::MODE {
                    vec![mode as u8]
                } else if uuid == crate::ble::uuids::PAIRING {
                    pairing_value
                } else {
                    Vec::new()
                };
                let _ = bus.central_tx.send(BleEvent::Characteristic { uuid, data });
            }
            RadioCommand::Send { uuid, mut data } => {
                let count = bus.send_counts.entry(uuid).or_insert(0);
                let this_frame = *count;
                *count += 1;
                if bus.corrupt.get(&uuid) == Some(&this_frame) {
                    if let Some(last) = data.last_mut() {
                        *last ^= 0xFF;
                    }
                }

                let target = match self.role {
                    BleRole::Peripheral => &bus.central_tx,
                    BleRole::Central => &bus.peripheral_tx,
                };
                let _ = target.send(BleEvent::Characteristic { uuid, data });
            }
            RadioCommand::Disconnect => {
                if bus.connected {
                    bus.connected = false;
                    let other = match self.role {
                        BleRole::Peripheral => &bus.central_tx,
                        BleRole::Central => &bus.peripheral_tx,
                    };
                    let _ = other.send(BleEvent::Disconnected);
                }
            }
        }
        Ok(())
    }
}

fn loopback_peer() -> PeerInfo {
    PeerInfo {
        address: "00:00:00:00:00:01".to_string(),
        name: Some("VibeVault".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids;

    #[tokio::test]
    async fn discovery_requires_both_sides() {
        let ((mut peripheral, _p_rx), (mut central, mut c_rx)) = loopback_pair();

        central.execute(RadioCommand::Scan).unwrap();
        assert!(c_rx.try_recv().is_err(), "nothing advertised yet");

        peripheral
            .execute(RadioCommand::Advertise {
                mode: SyncMode::Push,
                pairing_value: vec![0x02; 33],
            })
            .unwrap();

        match c_rx.try_recv().unwrap() {
            BleEvent::Discovered(peer) => assert_eq!(peer.name.as_deref(), Some("VibeVault")),
            other => panic!("expected Discovered, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn connect_raises_connected_on_both_ends() {
        let ((mut peripheral, mut p_rx), (mut central, mut c_rx)) = loopback_pair();
        peripheral
            .execute(RadioCommand::Advertise {
                mode: SyncMode::Push,
                pairing_value: vec![],
            })
            .unwrap();
        central.execute(RadioCommand::Scan).unwrap();
        let _ = c_rx.try_recv();

        central.execute(RadioCommand::Connect(loopback_peer())).unwrap();
        assert!(matches!(p_rx.try_recv().unwrap(), BleEvent::Connected));
        assert!(matches!(c_rx.try_recv().unwrap(), BleEvent::Connected));
    }

    #[tokio::test]
    async fn reads_serve_mode_and_pairing_values() {
        let ((mut peripheral, _p_rx), (mut central, mut c_rx)) = loopback_pair();
        peripheral
            .execute(RadioCommand::Advertise {
                mode: SyncMode::Pull,
                pairing_value: vec![0xAB; 33],
            })
            .unwrap();

        central.execute(RadioCommand::Read(uuids::MODE)).unwrap();
        match c_rx.try_recv().unwrap() {
            BleEvent::Characteristic { uuid, data } => {
                assert_eq!(uuid, uuids::MODE);
                assert_eq!(data, vec![SyncMode::Pull as u8]);
            }
            other => panic!("unexpected {:?}", other),
        }

        central.execute(RadioCommand::Read(uuids::PAIRING)).unwrap();
        match c_rx.try_recv().unwrap() {
            BleEvent::Characteristic { uuid, data } => {
                assert_eq!(uuid, uuids::PAIRING);
                assert_eq!(data, vec![0xAB; 33]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn sends_cross_to_the_other_side() {
        let ((mut peripheral, mut p_rx), (mut central, mut c_rx)) = loopback_pair();

        central
            .execute(RadioCommand::Send {
                uuid: uuids::SYNC_CONTROL,
                data: vec![0x01],
            })
            .unwrap();
        assert!(matches!(
            p_rx.try_recv().unwrap(),
            BleEvent::Characteristic { data, .. } if data == vec![0x01]
        ));

        peripheral
            .execute(RadioCommand::Send {
                uuid: uuids::DATA_TRANSFER,
                data: vec![1, 2, 3],
            })
            .unwrap();
        assert!(matches!(
            c_rx.try_recv().unwrap(),
            BleEvent::Characteristic { data, .. } if data == vec![1, 2, 3]
        ));
    }

    #[tokio::test]
    async fn corruption_hook_flips_the_requested_frame() {
        let ((mut peripheral, _p_rx), (_central, mut c_rx)) = loopback_pair();
        peripheral.corrupt_nth_send(uuids::DATA_TRANSFER, 1);

        for payload in [vec![0u8; 4], vec![0u8; 4], vec![0u8; 4]] {
            peripheral
                .execute(RadioCommand::Send {
                    uuid: uuids::DATA_TRANSFER,
                    data: payload,
                })
                .unwrap();
        }

        let frames: Vec<Vec<u8>> = (0..3)
            .map(|_| match c_rx.try_recv().unwrap() {
                BleEvent::Characteristic { data, .. } => data,
                other => panic!("unexpected {:?}", other),
            })
            .collect();

        assert_eq!(frames[0], vec![0, 0, 0, 0]);
        assert_eq!(frames[1], vec![0, 0, 0, 0xFF]);
        assert_eq!(frames[2], vec![0, 0, 0, 0]);
    }
}
