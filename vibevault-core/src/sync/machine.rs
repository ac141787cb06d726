//! The sync state machine.
//!
//! Transitions are pure: `step(event)` mutates only machine state and
//! returns the actions to execute. All radio, timer, database, and
//! crypto side effects happen in the driver ([`crate::sync::engine`]),
//! which feeds completions back in as events. Keypair and code are
//! generated once at construction, so a machine never reuses key
//! material across attempts.
//!
//! ```text
//! Idle -> Waiting -> Connected -> ModeRead -> Paired -> Transferring
//!      -> Complete | Failed
//! ```

use crate::ble::protocol::{Chunk, ChunkReassembler, SyncControl, SyncMode};
use crate::ble::transport::{BleAction, BleEvent, BleRole, PeerInfo, RadioCommand, TimeoutPhase};
use crate::ble::uuids;
use crate::sync::pairing::{self, EphemeralKeys};
use crate::sync::SyncSnapshot;
use crate::SyncErrorKind;
use tracing::debug;

/// Chunks sent between ACK round-trips.
pub const ACK_WINDOW: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Advertising (peripheral) or scanning (central).
    Waiting,
    /// Central: connection requested, link not up yet.
    Connecting,
    /// Link up; peripheral waits for the pairing write here.
    Connected,
    /// Central: waiting for the Mode read response.
    ModeRead,
    /// Central: waiting for the peripheral's public key.
    PairingRead,
    /// Central: waiting for the user to type the code.
    AwaitingCode,
    /// Session key agreed; sender is assembling its bundle, receiver
    /// is waiting for START.
    Paired,
    Transferring,
    /// Receiver: all chunks in; ingest and COMPLETE still pending.
    Finishing,
    Complete,
    Failed(SyncErrorKind),
}

struct OutgoingTransfer {
    chunks: Vec<Chunk>,
    /// Next chunk index to put on the radio.
    cursor: usize,
}

pub struct SyncMachine {
    role: BleRole,
    mode: Option<SyncMode>,
    phase: Phase,
    keys: Option<EphemeralKeys>,
    /// Peripheral: the displayed code. Central: unset until submitted.
    code: Option<String>,
    /// Central: the peripheral's public key, held until the code comes.
    peer_public: Option<Vec<u8>>,
    candidates: Vec<PeerInfo>,
    outgoing: Option<OutgoingTransfer>,
    incoming: Option<ChunkReassembler>,
    chunks_done: u16,
    chunks_total: u16,
    got_complete: bool,
    ingest_done: bool,
    entries_received: u32,
}

impl SyncMachine {
    /// Desktop side: advertise with a fixed direction and a fresh code.
    pub fn new_peripheral(mode: SyncMode) -> Self {
        Self {
            role: BleRole::Peripheral,
            mode: Some(mode),
            phase: Phase::Waiting,
            keys: Some(EphemeralKeys::generate()),
            code: Some(pairing::generate_pairing_code()),
            peer_public: None,
            candidates: Vec::new(),
            outgoing: None,
            incoming: None,
            chunks_done: 0,
            chunks_total: 0,
            got_complete: false,
            ingest_done: false,
            entries_received: 0,
        }
    }

    /// Mobile side: scan; direction is adopted from the Mode read.
    pub fn new_central() -> Self {
        Self {
            role: BleRole::Central,
            mode: None,
            phase: Phase::Waiting,
            keys: Some(EphemeralKeys::generate()),
            code: None,
            peer_public: None,
            candidates: Vec::new(),
            outgoing: None,
            incoming: None,
            chunks_done: 0,
            chunks_total: 0,
            got_complete: false,
            ingest_done: false,
            entries_received: 0,
        }
    }

    /// Kick off discovery. Call exactly once.
    pub fn start(&mut self) -> Vec<BleAction> {
        match self.role {
            BleRole::Peripheral => {
                let pairing_value = self
                    .keys
                    .as_ref()
                    .expect("keys live until pairing")
                    .public_bytes()
                    .to_vec();
                vec![
                    BleAction::Radio(RadioCommand::Advertise {
                        mode: self.mode.expect("peripheral mode fixed at construction"),
                        pairing_value,
                    }),
                    BleAction::ArmTimeout(TimeoutPhase::Scan),
                    BleAction::ArmTimeout(TimeoutPhase::Overall),
                ]
            }
            BleRole::Central => vec![
                BleAction::Radio(RadioCommand::Scan),
                BleAction::ArmTimeout(TimeoutPhase::Scan),
                BleAction::ArmTimeout(TimeoutPhase::Overall),
            ],
        }
    }

    /// Feed one event through the machine.
    pub fn step(&mut self, event: BleEvent) -> Vec<BleAction> {
        if self.is_terminal() {
            return Vec::new();
        }

        match event {
            BleEvent::Discovered(peer) => self.on_discovered(peer),
            BleEvent::PeerSelected(peer) => self.on_peer_selected(peer),
            BleEvent::Connected => self.on_connected(),
            BleEvent::Disconnected => self.on_disconnected(),
            BleEvent::Characteristic { uuid, data } => self.on_characteristic(uuid, data),
            BleEvent::CodeSubmitted(code) => self.on_code_submitted(code),
            BleEvent::BundleReady(bytes) => self.on_bundle_ready(bytes),
            BleEvent::IngestDone { received } => self.on_ingest_done(received),
            BleEvent::TransferFailed(kind) => self.abort(kind),
            BleEvent::Cancel => self.abort(SyncErrorKind::Cancelled),
            BleEvent::Timeout(phase) => self.on_timeout(phase),
        }
    }

    /// UI-facing view of the current state.
    pub fn snapshot(&self) -> SyncSnapshot {
        match &self.phase {
            Phase::Waiting if self.role == BleRole::Central && !self.candidates.is_empty() => {
                SyncSnapshot::Candidates {
                    peers: self.candidates.clone(),
                }
            }
            Phase::Waiting | Phase::Connecting => match (&self.role, &self.code) {
                (BleRole::Peripheral, Some(code)) => SyncSnapshot::DisplayCode { code: code.clone() },
                _ => SyncSnapshot::Waiting,
            },
            Phase::Connected | Phase::ModeRead | Phase::PairingRead => match (&self.role, &self.code)
            {
                (BleRole::Peripheral, Some(code)) => SyncSnapshot::DisplayCode { code: code.clone() },
                _ => SyncSnapshot::Waiting,
            },
            Phase::AwaitingCode => SyncSnapshot::AwaitingCode,
            Phase::Paired => SyncSnapshot::Paired,
            Phase::Transferring | Phase::Finishing => SyncSnapshot::Transferring {
                chunks_done: self.chunks_done,
                chunks_total: self.chunks_total,
            },
            Phase::Complete => SyncSnapshot::Complete {
                entries_received: self.entries_received,
            },
            Phase::Failed(kind) => SyncSnapshot::Error { kind: *kind },
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, Phase::Complete | Phase::Failed(_))
    }

    pub fn failure(&self) -> Option<SyncErrorKind> {
        match self.phase {
            Phase::Failed(kind) => Some(kind),
            _ => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.phase, Phase::Complete)
    }

    /// Local direction once the mode is known: push when this end
    /// sends the bundle.
    pub fn direction(&self) -> Option<crate::store::models::SyncDirection> {
        self.mode.map(|_| {
            if self.is_sender() {
                crate::store::models::SyncDirection::Push
            } else {
                crate::store::models::SyncDirection::Pull
            }
        })
    }

    /// Whether this end ships the bundle.
    fn is_sender(&self) -> bool {
        matches!(
            (self.role, self.mode),
            (BleRole::Peripheral, Some(SyncMode::Push)) | (BleRole::Central, Some(SyncMode::Pull))
        )
    }

    // --- discovery & connection -------------------------------------------

    fn on_discovered(&mut self, peer: PeerInfo) -> Vec<BleAction> {
        if self.role == BleRole::Central
            && self.phase == Phase::Waiting
            && !self.candidates.contains(&peer)
        {
            self.candidates.push(peer);
        }
        Vec::new()
    }

    fn on_peer_selected(&mut self, peer: PeerInfo) -> Vec<BleAction> {
        if self.role != BleRole::Central || self.phase != Phase::Waiting {
            return Vec::new();
        }
        self.phase = Phase::Connecting;
        vec![BleAction::Radio(RadioCommand::Connect(peer))]
    }

    fn on_connected(&mut self) -> Vec<BleAction> {
        match (self.role, self.phase) {
            (BleRole::Peripheral, Phase::Waiting) => {
                self.phase = Phase::Connected;
                vec![
                    BleAction::ClearTimeout(TimeoutPhase::Scan),
                    BleAction::ArmTimeout(TimeoutPhase::Pairing),
                ]
            }
            (BleRole::Central, Phase::Connecting) => {
                self.phase = Phase::ModeRead;
                vec![
                    BleAction::ClearTimeout(TimeoutPhase::Scan),
                    BleAction::ArmTimeout(TimeoutPhase::Pairing),
                    BleAction::Radio(RadioCommand::Read(uuids::MODE)),
                ]
            }
            _ => Vec::new(),
        }
    }

    fn on_disconnected(&mut self) -> Vec<BleAction> {
        // A drop after the sender's COMPLETE is the normal end of a
        // session on the receiving side.
        if self.phase == Phase::Finishing && self.got_complete {
            return Vec::new();
        }
        self.phase = Phase::Failed(SyncErrorKind::PeerAbort);
        Vec::new()
    }

    // --- pairing -----------------------------------------------------------

    fn on_characteristic(&mut self, uuid: uuid::Uuid, data: Vec<u8>) -> Vec<BleAction> {
        if uuid == uuids::MODE {
            return self.on_mode_value(&data);
        }
        if uuid == uuids::PAIRING {
            return match self.role {
                BleRole::Peripheral => self.on_pairing_write(&data),
                BleRole::Central => self.on_pairing_value(data),
            };
        }
        if uuid == uuids::SYNC_CONTROL {
            return self.on_control(&data);
        }
        if uuid == uuids::DATA_TRANSFER {
            return self.on_data_chunk(&data);
        }
        Vec::new()
    }

    fn on_mode_value(&mut self, data: &[u8]) -> Vec<BleAction> {
        if self.role != BleRole::Central || self.phase != Phase::ModeRead {
            return Vec::new();
        }
        match data.first().copied().and_then(SyncMode::from_byte) {
            Some(mode) => {
                self.mode = Some(mode);
                self.phase = Phase::PairingRead;
                vec![BleAction::Radio(RadioCommand::Read(uuids::PAIRING))]
            }
            None => self.abort(SyncErrorKind::FramingError),
        }
    }

    /// Central: the peripheral's public key arrived.
    fn on_pairing_value(&mut self, data: Vec<u8>) -> Vec<BleAction> {
        if self.phase != Phase::PairingRead {
            return Vec::new();
        }
        if data.len() != pairing::PUBLIC_KEY_LEN {
            return self.abort(SyncErrorKind::CryptoMismatch);
        }
        self.peer_public = Some(data);
        self.phase = Phase::AwaitingCode;
        Vec::new()
    }

    /// Central: user typed the code; answer with our key and its MAC.
    fn on_code_submitted(&mut self, code: String) -> Vec<BleAction> {
        if self.role != BleRole::Central || self.phase != Phase::AwaitingCode {
            return Vec::new();
        }
        let Some(keys) = self.keys.take() else {
            return self.abort(SyncErrorKind::CryptoMismatch);
        };
        let peer_public = self.peer_public.take().expect("set in PairingRead");

        let our_public = keys.public_bytes().to_vec();
        let mac = pairing::pairing_mac(&code, &our_public);
        self.code = Some(code);

        let session_key = match keys.agree(&peer_public) {
            Ok(key) => key,
            Err(_) => return self.abort(SyncErrorKind::CryptoMismatch),
        };

        let mut payload = our_public;
        payload.extend_from_slice(&mac);

        let mut actions = vec![
            BleAction::Radio(RadioCommand::Send {
                uuid: uuids::PAIRING,
                data: payload,
            }),
            BleAction::SessionEstablished {
                key: session_key,
                peer_public,
            },
            BleAction::ClearTimeout(TimeoutPhase::Pairing),
        ];
        self.phase = Phase::Paired;
        if self.is_sender() {
            actions.push(BleAction::PrepareBundle);
        }
        actions
    }

    /// Peripheral: the central wrote `its_public_key || hmac`.
    fn on_pairing_write(&mut self, data: &[u8]) -> Vec<BleAction> {
        if self.phase != Phase::Connected {
            return Vec::new();
        }

        let (peer_public, mac) = match pairing::split_pairing_payload(data) {
            Ok(parts) => parts,
            Err(_) => return self.abort(SyncErrorKind::CryptoMismatch),
        };

        let code = self.code.as_deref().expect("peripheral always has a code");
        if !pairing::verify_pairing_mac(code, peer_public, mac) {
            debug!("pairing MAC mismatch, rejecting peer");
            return self.abort(SyncErrorKind::CryptoMismatch);
        }

        let Some(keys) = self.keys.take() else {
            return self.abort(SyncErrorKind::CryptoMismatch);
        };
        let session_key = match keys.agree(peer_public) {
            Ok(key) => key,
            Err(_) => return self.abort(SyncErrorKind::CryptoMismatch),
        };

        let mut actions = vec![
            BleAction::SessionEstablished {
                key: session_key,
                peer_public: peer_public.to_vec(),
            },
            BleAction::ClearTimeout(TimeoutPhase::Pairing),
        ];
        self.phase = Phase::Paired;
        if self.is_sender() {
            actions.push(BleAction::PrepareBundle);
        }
        actions
    }

    // --- transfer: sender --------------------------------------------------

    fn on_bundle_ready(&mut self, bytes: Vec<u8>) -> Vec<BleAction> {
        if self.phase != Phase::Paired || !self.is_sender() {
            return Vec::new();
        }

        let chunks = crate::ble::protocol::chunk_message(&bytes);
        self.chunks_total = chunks[0].total;
        self.chunks_done = 0;
        self.outgoing = Some(OutgoingTransfer { chunks, cursor: 0 });
        self.phase = Phase::Transferring;

        let mut actions = vec![BleAction::Radio(RadioCommand::Send {
            uuid: uuids::SYNC_CONTROL,
            data: vec![SyncControl::Start as u8],
        })];
        actions.extend(self.send_next_window());
        actions
    }

    fn send_next_window(&mut self) -> Vec<BleAction> {
        let outgoing = self.outgoing.as_mut().expect("sender has outgoing state");
        let end = (outgoing.cursor + ACK_WINDOW).min(outgoing.chunks.len());

        let mut actions: Vec<BleAction> = outgoing.chunks[outgoing.cursor..end]
            .iter()
            .map(|chunk| {
                BleAction::Radio(RadioCommand::Send {
                    uuid: uuids::DATA_TRANSFER,
                    data: chunk.to_bytes(),
                })
            })
            .collect();
        outgoing.cursor = end;
        actions.push(BleAction::ArmTimeout(TimeoutPhase::ChunkAck));
        actions
    }

    fn on_ack(&mut self) -> Vec<BleAction> {
        if !self.is_sender() || self.phase != Phase::Transferring {
            return Vec::new();
        }
        let outgoing = self.outgoing.as_ref().expect("sender has outgoing state");
        self.chunks_done = outgoing.cursor as u16;

        let mut actions = vec![BleAction::ClearTimeout(TimeoutPhase::ChunkAck)];
        if outgoing.cursor < outgoing.chunks.len() {
            actions.extend(self.send_next_window());
        } else {
            self.phase = Phase::Complete;
            actions.push(BleAction::Radio(RadioCommand::Send {
                uuid: uuids::SYNC_CONTROL,
                data: vec![SyncControl::Complete as u8],
            }));
            actions.push(BleAction::ClearTimeout(TimeoutPhase::Overall));
            actions.push(BleAction::Radio(RadioCommand::Disconnect));
        }
        actions
    }

    // --- transfer: receiver ------------------------------------------------

    fn on_control(&mut self, data: &[u8]) -> Vec<BleAction> {
        // Unknown opcodes are ignored by contract
        let Some(op) = data.first().copied().and_then(SyncControl::from_byte) else {
            return Vec::new();
        };

        match op {
            SyncControl::Start => {
                if !self.is_sender() && self.phase == Phase::Paired {
                    self.phase = Phase::Transferring;
                }
                Vec::new()
            }
            SyncControl::Ack => self.on_ack(),
            SyncControl::Complete => {
                if !self.is_sender()
                    && matches!(self.phase, Phase::Transferring | Phase::Finishing)
                {
                    self.got_complete = true;
                    if self.ingest_done {
                        return self.finish_receiver();
                    }
                }
                Vec::new()
            }
            SyncControl::Abort => {
                let kind = if matches!(self.phase, Phase::Transferring | Phase::Finishing) {
                    SyncErrorKind::PeerAbort
                } else {
                    SyncErrorKind::CryptoMismatch
                };
                self.phase = Phase::Failed(kind);
                vec![BleAction::Radio(RadioCommand::Disconnect)]
            }
        }
    }

    fn on_data_chunk(&mut self, data: &[u8]) -> Vec<BleAction> {
        if self.is_sender() || self.phase != Phase::Transferring {
            return Vec::new();
        }

        let chunk = match Chunk::from_bytes(data) {
            Ok(chunk) => chunk,
            Err(_) => return self.abort(SyncErrorKind::FramingError),
        };

        if self.incoming.is_none() {
            match ChunkReassembler::new(chunk.total) {
                Ok(reassembler) => {
                    self.chunks_total = chunk.total;
                    self.incoming = Some(reassembler);
                }
                Err(_) => return self.abort(SyncErrorKind::FramingError),
            }
        }

        let reassembler = self.incoming.as_mut().expect("created above");
        let complete = match reassembler.add_chunk(chunk) {
            Ok(complete) => complete,
            Err(_) => return self.abort(SyncErrorKind::FramingError),
        };
        let (filled, _) = reassembler.progress();
        self.chunks_done = filled;

        let mut actions = Vec::new();
        if complete || filled as usize % ACK_WINDOW == 0 {
            actions.push(BleAction::Radio(RadioCommand::Send {
                uuid: uuids::SYNC_CONTROL,
                data: vec![SyncControl::Ack as u8],
            }));
        }

        if complete {
            let reassembler = self.incoming.take().expect("complete message");
            match reassembler.reassemble() {
                Ok(message) => {
                    self.phase = Phase::Finishing;
                    actions.push(BleAction::IngestBundle(message));
                }
                Err(_) => return self.abort(SyncErrorKind::FramingError),
            }
        }
        actions
    }

    fn on_ingest_done(&mut self, received: u32) -> Vec<BleAction> {
        if self.phase != Phase::Finishing {
            return Vec::new();
        }
        self.ingest_done = true;
        self.entries_received = received;
        if self.got_complete {
            return self.finish_receiver();
        }
        Vec::new()
    }

    fn finish_receiver(&mut self) -> Vec<BleAction> {
        self.phase = Phase::Complete;
        vec![BleAction::ClearTimeout(TimeoutPhase::Overall)]
    }

    // --- timers & failure --------------------------------------------------

    fn on_timeout(&mut self, timeout: TimeoutPhase) -> Vec<BleAction> {
        let relevant = match timeout {
            TimeoutPhase::Scan => matches!(self.phase, Phase::Waiting | Phase::Connecting),
            TimeoutPhase::Pairing => matches!(
                self.phase,
                Phase::Connected | Phase::ModeRead | Phase::PairingRead | Phase::AwaitingCode
            ),
            TimeoutPhase::ChunkAck => self.is_sender() && self.phase == Phase::Transferring,
            TimeoutPhase::Overall => !self.is_terminal(),
        };
        if !relevant {
            return Vec::new();
        }
        self.abort(SyncErrorKind::Timeout)
    }

    fn abort(&mut self, kind: SyncErrorKind) -> Vec<BleAction> {
        debug!(?kind, "aborting sync");
        self.phase = Phase::Failed(kind);
        vec![
            BleAction::Radio(RadioCommand::Send {
                uuid: uuids::SYNC_CONTROL,
                data: vec![SyncControl::Abort as u8],
            }),
            BleAction::Radio(RadioCommand::Disconnect),
        ]
    }
}
