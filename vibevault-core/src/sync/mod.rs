//! Peer-to-peer sync: pairing, wire codec, merge, and the state
//! machine that ties them to the BLE transport.

pub mod engine;
pub mod machine;
pub mod merge;
pub mod pairing;
pub mod wire;

pub use crate::store::models::SyncDirection;
pub use engine::SyncEngine;
pub use machine::SyncMachine;

use crate::ble::transport::PeerInfo;
use crate::SyncErrorKind;
use serde::Serialize;

/// What the UI renders: one tagged snapshot per poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncSnapshot {
    Idle,
    /// Peripheral advertising / central scanning.
    Waiting,
    /// Central: peers found so far; the user picks one.
    Candidates { peers: Vec<PeerInfo> },
    /// Peripheral: show this code to the user.
    DisplayCode { code: String },
    /// Central: prompt the user for the peer's code.
    AwaitingCode,
    /// Keys agreed; transfer about to start.
    Paired,
    Transferring { chunks_done: u16, chunks_total: u16 },
    Complete { entries_received: u32 },
    Error { kind: SyncErrorKind },
}
