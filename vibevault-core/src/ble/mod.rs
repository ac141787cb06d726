//! BLE transport: fixed GATT identifiers, chunk framing, and the
//! adapter seam between the sync state machine and a real radio.
//!
//! The state machine never touches a BLE stack directly; it consumes
//! [`transport::BleEvent`]s and emits [`transport::BleAction`]s, which
//! an adapter (the bluer peripheral, or the in-process loopback used
//! in tests) executes.

pub mod protocol;
pub mod transport;
pub mod uuids;

#[cfg(feature = "ble")]
pub mod peripheral;
