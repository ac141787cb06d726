//! Fixed 128-bit identifiers of the sync GATT service.
//!
//! These are part of the wire contract; desktop and mobile must agree
//! bit-for-bit.

use uuid::Uuid;

/// The advertised sync service.
pub const SERVICE: Uuid = Uuid::from_u128(0xa1b2c3d4_e5f6_7890_abcd_ef0123456789);

/// Mode characteristic (read): one byte, push or pull.
pub const MODE: Uuid = Uuid::from_u128(0xa1b2c3d4_e5f6_7890_abcd_ef012345678a);

/// Pairing characteristic (read + write with response).
pub const PAIRING: Uuid = Uuid::from_u128(0xa1b2c3d4_e5f6_7890_abcd_ef012345678b);

/// Sync control characteristic (write + notify).
pub const SYNC_CONTROL: Uuid = Uuid::from_u128(0xa1b2c3d4_e5f6_7890_abcd_ef012345678c);

/// Data transfer characteristic (write + notify).
pub const DATA_TRANSFER: Uuid = Uuid::from_u128(0xa1b2c3d4_e5f6_7890_abcd_ef012345678d);
