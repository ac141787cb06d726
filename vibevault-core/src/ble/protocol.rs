//! Control opcodes, mode byte, and chunk framing for the data channel.
//!
//! Every logical message on the DataTransfer characteristic is split
//! into chunks of at most [`MAX_CHUNK_DATA`] payload bytes. On the
//! wire a chunk is `8 + N` bytes, all integers little-endian:
//!
//! ```text
//! bytes 0-1   index  (u16, 0-based)
//! bytes 2-3   total  (u16, >= 1)
//! bytes 4-7   crc32  (IEEE, over the payload only)
//! bytes 8..   payload
//! ```

use crate::{Result, SyncErrorKind, VaultError};
use crc32fast::Hasher as Crc32Hasher;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Largest write the radio accepts after ATT overhead.
const MAX_CHUNK_PAYLOAD: usize = 501;

/// index(u16) + total(u16) + crc32(u32).
pub const CHUNK_HEADER_SIZE: usize = 8;

/// Payload capacity per chunk.
pub const MAX_CHUNK_DATA: usize = MAX_CHUNK_PAYLOAD - CHUNK_HEADER_SIZE;

/// Opcodes on the SyncControl characteristic. Unknown bytes are
/// ignored by receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SyncControl {
    Start = 0x01,
    Ack = 0x02,
    Abort = 0x03,
    Complete = 0x04,
}

impl SyncControl {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(SyncControl::Start),
            0x02 => Some(SyncControl::Ack),
            0x03 => Some(SyncControl::Abort),
            0x04 => Some(SyncControl::Complete),
            _ => None,
        }
    }
}

/// Transfer direction byte exposed on the Mode characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SyncMode {
    /// Peripheral sends the bundle.
    Push = 0x01,
    /// Peripheral receives the bundle.
    Pull = 0x02,
}

impl SyncMode {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(SyncMode::Push),
            0x02 => Some(SyncMode::Pull),
            _ => None,
        }
    }
}

/// One frame of a chunked message.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub index: u16,
    pub total: u16,
    pub crc32: u32,
    pub data: Vec<u8>,
}

fn crc32_of(data: &[u8]) -> u32 {
    let mut hasher = Crc32Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

impl Chunk {
    /// Serialize to `[index_le][total_le][crc32_le][payload]`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CHUNK_HEADER_SIZE + self.data.len());
        buf.extend_from_slice(&self.index.to_le_bytes());
        buf.extend_from_slice(&self.total.to_le_bytes());
        buf.extend_from_slice(&self.crc32.to_le_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Parse and CRC-check a received frame.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CHUNK_HEADER_SIZE {
            debug!(len = bytes.len(), "chunk below header size");
            return Err(VaultError::Sync(SyncErrorKind::FramingError));
        }

        let index = u16::from_le_bytes([bytes[0], bytes[1]]);
        let total = u16::from_le_bytes([bytes[2], bytes[3]]);
        let crc32 = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let data = bytes[CHUNK_HEADER_SIZE..].to_vec();

        let computed = crc32_of(&data);
        if computed != crc32 {
            debug!(index, expected = crc32, got = computed, "chunk crc mismatch");
            return Err(VaultError::Sync(SyncErrorKind::FramingError));
        }

        Ok(Chunk {
            index,
            total,
            crc32,
            data,
        })
    }
}

/// Split a message into wire chunks. An empty message still produces
/// one (empty) chunk so the receiver always sees `total >= 1`.
pub fn chunk_message(data: &[u8]) -> Vec<Chunk> {
    let pieces: Vec<&[u8]> = if data.is_empty() {
        vec![&[]]
    } else {
        data.chunks(MAX_CHUNK_DATA).collect()
    };
    let total = pieces.len() as u16;

    pieces
        .into_iter()
        .enumerate()
        .map(|(i, piece)| Chunk {
            index: i as u16,
            total,
            crc32: crc32_of(piece),
            data: piece.to_vec(),
        })
        .collect()
}

/// Slot-array reassembly of a chunked message.
///
/// Duplicate indices are idempotent; a `total` or index-range mismatch
/// aborts the message.
pub struct ChunkReassembler {
    total: u16,
    slots: Vec<Option<Vec<u8>>>,
    filled: u16,
}

impl ChunkReassembler {
    pub fn new(total: u16) -> Result<Self> {
        if total == 0 {
            return Err(VaultError::Sync(SyncErrorKind::FramingError));
        }
        Ok(Self {
            total,
            slots: vec![None; total as usize],
            filled: 0,
        })
    }

    /// Accept one chunk. Returns true once every slot is filled.
    pub fn add_chunk(&mut self, chunk: Chunk) -> Result<bool> {
        if chunk.total != self.total || chunk.index >= self.total {
            debug!(
                index = chunk.index,
                chunk_total = chunk.total,
                expected_total = self.total,
                "chunk outside message bounds"
            );
            return Err(VaultError::Sync(SyncErrorKind::FramingError));
        }

        let slot = &mut self.slots[chunk.index as usize];
        if slot.is_none() {
            self.filled += 1;
        }
        *slot = Some(chunk.data);

        Ok(self.filled == self.total)
    }

    pub fn is_complete(&self) -> bool {
        self.filled == self.total
    }

    /// `(received, total)` for progress reporting.
    pub fn progress(&self) -> (u16, u16) {
        (self.filled, self.total)
    }

    /// Concatenate the payloads in index order.
    pub fn reassemble(self) -> Result<Vec<u8>> {
        if !self.is_complete() {
            return Err(VaultError::Sync(SyncErrorKind::FramingError));
        }

        let mut message = Vec::new();
        for slot in self.slots {
            message.extend_from_slice(&slot.expect("completeness checked"));
        }
        Ok(message)
    }
}
