//! Canonical byte layout of sync envelopes and bundles.
//!
//! One envelope per entry, all integers little-endian:
//!
//! ```text
//! entry_uuid        16 bytes
//! profile_id        u64
//! sync_version      u64
//! updated_at        u16 length + UTF-8 bytes (RFC 3339 UTC)
//! label             u16 length + UTF-8 bytes
//! is_tombstone      u8 (0 or 1)
//! nonce             12 bytes
//! ct_len            u32
//! ciphertext        ct_len bytes (tag appended, session key)
//! ```
//!
//! A bundle is `entry_count (u32) || envelope...`. Decoding is strict:
//! unknown trailing bytes, bad discriminants, or truncation all fail
//! the transfer rather than being skipped.

use crate::crypto::cipher::NONCE_LEN;
use crate::{Result, SyncErrorKind, VaultError};
use uuid::Uuid;

/// Upper bound for a single envelope's ciphertext; anything larger is
/// a corrupt or hostile length field.
const MAX_CIPHERTEXT_LEN: u32 = 16 * 1024 * 1024;

/// A vault entry as transmitted during sync, encrypted under the
/// session key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub entry_uuid: Uuid,
    pub profile_id: u64,
    pub sync_version: u64,
    pub updated_at: String,
    pub label: String,
    pub is_tombstone: bool,
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            16 + 8 + 8 + 2 + self.updated_at.len() + 2 + self.label.len() + 1 + NONCE_LEN + 4
                + self.ciphertext.len(),
        );
        buf.extend_from_slice(self.entry_uuid.as_bytes());
        buf.extend_from_slice(&self.profile_id.to_le_bytes());
        buf.extend_from_slice(&self.sync_version.to_le_bytes());
        put_string(&mut buf, &self.updated_at);
        put_string(&mut buf, &self.label);
        buf.push(u8::from(self.is_tombstone));
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&(self.ciphertext.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.ciphertext);
        buf
    }

    fn decode(reader: &mut Reader) -> Result<Self> {
        let uuid_bytes: [u8; 16] = reader.take(16)?.try_into().expect("16 bytes");
        let entry_uuid = Uuid::from_bytes(uuid_bytes);
        let profile_id = reader.u64()?;
        let sync_version = reader.u64()?;
        let updated_at = reader.string()?;
        let label = reader.string()?;

        let is_tombstone = match reader.u8()? {
            0 => false,
            1 => true,
            _ => return Err(framing()),
        };

        let nonce: [u8; NONCE_LEN] = reader
            .take(NONCE_LEN)?
            .try_into()
            .expect("nonce length fixed");

        let ct_len = reader.u32()?;
        if ct_len > MAX_CIPHERTEXT_LEN {
            return Err(framing());
        }
        let ciphertext = reader.take(ct_len as usize)?.to_vec();

        Ok(Self {
            entry_uuid,
            profile_id,
            sync_version,
            updated_at,
            label,
            is_tombstone,
            nonce,
            ciphertext,
        })
    }
}

/// Encode a bundle: count-prefixed envelope sequence.
pub fn encode_bundle(envelopes: &[Envelope]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(envelopes.len() as u32).to_le_bytes());
    for envelope in envelopes {
        buf.extend_from_slice(&envelope.encode());
    }
    buf
}

/// Decode a bundle. The buffer must be consumed exactly.
pub fn decode_bundle(bytes: &[u8]) -> Result<Vec<Envelope>> {
    let mut reader = Reader::new(bytes);
    let count = reader.u32()?;

    let mut envelopes = Vec::with_capacity(count.min(4096) as usize);
    for _ in 0..count {
        envelopes.push(Envelope::decode(&mut reader)?);
    }

    if !reader.is_empty() {
        return Err(framing());
    }
    Ok(envelopes)
}

fn framing() -> VaultError {
    VaultError::Sync(SyncErrorKind::FramingError)
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(framing());
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().expect("2 bytes")))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| framing())
    }

    fn is_empty(&self) -> bool {
        self.pos == self.bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelope() -> Envelope {
        Envelope {
            entry_uuid: Uuid::new_v4(),
            profile_id: 1,
            sync_version: 7,
            updated_at: "2026-03-01T09:30:00.000000Z".to_string(),
            label: "github.com".to_string(),
            is_tombstone: false,
            nonce: [0x11; NONCE_LEN],
            ciphertext: vec![0xAB; 48],
        }
    }

    #[test]
    fn envelope_roundtrip() {
        let envelope = sample_envelope();
        let bytes = envelope.encode();
        let decoded = decode_bundle(&encode_bundle(std::slice::from_ref(&envelope))).unwrap();
        assert_eq!(decoded, vec![envelope.clone()]);

        // Layout spot checks: uuid first, little-endian profile id next
        assert_eq!(&bytes[..16], envelope.entry_uuid.as_bytes());
        assert_eq!(bytes[16], 1);
        assert_eq!(&bytes[17..24], &[0u8; 7]);
    }

    #[test]
    fn tombstone_envelope_roundtrip() {
        let mut envelope = sample_envelope();
        envelope.is_tombstone = true;
        envelope.ciphertext = vec![0xCD; 16];

        let decoded = decode_bundle(&encode_bundle(&[envelope.clone()])).unwrap();
        assert!(decoded[0].is_tombstone);
    }

    #[test]
    fn empty_bundle_roundtrip() {
        let bytes = encode_bundle(&[]);
        assert_eq!(bytes, vec![0, 0, 0, 0]);
        assert!(decode_bundle(&bytes).unwrap().is_empty());
    }

    #[test]
    fn multi_envelope_bundle_keeps_order() {
        let mut first = sample_envelope();
        first.label = "first.example".to_string();
        let mut second = sample_envelope();
        second.label = "second.example".to_string();

        let decoded = decode_bundle(&encode_bundle(&[first, second])).unwrap();
        assert_eq!(decoded[0].label, "first.example");
        assert_eq!(decoded[1].label, "second.example");
    }

    #[test]
    fn unicode_labels_survive() {
        let mut envelope = sample_envelope();
        envelope.label = "社内ポータル 🔐".to_string();
        let decoded = decode_bundle(&encode_bundle(&[envelope.clone()])).unwrap();
        assert_eq!(decoded[0].label, envelope.label);
    }

    #[test]
    fn truncation_is_a_framing_error() {
        let bytes = encode_bundle(&[sample_envelope()]);
        for cut in [4usize, 10, 20, bytes.len() - 1] {
            assert!(
                matches!(
                    decode_bundle(&bytes[..cut]),
                    Err(VaultError::Sync(SyncErrorKind::FramingError))
                ),
                "cut at {} accepted",
                cut
            );
        }
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let mut bytes = encode_bundle(&[sample_envelope()]);
        bytes.push(0x00);
        assert!(decode_bundle(&bytes).is_err());
    }

    #[test]
    fn bad_tombstone_discriminant_is_rejected() {
        let envelope = sample_envelope();
        let mut bytes = encode_bundle(&[envelope.clone()]);
        // is_tombstone sits after count(4) + uuid(16) + ids(16) + two strings
        let offset = 4 + 16 + 16 + 2 + envelope.updated_at.len() + 2 + envelope.label.len();
        assert_eq!(bytes[offset], 0);
        bytes[offset] = 2;
        assert!(decode_bundle(&bytes).is_err());
    }

    #[test]
    fn hostile_ciphertext_length_is_rejected() {
        let envelope = sample_envelope();
        let mut bytes = encode_bundle(&[envelope.clone()]);
        let ct_len_offset = bytes.len() - envelope.ciphertext.len() - 4;
        bytes[ct_len_offset..ct_len_offset + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(decode_bundle(&bytes).is_err());
    }

    #[test]
    fn count_mismatch_is_rejected() {
        let mut bytes = encode_bundle(&[sample_envelope()]);
        bytes[0] = 2; // claims two envelopes, carries one
        assert!(decode_bundle(&bytes).is_err());
    }

    #[test]
    fn invalid_utf8_label_is_rejected() {
        let envelope = sample_envelope();
        let bytes = encode_bundle(&[envelope.clone()]);
        let label_offset = 4 + 16 + 16 + 2 + envelope.updated_at.len() + 2;
        let mut bad = bytes.clone();
        bad[label_offset] = 0xFF;
        bad[label_offset + 1] = 0xFE;
        assert!(decode_bundle(&bad).is_err());
    }
}
