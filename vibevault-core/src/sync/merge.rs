//! Last-writer-wins merge of inbound envelopes.
//!
//! Per `entry_uuid`: higher `sync_version` wins; ties fall to the
//! later `updated_at`; a full tie keeps the local row, which makes
//! re-applying the same envelope a no-op. The winning row's version
//! and timestamp are written verbatim, never re-stamped, so both ends
//! converge on identical state regardless of order.

use crate::crypto::{cipher, VaultKey};
use crate::store::{models::EntryRow, Store};
use crate::sync::wire::Envelope;
use crate::Result;
use serde::Serialize;
use tracing::debug;

/// What to do with one inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    AcceptInbound,
    KeepLocal,
}

/// Decide between an existing local row and an inbound envelope.
pub fn resolve(local: &EntryRow, inbound: &Envelope) -> Resolution {
    let local_key = (
        local.sync_version as u64,
        local.updated_at.as_str(),
        *local.entry_uuid.as_bytes(),
    );
    let inbound_key = (
        inbound.sync_version,
        inbound.updated_at.as_str(),
        *inbound.entry_uuid.as_bytes(),
    );

    if inbound_key > local_key {
        Resolution::AcceptInbound
    } else {
        Resolution::KeepLocal
    }
}

/// Counters for one ingestion pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub inserted: u32,
    pub updated: u32,
    pub deleted: u32,
    pub skipped: u32,
}

impl MergeStats {
    pub fn applied(&self) -> u32 {
        self.inserted + self.updated + self.deleted
    }

    pub fn total(&self) -> u32 {
        self.applied() + self.skipped
    }
}

/// Merge one envelope into the store.
///
/// The payload is decrypted under the session key and, when the
/// envelope wins, re-encrypted under the local vault key with a fresh
/// nonce. Each call is one transaction; a failure leaves prior
/// envelopes applied and this one untouched.
pub fn ingest_envelope(
    store: &Store,
    vault_key: &VaultKey,
    session_key: &VaultKey,
    envelope: &Envelope,
    stats: &mut MergeStats,
) -> Result<()> {
    let local = store.get_entry_by_uuid(&envelope.entry_uuid)?;

    if let Some(ref local_row) = local {
        if resolve(local_row, envelope) == Resolution::KeepLocal {
            debug!(uuid = %envelope.entry_uuid, "inbound envelope loses, keeping local");
            stats.skipped += 1;
            return Ok(());
        }
    }

    // Authenticates the envelope ciphertext even for tombstones.
    let plaintext = cipher::decrypt(session_key, &envelope.nonce, &envelope.ciphertext)?;

    let (data_blob, nonce, deleted_at) = if envelope.is_tombstone {
        (Vec::new(), Vec::new(), Some(envelope.updated_at.clone()))
    } else {
        let encrypted = cipher::encrypt(vault_key, &plaintext)?;
        (encrypted.ciphertext, encrypted.nonce.to_vec(), None)
    };

    let row = EntryRow {
        id: 0, // ignored by upsert
        entry_uuid: envelope.entry_uuid,
        label: envelope.label.clone(),
        data_blob,
        nonce,
        profile_id: envelope.profile_id as i64,
        // The wire carries no creation time; a first sighting adopts
        // the modification time.
        created_at: local
            .as_ref()
            .map(|l| l.created_at.clone())
            .unwrap_or_else(|| envelope.updated_at.clone()),
        updated_at: envelope.updated_at.clone(),
        deleted_at,
        sync_version: envelope.sync_version as i64,
    };
    store.upsert_by_uuid(&row)?;

    match (&local, envelope.is_tombstone) {
        (None, _) => stats.inserted += 1,
        (Some(l), true) if !l.is_tombstone() => stats.deleted += 1,
        _ => stats.updated += 1,
    }
    Ok(())
}

/// Merge a whole bundle, envelope by envelope, in transmission order.
/// `stats` is updated as envelopes land so a mid-bundle failure still
/// reports what was applied.
pub fn ingest_bundle(
    store: &Store,
    vault_key: &VaultKey,
    session_key: &VaultKey,
    envelopes: &[Envelope],
    stats: &mut MergeStats,
) -> Result<()> {
    for envelope in envelopes {
        ingest_envelope(store, vault_key, session_key, envelope, stats)?;
    }
    Ok(())
}
