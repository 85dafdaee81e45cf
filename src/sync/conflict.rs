//! Conflict handling for rejected pushes, and the user's later choice
//! between the two sides.
//!
//! A rejected content push never overwrites the server. The local intent
//! is re-encrypted into a new record marked as a conflict copy, the
//! original adopts the server's value, and both stay visible.

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::crypto::SealedBlob;
use crate::error::{Result, VaultError};
use crate::outbox::Outbox;
use crate::records::{self, RecordStore, RemoteVersion, VaultRecord};
use crate::session::VaultSession;
use crate::storage::OutboxOperation;
use crate::sync::wire::PushConflict;

pub const CONFLICT_WITH_FIELD: &str = "conflictWith";
pub const CONFLICT_TITLE_SUFFIX: &str = " (conflict copy)";

#[derive(Debug, Clone, PartialEq)]
pub enum ConflictOutcome {
    /// Local content went to a new record; the original took the server's
    /// version. `original` is `None` when the server side is a tombstone
    /// or the vault locked mid-way.
    Copied {
        copy: VaultRecord,
        original: Option<VaultRecord>,
    },
    /// A rejected delete: the server's value was adopted, nothing copied.
    AdoptedServer { record_id: String },
    /// Vault is locked so the copy cannot be sealed; the op stays queued.
    Deferred,
    /// The server has no ciphertext to adopt; the op was pointed at the
    /// server's version and will be retried.
    Rebased,
}

/// Which side of a conflict the user keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepSide {
    Original,
    Copy,
}

/// Add the copy marker to a payload. Objects get `conflictWith` and a
/// suffixed `title`; other payloads are wrapped.
pub fn mark_conflict_copy(data: Value, original_id: &str) -> Value {
    let mut object = match data {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    if let Some(Value::String(title)) = object.get_mut("title") {
        if !title.ends_with(CONFLICT_TITLE_SUFFIX) {
            title.push_str(CONFLICT_TITLE_SUFFIX);
        }
    }
    object.insert(
        CONFLICT_WITH_FIELD.to_string(),
        Value::String(original_id.to_string()),
    );
    Value::Object(object)
}

/// Undo [`mark_conflict_copy`] on a copy the user decided to keep.
pub fn clear_conflict_marker(data: &mut Value) {
    let Value::Object(object) = data else {
        return;
    };
    object.remove(CONFLICT_WITH_FIELD);
    if let Some(Value::String(title)) = object.get_mut("title") {
        if title.ends_with(CONFLICT_TITLE_SUFFIX) {
            title.truncate(title.len() - CONFLICT_TITLE_SUFFIX.len());
        }
    }
}

pub struct ConflictResolver<'a> {
    records: &'a RecordStore,
    outbox: &'a Outbox,
    session: &'a VaultSession,
}

impl<'a> ConflictResolver<'a> {
    pub fn new(records: &'a RecordStore, outbox: &'a Outbox, session: &'a VaultSession) -> Self {
        Self {
            records,
            outbox,
            session,
        }
    }

    /// Handle the server's rejection of `op`.
    pub fn resolve(&self, op: &OutboxOperation, conflict: &PushConflict) -> Result<ConflictOutcome> {
        let Some(current_ciphertext) = &conflict.current_ciphertext else {
            let base = (conflict.current_version > 0).then_some(conflict.current_version);
            self.outbox.rebase(&op.record_id, base)?;
            info!(record_id = %op.record_id, ?base, "conflict without server ciphertext; rebased");
            return Ok(ConflictOutcome::Rebased);
        };

        let server = RemoteVersion {
            record_id: op.record_id.clone(),
            record_type: op.record_type,
            blob: SealedBlob::from_bytes(current_ciphertext).map_err(|e| {
                VaultError::Protocol(format!("conflict ciphertext for {}: {e}", op.record_id))
            })?,
            version: conflict.current_version,
            deleted: conflict.current_deleted,
            updated_at: conflict.updated_at.unwrap_or_else(chrono::Utc::now),
        };

        if op.deleted {
            self.records.adopt_remote(&server)?;
            self.outbox.remove(&op.id)?;
            info!(
                record_id = %op.record_id,
                version = server.version,
                "rejected delete; adopted server version"
            );
            return Ok(ConflictOutcome::AdoptedServer {
                record_id: op.record_id.clone(),
            });
        }

        let key = match self.session.key() {
            Ok(key) => key,
            Err(VaultError::Locked) => {
                info!(record_id = %op.record_id, "conflict deferred until unlock");
                return Ok(ConflictOutcome::Deferred);
            }
            Err(e) => return Err(e),
        };

        let local_blob = SealedBlob::from_bytes(&op.ciphertext)
            .map_err(|e| VaultError::Protocol(format!("queued ciphertext for {}: {e}", op.record_id)))?;
        let intended = records::open_blob(&key, op.record_type, &op.record_id, &local_blob)?;

        let mut copy = VaultRecord::new(op.record_type, mark_conflict_copy(intended, &op.record_id));
        if let Some(stored) = self.records.get_stored(&op.record_id)? {
            copy.created_at = stored.created_at;
        }
        self.records.put(&copy)?;

        let adopted = self.records.adopt_remote(&server)?;
        self.records
            .set_conflict_ref(&op.record_id, Some(copy.record_id.clone()))?;
        self.outbox.remove(&op.id)?;

        let original = if adopted.deleted {
            None
        } else {
            match records::open(&key, &adopted) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(record_id = %op.record_id, error = %e, "server version does not decrypt");
                    None
                }
            }
        };
        info!(
            record_id = %op.record_id,
            copy_id = %copy.record_id,
            base_version = ?conflict.base_version,
            current_version = conflict.current_version,
            "push conflict; created conflict copy"
        );
        Ok(ConflictOutcome::Copied { copy, original })
    }

    /// Delete one side of a conflict and clear the tag on the other.
    /// Returns the id of the record that was deleted.
    pub fn resolve_user_choice(&self, original_id: &str, keep: KeepSide) -> Result<String> {
        let original = self
            .records
            .get_stored(original_id)?
            .ok_or_else(|| VaultError::NotFound(original_id.to_string()))?;
        let copy_id = original
            .conflict_ref
            .clone()
            .ok_or_else(|| VaultError::NotFound(format!("no conflict on {original_id}")))?;

        let deleted = match keep {
            KeepSide::Original => {
                if self.records.get_stored(&copy_id)?.is_some() {
                    self.records.mark_deleted(&copy_id)?;
                }
                self.records.set_conflict_ref(original_id, None)?;
                copy_id
            }
            KeepSide::Copy => {
                let mut copy = self
                    .records
                    .get(&copy_id)?
                    .ok_or_else(|| VaultError::NotFound(copy_id.clone()))?;
                clear_conflict_marker(&mut copy.data);
                self.records.put(&copy)?;
                self.records.mark_deleted(original_id)?;
                self.records.set_conflict_ref(original_id, None)?;
                original_id.to_string()
            }
        };
        info!(original_id, deleted = %deleted, "conflict resolved");
        Ok(deleted)
    }
}
