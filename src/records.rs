//! Encrypted record store.
//!
//! Every write seals the payload under the session's vault key, bumps the
//! record's local version and mirrors the result into the outbox. Nothing
//! here decrypts without a live key.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::crypto::{decrypt, encrypt, EncryptionContext, SealedBlob, VaultKey};
use crate::error::{Result, VaultError};
use crate::outbox::Outbox;
use crate::session::VaultSession;
use crate::storage::{RecordType, StoredRecord, VaultStorage};

/// A decrypted user record as seen by collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultRecord {
    pub record_id: String,
    pub record_type: RecordType,
    pub data: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VaultRecord {
    /// A new record with a fresh id.
    pub fn new(record_type: RecordType, data: Value) -> Self {
        let now = Utc::now();
        Self {
            record_id: uuid::Uuid::new_v4().to_string(),
            record_type,
            data,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A server-side version of a record, already decoded from the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteVersion {
    pub record_id: String,
    pub record_type: RecordType,
    pub blob: SealedBlob,
    pub version: i64,
    pub deleted: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied(StoredRecord),
    /// Local copy is at the same or a newer version.
    Ignored { local_version: i64 },
}

pub(crate) fn context_for(record_type: RecordType, record_id: &str) -> EncryptionContext<'_> {
    EncryptionContext {
        record_type: record_type.as_str(),
        record_id,
    }
}

/// Seal a JSON payload for `record_id`.
pub(crate) fn seal(
    key: &VaultKey,
    record_type: RecordType,
    record_id: &str,
    data: &Value,
) -> Result<SealedBlob> {
    let plaintext = zeroize::Zeroizing::new(serde_json::to_vec(data)?);
    Ok(encrypt(
        &plaintext,
        key.as_bytes(),
        &context_for(record_type, record_id),
    )?)
}

/// Open a stored row. Tombstones still carry their last ciphertext.
pub(crate) fn open(key: &VaultKey, stored: &StoredRecord) -> Result<VaultRecord> {
    open_blob(key, stored.record_type, &stored.record_id, &stored.blob).map(|data| VaultRecord {
        record_id: stored.record_id.clone(),
        record_type: stored.record_type,
        data,
        created_at: stored.created_at,
        updated_at: stored.updated_at,
    })
}

pub(crate) fn open_blob(
    key: &VaultKey,
    record_type: RecordType,
    record_id: &str,
    blob: &SealedBlob,
) -> Result<Value> {
    let plaintext = zeroize::Zeroizing::new(decrypt(
        blob,
        key.as_bytes(),
        &context_for(record_type, record_id),
    )?);
    Ok(serde_json::from_slice(&plaintext)?)
}

#[derive(Clone)]
pub struct RecordStore {
    storage: Arc<dyn VaultStorage>,
    session: Arc<VaultSession>,
    outbox: Outbox,
}

impl RecordStore {
    pub fn new(storage: Arc<dyn VaultStorage>, session: Arc<VaultSession>, outbox: Outbox) -> Self {
        Self {
            storage,
            session,
            outbox,
        }
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Encrypt and persist `record`, then queue it for push.
    ///
    /// `version` becomes the existing version + 1, or 1 for a new id. A
    /// tombstoned id is revived.
    pub fn put(&self, record: &VaultRecord) -> Result<StoredRecord> {
        let key = self.session.key()?;
        let existing = self.storage.get_record(&record.record_id)?;
        if let Some(existing) = &existing {
            if existing.record_type != record.record_type {
                return Err(VaultError::Protocol(format!(
                    "record {} is a {}, not a {}",
                    record.record_id, existing.record_type, record.record_type
                )));
            }
        }
        let blob = seal(&key, record.record_type, &record.record_id, &record.data)?;
        let stored = StoredRecord {
            record_id: record.record_id.clone(),
            record_type: record.record_type,
            blob,
            version: existing.as_ref().map_or(1, |e| e.version + 1),
            server_version: existing.as_ref().and_then(|e| e.server_version),
            deleted: false,
            conflict_ref: existing.as_ref().and_then(|e| e.conflict_ref.clone()),
            created_at: existing.as_ref().map_or(record.created_at, |e| e.created_at),
            updated_at: Utc::now(),
        };
        self.storage.put_record(&stored)?;
        self.outbox.enqueue_record(&stored)?;
        debug!(record_id = %stored.record_id, version = stored.version, "record put");
        Ok(stored)
    }

    /// Decrypted record, or `None` when absent or tombstoned.
    pub fn get(&self, record_id: &str) -> Result<Option<VaultRecord>> {
        let key = self.session.key()?;
        match self.storage.get_record(record_id)? {
            Some(stored) if !stored.deleted => Ok(Some(open(&key, &stored)?)),
            _ => Ok(None),
        }
    }

    /// Every live record, decrypted.
    pub fn get_all(&self) -> Result<Vec<VaultRecord>> {
        let key = self.session.key()?;
        self.storage
            .scan_records()?
            .iter()
            .filter(|r| !r.deleted)
            .map(|r| open(&key, r))
            .collect()
    }

    /// Tombstone a record. The last ciphertext is kept so the server row
    /// stays fully encrypted.
    pub fn mark_deleted(&self, record_id: &str) -> Result<StoredRecord> {
        let mut stored = self
            .storage
            .get_record(record_id)?
            .ok_or_else(|| VaultError::NotFound(record_id.to_string()))?;
        if stored.deleted {
            return Ok(stored);
        }
        stored.deleted = true;
        stored.version += 1;
        stored.updated_at = Utc::now();
        self.storage.put_record(&stored)?;
        self.outbox.enqueue_record(&stored)?;
        debug!(record_id, version = stored.version, "record tombstoned");
        Ok(stored)
    }

    pub fn get_stored(&self, record_id: &str) -> Result<Option<StoredRecord>> {
        Ok(self.storage.get_record(record_id)?)
    }

    pub fn scan(&self) -> Result<Vec<StoredRecord>> {
        Ok(self.storage.scan_records()?)
    }

    /// Apply a pulled version if it is strictly newer than what is held.
    pub fn apply_remote(&self, remote: &RemoteVersion) -> Result<ApplyOutcome> {
        let existing = self.storage.get_record(&remote.record_id)?;
        if let Some(local) = &existing {
            if remote.version <= local.version {
                trace!(
                    record_id = %remote.record_id,
                    local = local.version,
                    remote = remote.version,
                    "pulled version not newer; ignored"
                );
                return Ok(ApplyOutcome::Ignored {
                    local_version: local.version,
                });
            }
        }
        let stored = self.write_remote(existing, remote)?;
        Ok(ApplyOutcome::Applied(stored))
    }

    /// Adopt the server's current version unconditionally (conflict path).
    pub fn adopt_remote(&self, remote: &RemoteVersion) -> Result<StoredRecord> {
        let existing = self.storage.get_record(&remote.record_id)?;
        self.write_remote(existing, remote)
    }

    fn write_remote(&self, existing: Option<StoredRecord>, remote: &RemoteVersion) -> Result<StoredRecord> {
        let stored = StoredRecord {
            record_id: remote.record_id.clone(),
            record_type: remote.record_type,
            blob: remote.blob.clone(),
            version: remote.version,
            server_version: Some(remote.version),
            deleted: remote.deleted,
            conflict_ref: existing.as_ref().and_then(|e| e.conflict_ref.clone()),
            created_at: existing.as_ref().map_or(remote.updated_at, |e| e.created_at),
            updated_at: remote.updated_at,
        };
        self.storage.put_record(&stored)?;
        Ok(stored)
    }

    /// Record that the server accepted a write at `version`.
    pub fn reconcile_version(&self, record_id: &str, version: i64) -> Result<()> {
        if let Some(mut stored) = self.storage.get_record(record_id)? {
            stored.version = version;
            stored.server_version = Some(version);
            self.storage.put_record(&stored)?;
        }
        Ok(())
    }

    pub fn set_conflict_ref(&self, record_id: &str, conflict_ref: Option<String>) -> Result<()> {
        let mut stored = self
            .storage
            .get_record(record_id)?
            .ok_or_else(|| VaultError::NotFound(record_id.to_string()))?;
        stored.conflict_ref = conflict_ref;
        self.storage.put_record(&stored)?;
        Ok(())
    }

    /// Write a row as-is (backup import) and queue it for push.
    pub fn import_stored(&self, stored: &StoredRecord) -> Result<()> {
        self.storage.put_record(stored)?;
        let mut op_source = stored.clone();
        op_source.server_version = Some(stored.version);
        self.outbox.enqueue_record(&op_source)?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.storage.clear_records()?;
        self.outbox.clear()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OutboxConfig, SessionConfig};
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn store() -> (RecordStore, Arc<VaultSession>) {
        let storage: Arc<dyn VaultStorage> = Arc::new(MemoryStorage::new());
        let session = Arc::new(VaultSession::new(&SessionConfig::default()));
        session.unlock(VaultKey::generate().unwrap());
        let outbox = Outbox::new(storage.clone(), OutboxConfig::default());
        (RecordStore::new(storage, session.clone(), outbox), session)
    }

    #[test]
    fn put_get_round_trip() {
        let (store, _) = store();
        let record = VaultRecord::new(RecordType::Bookmark, json!({"url": "https://a.example"}));
        let stored = store.put(&record).unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.server_version, None);
        let loaded = store.get(&record.record_id).unwrap().unwrap();
        assert_eq!(loaded.data, record.data);
    }

    #[test]
    fn each_write_increments_version_and_collapses_outbox() {
        let (store, _) = store();
        let mut record = VaultRecord::new(RecordType::Bookmark, json!({"n": 1}));
        store.put(&record).unwrap();
        record.data = json!({"n": 2});
        let stored = store.put(&record).unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(store.outbox().pending_count().unwrap(), 1);
        let op = store.outbox().pending_for(&record.record_id).unwrap().unwrap();
        assert_eq!(op.base_version, None);
        assert_eq!(SealedBlob::from_bytes(&op.ciphertext).unwrap(), stored.blob);
    }

    #[test]
    fn locked_store_refuses_reads_and_writes() {
        let (store, session) = store();
        let record = VaultRecord::new(RecordType::View, json!({}));
        store.put(&record).unwrap();
        session.lock();
        assert!(matches!(store.get(&record.record_id), Err(VaultError::Locked)));
        assert!(matches!(store.put(&record), Err(VaultError::Locked)));
        assert!(matches!(store.get_all(), Err(VaultError::Locked)));
    }

    #[test]
    fn tombstone_keeps_ciphertext() {
        let (store, _) = store();
        let record = VaultRecord::new(RecordType::Collection, json!({"name": "x"}));
        let before = store.put(&record).unwrap();
        let after = store.mark_deleted(&record.record_id).unwrap();
        assert!(after.deleted);
        assert_eq!(after.version, 2);
        assert_eq!(after.blob, before.blob);
        assert!(store.get(&record.record_id).unwrap().is_none());
        assert!(store.get_all().unwrap().is_empty());
        assert!(store.outbox().pending_for(&record.record_id).unwrap().unwrap().deleted);
    }

    #[test]
    fn delete_missing_is_not_found() {
        let (store, _) = store();
        assert!(matches!(store.mark_deleted("nope"), Err(VaultError::NotFound(_))));
    }

    #[test]
    fn record_type_cannot_change() {
        let (store, _) = store();
        let mut record = VaultRecord::new(RecordType::Bookmark, json!({}));
        store.put(&record).unwrap();
        record.record_type = RecordType::View;
        assert!(store.put(&record).is_err());
    }

    #[test]
    fn pull_applies_only_newer_versions() {
        let (store, session) = store();
        let key = session.key().unwrap();
        let record_id = "r1".to_string();
        let remote = |version: i64| RemoteVersion {
            record_id: record_id.clone(),
            record_type: RecordType::Bookmark,
            blob: seal(&key, RecordType::Bookmark, &record_id, &json!({"v": version})).unwrap(),
            version,
            deleted: false,
            updated_at: Utc::now(),
        };
        assert!(matches!(store.apply_remote(&remote(7)).unwrap(), ApplyOutcome::Applied(_)));
        assert_eq!(
            store.apply_remote(&remote(5)).unwrap(),
            ApplyOutcome::Ignored { local_version: 7 }
        );
        assert_eq!(
            store.apply_remote(&remote(3)).unwrap(),
            ApplyOutcome::Ignored { local_version: 7 }
        );
        assert!(matches!(store.apply_remote(&remote(8)).unwrap(), ApplyOutcome::Applied(_)));
        assert_eq!(store.get(&record_id).unwrap().unwrap().data, json!({"v": 8}));
    }

    #[test]
    fn ciphertext_is_bound_to_its_record() {
        let (store, session) = store();
        let key = session.key().unwrap();
        let blob = seal(&key, RecordType::Bookmark, "a", &json!({"x": 1})).unwrap();
        assert!(matches!(
            open_blob(&key, RecordType::Bookmark, "b", &blob),
            Err(VaultError::AuthenticationFailure)
        ));
        drop(store);
    }
}
