//! In-memory backend. Used for tests and as the degraded fallback when no
//! durable storage can be opened.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::storage::error::StorageError;
use crate::storage::traits::VaultStorage;
use crate::storage::types::{OutboxOperation, StoredRecord};

#[derive(Default)]
pub struct MemoryStorage {
    /// record id → record (sorted for deterministic scans)
    records: Mutex<BTreeMap<String, StoredRecord>>,
    /// op id → operation
    outbox: Mutex<HashMap<String, OutboxOperation>>,
    meta: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VaultStorage for MemoryStorage {
    fn get_record(&self, record_id: &str) -> Result<Option<StoredRecord>, StorageError> {
        Ok(self.records.lock().get(record_id).cloned())
    }

    fn put_record(&self, record: &StoredRecord) -> Result<(), StorageError> {
        self.records
            .lock()
            .insert(record.record_id.clone(), record.clone());
        Ok(())
    }

    fn scan_records(&self) -> Result<Vec<StoredRecord>, StorageError> {
        Ok(self.records.lock().values().cloned().collect())
    }

    fn clear_records(&self) -> Result<(), StorageError> {
        self.records.lock().clear();
        Ok(())
    }

    fn get_outbox_for_record(
        &self,
        record_id: &str,
    ) -> Result<Option<OutboxOperation>, StorageError> {
        Ok(self
            .outbox
            .lock()
            .values()
            .find(|op| op.record_id == record_id)
            .cloned())
    }

    fn put_outbox(&self, op: &OutboxOperation) -> Result<(), StorageError> {
        let mut outbox = self.outbox.lock();
        outbox.retain(|id, existing| id == &op.id || existing.record_id != op.record_id);
        outbox.insert(op.id.clone(), op.clone());
        Ok(())
    }

    fn remove_outbox(&self, op_id: &str) -> Result<bool, StorageError> {
        Ok(self.outbox.lock().remove(op_id).is_some())
    }

    fn scan_outbox(&self) -> Result<Vec<OutboxOperation>, StorageError> {
        let mut ops: Vec<_> = self.outbox.lock().values().cloned().collect();
        ops.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(ops)
    }

    fn clear_outbox(&self) -> Result<(), StorageError> {
        self.outbox.lock().clear();
        Ok(())
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.meta.lock().get(key).cloned())
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.meta.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete_meta(&self, key: &str) -> Result<(), StorageError> {
        self.meta.lock().remove(key);
        Ok(())
    }
}
