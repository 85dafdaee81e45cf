use crate::storage::error::StorageError;
use crate::storage::types::{OutboxOperation, StoredRecord};

/// Durable client-side storage for records, outbox, and metadata.
///
/// # Threading
/// All methods are synchronous. Callers in async code must not hold any
/// returned value's lock across an `.await`; implementations take their
/// locks per call.
pub trait VaultStorage: Send + Sync {
    fn get_record(&self, record_id: &str) -> Result<Option<StoredRecord>, StorageError>;
    fn put_record(&self, record: &StoredRecord) -> Result<(), StorageError>;
    /// All records including tombstones, ordered by `record_id`.
    fn scan_records(&self) -> Result<Vec<StoredRecord>, StorageError>;
    fn clear_records(&self) -> Result<(), StorageError>;

    fn get_outbox_for_record(
        &self,
        record_id: &str,
    ) -> Result<Option<OutboxOperation>, StorageError>;
    /// Insert or replace. Any other operation for the same `record_id` is
    /// removed.
    fn put_outbox(&self, op: &OutboxOperation) -> Result<(), StorageError>;
    fn remove_outbox(&self, op_id: &str) -> Result<bool, StorageError>;
    /// Pending operations in queue order (`created_at`, then `id`).
    fn scan_outbox(&self) -> Result<Vec<OutboxOperation>, StorageError>;
    fn clear_outbox(&self) -> Result<(), StorageError>;

    fn get_meta(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set_meta(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn delete_meta(&self, key: &str) -> Result<(), StorageError>;
}
