//! Durable, per-record-collapsing queue of local mutations.
//!
//! Each record has at most one pending operation; a later mutation replaces
//! the earlier one and resets its retry counter. Operations leave the queue
//! only on server acceptance or when conflict handling supersedes them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::OutboxConfig;
use crate::error::Result;
use crate::storage::{OutboxOperation, StoredRecord, VaultStorage};

/// Outcome of pushing one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpResult {
    Accepted { version: i64 },
    Failed,
}

#[derive(Clone)]
pub struct Outbox {
    storage: Arc<dyn VaultStorage>,
    config: OutboxConfig,
}

impl Outbox {
    pub fn new(storage: Arc<dyn VaultStorage>, config: OutboxConfig) -> Self {
        Self { storage, config }
    }

    /// Queue `op`, replacing any pending operation for the same record.
    pub fn enqueue(&self, mut op: OutboxOperation) -> Result<OutboxOperation> {
        op.retries = 0;
        op.last_attempt_at = None;
        self.storage.put_outbox(&op)?;
        debug!(op_id = %op.id, record_id = %op.record_id, deleted = op.deleted, "outbox enqueue");
        Ok(op)
    }

    /// Mirror a freshly written local record into the queue. The base
    /// version is the last version the server acknowledged.
    pub fn enqueue_record(&self, record: &StoredRecord) -> Result<OutboxOperation> {
        self.enqueue(OutboxOperation {
            id: uuid::Uuid::new_v4().to_string(),
            record_id: record.record_id.clone(),
            record_type: record.record_type,
            base_version: record.server_version,
            ciphertext: record.blob.to_bytes(),
            deleted: record.deleted,
            created_at: Utc::now(),
            retries: 0,
            last_attempt_at: None,
        })
    }

    /// When `op` may next be attempted. Fresh operations are due at once.
    pub fn next_attempt_at(&self, op: &OutboxOperation) -> DateTime<Utc> {
        match op.last_attempt_at {
            None => op.created_at,
            Some(last) => last + self.config.backoff(op.retries),
        }
    }

    /// Operations whose backoff has elapsed, in queue order.
    pub fn retryable_now(&self, now: DateTime<Utc>) -> Result<Vec<OutboxOperation>> {
        Ok(self
            .storage
            .scan_outbox()?
            .into_iter()
            .filter(|op| self.next_attempt_at(op) <= now)
            .collect())
    }

    /// Apply the outcome of a push attempt.
    ///
    /// If the operation was replaced by a newer mutation while in flight,
    /// a failure is ignored (the replacement starts with fresh retries) and
    /// an acceptance only removes the original id.
    pub fn on_result(&self, op: &OutboxOperation, result: OpResult, now: DateTime<Utc>) -> Result<()> {
        match result {
            OpResult::Accepted { version } => {
                self.storage.remove_outbox(&op.id)?;
                debug!(op_id = %op.id, record_id = %op.record_id, version, "outbox op acknowledged");
            }
            OpResult::Failed => {
                let Some(mut current) = self.storage.get_outbox_for_record(&op.record_id)? else {
                    return Ok(());
                };
                if current.id != op.id {
                    return Ok(());
                }
                current.retries += 1;
                current.last_attempt_at = Some(now);
                self.storage.put_outbox(&current)?;
                warn!(
                    op_id = %current.id,
                    record_id = %current.record_id,
                    retries = current.retries,
                    next_attempt = %self.next_attempt_at(&current),
                    "outbox op failed"
                );
            }
        }
        Ok(())
    }

    /// Point a pending operation at a newly accepted server version so it
    /// does not conflict with its own predecessor.
    pub fn rebase(&self, record_id: &str, version: Option<i64>) -> Result<bool> {
        let Some(mut op) = self.storage.get_outbox_for_record(record_id)? else {
            return Ok(false);
        };
        op.base_version = version;
        self.storage.put_outbox(&op)?;
        debug!(op_id = %op.id, record_id, ?version, "outbox op rebased");
        Ok(true)
    }

    pub fn remove(&self, op_id: &str) -> Result<bool> {
        Ok(self.storage.remove_outbox(op_id)?)
    }

    pub fn pending_for(&self, record_id: &str) -> Result<Option<OutboxOperation>> {
        Ok(self.storage.get_outbox_for_record(record_id)?)
    }

    pub fn pending(&self) -> Result<Vec<OutboxOperation>> {
        Ok(self.storage.scan_outbox()?)
    }

    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.storage.scan_outbox()?.len())
    }

    pub fn clear(&self) -> Result<()> {
        Ok(self.storage.clear_outbox()?)
    }
}
