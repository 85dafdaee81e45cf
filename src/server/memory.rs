//! In-memory reference server.
//!
//! Implements optimistic concurrency on push, cursor pull, plaintext-mode
//! writes with the encrypted-row block, and the envelope mirror. All row
//! writes go through the mode enforcer.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{MAX_PULL_LIMIT, MAX_PUSH_BATCH};
use crate::envelope::VaultEnvelope;
use crate::server::mode::{self, ModeViolation, RowPayload, RowWrite};
use crate::server::row::ServerRow;
use crate::sync::wire::{
    PlaintextPushResponse, PlaintextWrite, PullRecord, PullRequest, PullResponse, PushConflict,
    PushRequest, PushResponse, PushResult,
};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("batch of {got} operations exceeds {max}")]
    BatchTooLarge { max: usize, got: usize },

    #[error("pull limit {got} outside 1..={max}")]
    InvalidLimit { max: usize, got: usize },

    #[error(transparent)]
    Mode(#[from] ModeViolation),

    #[error("envelope revision {got} does not follow stored revision {stored}")]
    EnvelopeConflict { stored: u64, got: u64 },

    #[error("recovery wrapper {0} is already spent")]
    SpentRecoveryCode(String),
}

#[derive(Default)]
struct ServerState {
    /// Keyed by (user_id, record_id).
    rows: BTreeMap<(String, String), ServerRow>,
    envelopes: HashMap<String, VaultEnvelope>,
    last_tick: Option<DateTime<Utc>>,
}

impl ServerState {
    /// Strictly increasing write timestamps, so no two rows share an
    /// `updatedAt` and pages never split a tie.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.last_tick {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_tick = Some(next);
        next
    }

    fn write(&mut self, write: RowWrite) -> Result<ServerRow, ServerError> {
        let key = (write.user_id.clone(), write.record_id.clone());
        let row = mode::enforce(self.rows.get(&key), write)?;
        self.rows.insert(key, row.clone());
        Ok(row)
    }

    fn user_rows<'a>(&'a self, user_id: &'a str) -> impl Iterator<Item = &'a ServerRow> + 'a {
        self.rows.values().filter(move |r| r.user_id == user_id)
    }

    fn plaintext_write(&mut self, user_id: &str, write: &PlaintextWrite) -> Result<ServerRow, ServerError> {
        let key = (user_id.to_string(), write.record_id.clone());
        let version = self.rows.get(&key).map_or(0, |r| r.version) + 1;
        let updated_at = self.tick();
        self.write(RowWrite {
            user_id: user_id.to_string(),
            record_id: write.record_id.clone(),
            record_type: write.record_type,
            payload: RowPayload::Plaintext(write.data.clone()),
            version,
            deleted: write.deleted,
            updated_at,
        })
    }
}

#[derive(Default)]
pub struct MemoryServer {
    state: Mutex<ServerState>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a push batch. Each operation is accepted when its base version
    /// equals the stored version (or both are absent); otherwise the
    /// server's current row is returned as a conflict.
    pub fn push(&self, user_id: &str, request: &PushRequest) -> Result<PushResponse, ServerError> {
        if request.operations.len() > MAX_PUSH_BATCH {
            return Err(ServerError::BatchTooLarge {
                max: MAX_PUSH_BATCH,
                got: request.operations.len(),
            });
        }
        if let Some(op) = request.operations.iter().find(|op| op.ciphertext.is_empty()) {
            return Err(ModeViolation::EmptyCiphertext(op.record_id.clone()).into());
        }

        let mut state = self.state.lock();
        let mut results = Vec::new();
        let mut conflicts = Vec::new();
        for op in &request.operations {
            let key = (user_id.to_string(), op.record_id.clone());
            let current = state.rows.get(&key);
            let accepted = match (op.base_version, current) {
                (None, None) => true,
                (Some(base), Some(row)) => base == row.version,
                _ => false,
            };
            if !accepted {
                conflicts.push(PushConflict {
                    record_id: op.record_id.clone(),
                    base_version: op.base_version,
                    current_version: current.map_or(0, |r| r.version),
                    current_ciphertext: current.and_then(|r| r.ciphertext.clone()),
                    current_deleted: current.is_some_and(|r| r.deleted),
                    updated_at: current.map(|r| r.updated_at),
                });
                debug!(record_id = %op.record_id, base = ?op.base_version, "push rejected");
                continue;
            }
            let version = current.map_or(0, |r| r.version) + 1;
            let updated_at = state.tick();
            state.write(RowWrite {
                user_id: user_id.to_string(),
                record_id: op.record_id.clone(),
                record_type: op.record_type,
                payload: RowPayload::Encrypted(op.ciphertext.clone()),
                version,
                deleted: op.deleted,
                updated_at,
            })?;
            results.push(PushResult {
                record_id: op.record_id.clone(),
                version,
            });
        }
        Ok(PushResponse {
            success: conflicts.is_empty(),
            results,
            conflicts,
        })
    }

    /// Encrypted rows changed after the cursor, oldest first.
    pub fn pull(&self, user_id: &str, request: &PullRequest) -> Result<PullResponse, ServerError> {
        if request.limit == 0 || request.limit > MAX_PULL_LIMIT {
            return Err(ServerError::InvalidLimit {
                max: MAX_PULL_LIMIT,
                got: request.limit,
            });
        }
        let state = self.state.lock();
        let mut rows: Vec<&ServerRow> = state
            .user_rows(user_id)
            .filter(|r| r.encrypted)
            .filter(|r| request.cursor.map_or(true, |c| r.updated_at > c))
            .collect();
        rows.sort_by_key(|r| r.updated_at);
        let has_more = rows.len() > request.limit;
        rows.truncate(request.limit);

        let records: Vec<PullRecord> = rows
            .iter()
            .filter_map(|r| {
                r.ciphertext.as_ref().map(|ciphertext| PullRecord {
                    record_id: r.record_id.clone(),
                    record_type: r.record_type,
                    ciphertext: ciphertext.clone(),
                    version: r.version,
                    deleted: r.deleted,
                    updated_at: r.updated_at,
                })
            })
            .collect();
        let next_cursor = records.last().map(|r| r.updated_at).or(request.cursor);
        Ok(PullResponse {
            records,
            next_cursor,
            has_more,
        })
    }

    /// Plaintext-mode write, refused while any encrypted row remains.
    pub fn push_plaintext(
        &self,
        user_id: &str,
        writes: &[PlaintextWrite],
    ) -> Result<PlaintextPushResponse, ServerError> {
        let mut state = self.state.lock();
        if let Err(encrypted_rows) = mode::plaintext_gate(state.user_rows(user_id)) {
            info!(user_id, encrypted_rows, "plaintext sync blocked");
            return Ok(PlaintextPushResponse {
                success: false,
                encrypted_rows,
                results: Vec::new(),
            });
        }
        let mut results = Vec::with_capacity(writes.len());
        for write in writes {
            let row = state.plaintext_write(user_id, write)?;
            results.push(PushResult {
                record_id: row.record_id,
                version: row.version,
            });
        }
        Ok(PlaintextPushResponse {
            success: true,
            encrypted_rows: 0,
            results,
        })
    }

    /// Convert the given rows to plaintext, regardless of the block.
    pub fn revert_to_plaintext(
        &self,
        user_id: &str,
        writes: &[PlaintextWrite],
    ) -> Result<usize, ServerError> {
        let mut state = self.state.lock();
        for write in writes {
            state.plaintext_write(user_id, write)?;
        }
        info!(user_id, rows = writes.len(), "rows reverted to plaintext");
        Ok(writes.len())
    }

    pub fn count_encrypted_rows(&self, user_id: &str) -> usize {
        self.state
            .lock()
            .user_rows(user_id)
            .filter(|r| r.encrypted)
            .count()
    }

    pub fn delete_encrypted_rows(&self, user_id: &str) -> usize {
        let mut state = self.state.lock();
        let before = state.rows.len();
        state
            .rows
            .retain(|(user, _), row| user != user_id || !row.encrypted);
        let removed = before - state.rows.len();
        info!(user_id, removed, "encrypted rows deleted");
        removed
    }

    /// Raw write through the mode enforcer.
    pub fn write(&self, write: RowWrite) -> Result<ServerRow, ServerError> {
        self.state.lock().write(write)
    }

    pub fn row(&self, user_id: &str, record_id: &str) -> Option<ServerRow> {
        self.state
            .lock()
            .rows
            .get(&(user_id.to_string(), record_id.to_string()))
            .cloned()
    }

    pub fn rows(&self, user_id: &str) -> Vec<ServerRow> {
        self.state.lock().user_rows(user_id).cloned().collect()
    }

    pub fn get_envelope(&self, user_id: &str) -> Option<VaultEnvelope> {
        self.state.lock().envelopes.get(user_id).cloned()
    }

    /// Compare-and-swap on the envelope revision. A write must carry the
    /// stored revision plus one, and may not clear `usedAt` on a wrapper the
    /// stored envelope already spent. Repeating the stored envelope is a
    /// no-op.
    pub fn put_envelope(&self, user_id: &str, envelope: VaultEnvelope) -> Result<(), ServerError> {
        let mut state = self.state.lock();
        if let Some(stored) = state.envelopes.get(user_id) {
            if *stored == envelope {
                return Ok(());
            }
            if envelope.revision != stored.revision + 1 {
                debug!(user_id, stored = stored.revision, got = envelope.revision, "stale envelope refused");
                return Err(ServerError::EnvelopeConflict {
                    stored: stored.revision,
                    got: envelope.revision,
                });
            }
            for spent in stored.recovery_wrappers.iter().filter(|w| w.is_used()) {
                let revived = envelope
                    .recovery_wrappers
                    .iter()
                    .any(|w| w.id == spent.id && !w.is_used());
                if revived {
                    return Err(ServerError::SpentRecoveryCode(spent.id.clone()));
                }
            }
        }
        info!(user_id, revision = envelope.revision, "envelope stored");
        state.envelopes.insert(user_id.to_string(), envelope);
        Ok(())
    }

    pub fn delete_envelope(&self, user_id: &str) {
        self.state.lock().envelopes.remove(user_id);
    }
}
