//! Mode invariant enforcer.
//!
//! Every write to the server table goes through [`enforce`], which builds
//! the row from scratch for the write's mode. A row flipping between modes
//! therefore never keeps the other mode's payload.

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::server::row::ServerRow;
use crate::storage::RecordType;

#[derive(Debug, Clone, PartialEq)]
pub enum RowPayload {
    Plaintext(Value),
    Encrypted(Vec<u8>),
}

impl RowPayload {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, RowPayload::Encrypted(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowWrite {
    pub user_id: String,
    pub record_id: String,
    pub record_type: RecordType,
    pub payload: RowPayload,
    pub version: i64,
    pub deleted: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModeViolation {
    #[error("plaintext write for {0} has null data")]
    NullData(String),
    #[error("encrypted write for {0} has empty ciphertext")]
    EmptyCiphertext(String),
}

/// Build the row a write produces. `previous` is only used to log flips.
pub fn enforce(previous: Option<&ServerRow>, write: RowWrite) -> Result<ServerRow, ModeViolation> {
    let (encrypted, data, ciphertext) = match write.payload {
        RowPayload::Plaintext(Value::Null) => return Err(ModeViolation::NullData(write.record_id)),
        RowPayload::Plaintext(data) => (false, Some(data), None),
        RowPayload::Encrypted(ciphertext) if ciphertext.is_empty() => {
            return Err(ModeViolation::EmptyCiphertext(write.record_id))
        }
        RowPayload::Encrypted(ciphertext) => (true, None, Some(ciphertext)),
    };
    if let Some(previous) = previous {
        if previous.encrypted != encrypted {
            debug!(
                record_id = %write.record_id,
                encrypted,
                "row changes sync mode"
            );
        }
    }
    let row = ServerRow {
        user_id: write.user_id,
        record_id: write.record_id,
        record_type: write.record_type,
        encrypted,
        data,
        ciphertext,
        version: write.version,
        deleted: write.deleted,
        updated_at: write.updated_at,
    };
    debug_assert!(row.satisfies_mode_invariant());
    Ok(row)
}

/// Gate for a plaintext-mode session: refused while any encrypted row
/// remains. Returns the number of blocking rows.
pub fn plaintext_gate<'a>(rows: impl IntoIterator<Item = &'a ServerRow>) -> Result<(), usize> {
    let encrypted = rows.into_iter().filter(|r| r.encrypted).count();
    if encrypted > 0 {
        Err(encrypted)
    } else {
        Ok(())
    }
}
