//! The server's single records table, shared by plaintext and encrypted
//! sync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::RecordType;

/// One row. Exactly one of `data` / `ciphertext` is set, matching
/// `encrypted`. Rows are only built through [`crate::server::mode::enforce`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRow {
    pub user_id: String,
    pub record_id: String,
    pub record_type: RecordType,
    pub encrypted: bool,
    pub data: Option<Value>,
    #[serde(with = "crate::encoding::base64_opt", default)]
    pub ciphertext: Option<Vec<u8>>,
    pub version: i64,
    pub deleted: bool,
    pub updated_at: DateTime<Utc>,
}

impl ServerRow {
    /// `encrypted ⇒ ciphertext ∧ ¬data`, `¬encrypted ⇒ data ∧ ¬ciphertext`.
    pub fn satisfies_mode_invariant(&self) -> bool {
        if self.encrypted {
            self.ciphertext.as_ref().is_some_and(|c| !c.is_empty()) && self.data.is_none()
        } else {
            self.data.as_ref().is_some_and(|d| !d.is_null()) && self.ciphertext.is_none()
        }
    }
}
