//! Rows persisted on the client: encrypted records and pending outbox
//! operations.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::SealedBlob;

/// Kinds of user record carried by the vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    Bookmark,
    Collection,
    View,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Bookmark => "bookmark",
            RecordType::Collection => "collection",
            RecordType::View => "view",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bookmark" => Ok(RecordType::Bookmark),
            "collection" => Ok(RecordType::Collection),
            "view" => Ok(RecordType::View),
            other => Err(format!("unknown record type \"{other}\"")),
        }
    }
}

/// One encrypted record as held locally.
///
/// `version` increases by exactly one per accepted write; `deleted` marks a
/// tombstone that keeps its last ciphertext.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub record_id: String,
    pub record_type: RecordType,
    pub blob: SealedBlob,
    pub version: i64,
    /// Last version the server acknowledged. `None` until first sync.
    pub server_version: Option<i64>,
    pub deleted: bool,
    /// Local-only pointer to an unresolved conflict copy.
    pub conflict_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A local mutation waiting to be pushed.
///
/// At most one exists per `record_id`; `ciphertext` is the sealed blob in
/// wire form.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxOperation {
    pub id: String,
    pub record_id: String,
    pub record_type: RecordType,
    /// `None` means the record is believed new on the server.
    pub base_version: Option<i64>,
    pub ciphertext: Vec<u8>,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub retries: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
}
