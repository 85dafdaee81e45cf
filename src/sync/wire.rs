//! JSON wire messages for push, pull and plaintext writes.
//!
//! Binary fields travel as standard base64. Timestamps are RFC 3339.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::SealedBlob;
use crate::error::{Result, VaultError};
use crate::records::RemoteVersion;
use crate::storage::{OutboxOperation, RecordType};

// ============================================================================
// Push
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushOperation {
    pub record_id: String,
    pub record_type: RecordType,
    pub base_version: Option<i64>,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub ciphertext: Vec<u8>,
    pub deleted: bool,
}

impl From<&OutboxOperation> for PushOperation {
    fn from(op: &OutboxOperation) -> Self {
        Self {
            record_id: op.record_id.clone(),
            record_type: op.record_type,
            base_version: op.base_version,
            ciphertext: op.ciphertext.clone(),
            deleted: op.deleted,
        }
    }
}

/// At most [`crate::config::MAX_PUSH_BATCH`] operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub operations: Vec<PushOperation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResult {
    pub record_id: String,
    pub version: i64,
}

/// The server's side of a rejected push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushConflict {
    pub record_id: String,
    pub base_version: Option<i64>,
    /// `0` when the server holds no row for this id.
    pub current_version: i64,
    /// `None` when the server row is missing or stored in plaintext.
    #[serde(with = "crate::encoding::base64_opt", default)]
    pub current_ciphertext: Option<Vec<u8>>,
    #[serde(default)]
    pub current_deleted: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

/// `success == false` is the HTTP 409 response; accepted operations in the
/// same batch are still listed in `results`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub success: bool,
    #[serde(default)]
    pub results: Vec<PushResult>,
    #[serde(default)]
    pub conflicts: Vec<PushConflict>,
}

impl PushResponse {
    pub fn status_code(&self) -> u16 {
        if self.success {
            200
        } else {
            409
        }
    }
}

// ============================================================================
// Pull
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub cursor: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl PullRequest {
    /// `?cursor=<ISO8601>&limit=<n>`
    pub fn query_string(&self) -> String {
        match &self.cursor {
            Some(cursor) => format!(
                "cursor={}&limit={}",
                cursor.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
                self.limit
            ),
            None => format!("limit={}", self.limit),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRecord {
    pub record_id: String,
    pub record_type: RecordType,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub ciphertext: Vec<u8>,
    pub version: i64,
    pub deleted: bool,
    pub updated_at: DateTime<Utc>,
}

impl PullRecord {
    pub fn to_remote(&self) -> Result<RemoteVersion> {
        let blob = SealedBlob::from_bytes(&self.ciphertext).map_err(|e| {
            VaultError::Protocol(format!("pulled record {}: {e}", self.record_id))
        })?;
        if self.version < 1 {
            return Err(VaultError::Protocol(format!(
                "pulled record {} has version {}",
                self.record_id, self.version
            )));
        }
        Ok(RemoteVersion {
            record_id: self.record_id.clone(),
            record_type: self.record_type,
            blob,
            version: self.version,
            deleted: self.deleted,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub records: Vec<PullRecord>,
    pub next_cursor: Option<DateTime<Utc>>,
    pub has_more: bool,
}

// ============================================================================
// Plaintext mode
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaintextWrite {
    pub record_id: String,
    pub record_type: RecordType,
    pub data: Value,
    pub deleted: bool,
}

/// `success == false` with `encryptedRows > 0` means the plaintext session
/// is blocked until the user reverts or deletes the encrypted rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaintextPushResponse {
    pub success: bool,
    #[serde(default)]
    pub encrypted_rows: usize,
    #[serde(default)]
    pub results: Vec<PushResult>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn push_request_json_shape() {
        let request = PushRequest {
            operations: vec![PushOperation {
                record_id: "r1".to_string(),
                record_type: RecordType::Bookmark,
                base_version: None,
                ciphertext: vec![0xde, 0xad],
                deleted: false,
            }],
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({"operations": [{
                "recordId": "r1",
                "recordType": "bookmark",
                "baseVersion": null,
                "ciphertext": "3q0=",
                "deleted": false
            }]})
        );
    }

    #[test]
    fn conflict_response_parses() {
        let body = json!({
            "success": false,
            "results": [{"recordId": "a", "version": 2}],
            "conflicts": [{
                "recordId": "b",
                "baseVersion": 3,
                "currentVersion": 4,
                "currentCiphertext": "AQID",
                "updatedAt": "2026-01-01T00:00:00Z"
            }]
        });
        let response: PushResponse = serde_json::from_value(body).unwrap();
        assert_eq!(response.status_code(), 409);
        assert_eq!(response.conflicts[0].current_ciphertext, Some(vec![1, 2, 3]));
        assert!(!response.conflicts[0].current_deleted);
    }

    #[test]
    fn pull_record_with_bad_blob_is_protocol_error() {
        let record = PullRecord {
            record_id: "r".to_string(),
            record_type: RecordType::View,
            ciphertext: vec![1, 2],
            version: 1,
            deleted: false,
            updated_at: Utc::now(),
        };
        assert!(matches!(record.to_remote(), Err(VaultError::Protocol(_))));
    }

    #[test]
    fn query_string_uses_utc_cursor() {
        let request = PullRequest {
            cursor: None,
            limit: 10,
        };
        assert_eq!(request.query_string(), "limit=10");
        let request = PullRequest {
            cursor: Some(DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().into()),
            limit: 5,
        };
        assert_eq!(
            request.query_string(),
            "cursor=2026-01-01T00:00:00.000000000Z&limit=5"
        );
    }
}
