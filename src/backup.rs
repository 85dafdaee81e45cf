//! Backup file: the envelope plus every stored row, still encrypted.
//!
//! ```json
//! {"version":1,"exportedAt":"…","vaultEnvelope":{…},"records":[…]}
//! ```
//!
//! Parsing validates the whole file before anything is written, so a
//! malformed import changes nothing.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::SealedBlob;
use crate::envelope::VaultEnvelope;
use crate::error::{Result, VaultError};
use crate::storage::{RecordType, StoredRecord};

pub const BACKUP_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportMode {
    /// Upsert by record id, keeping whichever side has the higher version.
    Merge,
    /// Wipe local vault data, then import.
    Replace,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: usize,
    /// Rows where the local copy was at the same or a newer version.
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupFile {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub vault_envelope: VaultEnvelope,
    pub records: Vec<BackupRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub record_id: String,
    pub record_type: RecordType,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub tag: Vec<u8>,
    pub version: i64,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&StoredRecord> for BackupRecord {
    fn from(stored: &StoredRecord) -> Self {
        Self {
            record_id: stored.record_id.clone(),
            record_type: stored.record_type,
            iv: stored.blob.iv.to_vec(),
            ciphertext: stored.blob.ciphertext.clone(),
            tag: stored.blob.tag.to_vec(),
            version: stored.version,
            deleted: stored.deleted,
            created_at: stored.created_at,
            updated_at: stored.updated_at,
        }
    }
}

impl BackupRecord {
    fn to_stored(&self) -> Result<StoredRecord> {
        if self.record_id.is_empty() {
            return Err(invalid("record with empty recordId"));
        }
        if self.version < 1 {
            return Err(invalid(format!(
                "record {} has version {}",
                self.record_id, self.version
            )));
        }
        let blob = SealedBlob::from_parts(&self.iv, self.ciphertext.clone(), &self.tag)
            .map_err(|_| invalid(format!("record {} has a malformed iv or tag", self.record_id)))?;
        Ok(StoredRecord {
            record_id: self.record_id.clone(),
            record_type: self.record_type,
            blob,
            version: self.version,
            // Pushed with the backup's version as the base.
            server_version: Some(self.version),
            deleted: self.deleted,
            conflict_ref: None,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn invalid(message: impl Into<String>) -> VaultError {
    VaultError::InvalidBackupFormat(message.into())
}

/// A backup that passed every structural check.
#[derive(Debug, Clone)]
pub struct ValidatedBackup {
    pub envelope: VaultEnvelope,
    pub records: Vec<StoredRecord>,
}

impl BackupFile {
    pub fn export(envelope: &VaultEnvelope, records: &[StoredRecord]) -> Self {
        Self {
            version: BACKUP_FORMAT_VERSION,
            exported_at: Utc::now(),
            vault_envelope: envelope.clone(),
            records: records.iter().map(BackupRecord::from).collect(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse and validate. Every failure is `InvalidBackupFormat`.
    pub fn parse(json: &str) -> Result<ValidatedBackup> {
        let file: BackupFile = serde_json::from_str(json).map_err(|e| invalid(e.to_string()))?;
        if file.version != BACKUP_FORMAT_VERSION {
            return Err(invalid(format!("unsupported backup version {}", file.version)));
        }
        file.vault_envelope
            .validate()
            .map_err(|e| invalid(format!("envelope: {e}")))?;

        let mut seen = HashSet::new();
        let mut records = Vec::with_capacity(file.records.len());
        for record in &file.records {
            if !seen.insert(record.record_id.as_str()) {
                return Err(invalid(format!("duplicate record {}", record.record_id)));
            }
            records.push(record.to_stored()?);
        }
        Ok(ValidatedBackup {
            envelope: file.vault_envelope,
            records,
        })
    }
}
