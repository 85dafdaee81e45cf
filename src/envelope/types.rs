//! Vault envelope schema.
//!
//! Version 1 envelopes predate recovery wrappers; version 2 added them as
//! an optional field. New fields are additive and optional so older
//! envelopes stay valid without migration.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::types::WRAPPED_KEY_LENGTH;
use crate::crypto::KdfParams;
use crate::error::{Result, VaultError};

pub const ENVELOPE_VERSION: u32 = 2;
pub const SUPPORTED_ENVELOPE_VERSIONS: &[u32] = &[1, 2];

/// Argon2 refuses salts shorter than this.
const MIN_SALT_LENGTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultEnvelope {
    #[serde(with = "crate::encoding::base64_bytes")]
    pub wrapped_key: Vec<u8>,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub salt: Vec<u8>,
    pub kdf_params: KdfParams,
    /// Schema version of this structure. Not a key generation.
    pub version: u32,
    /// Bumped on every rewrite. The server only accepts the successor of
    /// the revision it stores.
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub recovery_wrappers: Vec<RecoveryWrapper>,
}

/// One recovery code's independent wrapping of the vault key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryWrapper {
    pub id: String,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub wrapped_key: Vec<u8>,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub salt: Vec<u8>,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub code_hash: Vec<u8>,
    pub used_at: Option<DateTime<Utc>>,
    /// Set when the envelope's parameters were raised after this wrapper
    /// was written. `None` means the envelope's `kdfParams` apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kdf_params: Option<KdfParams>,
}

impl RecoveryWrapper {
    pub fn is_used(&self) -> bool {
        self.used_at.is_some()
    }
}

impl VaultEnvelope {
    pub fn from_json(json: &str) -> Result<Self> {
        let envelope: VaultEnvelope = serde_json::from_str(json)?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Structural checks. Says nothing about whether any secret unwraps it.
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_ENVELOPE_VERSIONS.contains(&self.version) {
            return Err(VaultError::UnsupportedEnvelopeVersion(self.version));
        }
        if self.wrapped_key.len() != WRAPPED_KEY_LENGTH {
            return Err(VaultError::InvalidEnvelope(format!(
                "wrappedKey is {} bytes, expected {WRAPPED_KEY_LENGTH}",
                self.wrapped_key.len()
            )));
        }
        if self.salt.len() < MIN_SALT_LENGTH {
            return Err(VaultError::InvalidEnvelope("salt too short".to_string()));
        }
        let mut ids = HashSet::new();
        for wrapper in &self.recovery_wrappers {
            if !ids.insert(wrapper.id.as_str()) {
                return Err(VaultError::InvalidEnvelope(format!(
                    "duplicate recovery wrapper id {}",
                    wrapper.id
                )));
            }
            if wrapper.wrapped_key.len() != WRAPPED_KEY_LENGTH
                || wrapper.code_hash.len() != 32
                || wrapper.salt.len() < MIN_SALT_LENGTH
            {
                return Err(VaultError::InvalidEnvelope(format!(
                    "malformed recovery wrapper {}",
                    wrapper.id
                )));
            }
        }
        Ok(())
    }

    /// Recovery codes that can still unlock the vault.
    pub fn unused_recovery_codes(&self) -> usize {
        self.recovery_wrappers.iter().filter(|w| !w.is_used()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::base64_encode;

    fn v1_json() -> String {
        format!(
            r#"{{"wrappedKey":"{}","salt":"{}","kdfParams":{{"algorithm":"argon2id","iterations":3,"hashFn":"blake2b","derivedKeyBits":256}},"version":1}}"#,
            base64_encode(&[7u8; 40]),
            base64_encode(&[1u8; 16])
        )
    }

    #[test]
    fn version_one_envelope_still_loads() {
        let envelope = VaultEnvelope::from_json(&v1_json()).unwrap();
        assert_eq!(envelope.version, 1);
        assert!(envelope.recovery_wrappers.is_empty());
        assert_eq!(envelope.unused_recovery_codes(), 0);
        assert_eq!(envelope.revision, 0);
    }

    #[test]
    fn unknown_version_rejected() {
        let json = v1_json().replace(r#""version":1"#, r#""version":9"#);
        assert!(matches!(
            VaultEnvelope::from_json(&json),
            Err(VaultError::UnsupportedEnvelopeVersion(9))
        ));
    }

    #[test]
    fn bad_wrapped_key_length_rejected() {
        let json = v1_json().replace(&base64_encode(&[7u8; 40]), &base64_encode(&[7u8; 32]));
        assert!(matches!(
            VaultEnvelope::from_json(&json),
            Err(VaultError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn json_uses_camel_case_and_base64() {
        let envelope = VaultEnvelope::from_json(&v1_json()).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert!(value["wrappedKey"].is_string());
        assert!(value["kdfParams"]["derivedKeyBits"].is_number());
        assert!(value["recoveryWrappers"].is_array());
    }
}
