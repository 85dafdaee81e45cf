//! Key hierarchy operations: create, unlock, recover, rotate.
//!
//! The vault key is generated once and never changes. Passphrase rotation
//! and recovery only re-wrap it, so no record is ever re-encrypted.

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::config::VaultConfig;
use crate::crypto::{
    derive_key, random_bytes, unwrap_key, wrap_key, KdfParams, VaultKey, SALT_LENGTH,
};
use crate::envelope::recovery_code::RecoveryCode;
use crate::envelope::types::{RecoveryWrapper, VaultEnvelope, ENVELOPE_VERSION};
use crate::error::{Result, VaultError};

/// Result of [`EnvelopeManager::create`]. The codes are shown once and
/// never stored.
#[derive(Debug)]
pub struct CreatedEnvelope {
    pub envelope: VaultEnvelope,
    pub vault_key: VaultKey,
    pub recovery_codes: Vec<RecoveryCode>,
}

/// A vault key recovered through a recovery code, plus the wrapper it came
/// from so the caller can mark it spent.
#[derive(Debug)]
pub struct RecoveredKey {
    pub vault_key: VaultKey,
    pub wrapper_id: String,
}

#[derive(Debug, Clone)]
pub struct EnvelopeManager {
    kdf: KdfParams,
    min_kdf: KdfParams,
    recovery_code_count: usize,
    min_passphrase_len: usize,
}

impl EnvelopeManager {
    pub fn new(config: &VaultConfig) -> Self {
        Self {
            kdf: config.kdf.clone(),
            min_kdf: config.min_kdf.clone(),
            recovery_code_count: config.recovery_code_count,
            min_passphrase_len: config.min_passphrase_len,
        }
    }

    pub fn check_passphrase(&self, passphrase: &str) -> Result<()> {
        if passphrase.chars().count() < self.min_passphrase_len {
            return Err(VaultError::WeakPassphrase {
                min: self.min_passphrase_len,
            });
        }
        Ok(())
    }

    /// Generate a fresh vault key, wrap it under `passphrase`, and add one
    /// wrapper per recovery code.
    pub fn create(&self, passphrase: &str) -> Result<CreatedEnvelope> {
        self.check_passphrase(passphrase)?;
        if !self.kdf.meets_floor(&self.min_kdf) {
            return Err(VaultError::KdfParamsTooWeak);
        }
        let vault_key = VaultKey::generate()?;
        let salt = random_bytes(SALT_LENGTH)?;
        let wrapping_key = derive_key(passphrase.as_bytes(), &salt, &self.kdf)?;
        let wrapped_key = wrap_key(&vault_key, &wrapping_key)?.to_vec();

        let (recovery_wrappers, recovery_codes) = self.recovery_set(&vault_key)?;
        let envelope = VaultEnvelope {
            wrapped_key,
            salt,
            kdf_params: self.kdf.clone(),
            version: ENVELOPE_VERSION,
            revision: 1,
            recovery_wrappers,
        };
        info!(
            recovery_codes = recovery_codes.len(),
            "created vault envelope"
        );
        Ok(CreatedEnvelope {
            envelope,
            vault_key,
            recovery_codes,
        })
    }

    /// Unwrap the vault key with the passphrase.
    pub fn unlock(&self, envelope: &VaultEnvelope, passphrase: &str) -> Result<VaultKey> {
        envelope.validate()?;
        if !envelope.kdf_params.meets_floor(&self.min_kdf) {
            return Err(VaultError::KdfParamsTooWeak);
        }
        let wrapping_key = derive_key(passphrase.as_bytes(), &envelope.salt, &envelope.kdf_params)?;
        let key = unwrap_key(&envelope.wrapped_key, &wrapping_key)?;
        debug!("vault key unwrapped with passphrase");
        Ok(key)
    }

    /// Unwrap the vault key with a recovery code. Does not mark the code
    /// used; that happens once a new passphrase has been set.
    pub fn unlock_with_recovery_code(
        &self,
        envelope: &VaultEnvelope,
        code: &RecoveryCode,
    ) -> Result<RecoveredKey> {
        envelope.validate()?;
        let matches: Vec<&RecoveryWrapper> = envelope
            .recovery_wrappers
            .iter()
            .filter(|w| code.hash_with_salt(&w.salt).as_slice() == w.code_hash.as_slice())
            .collect();
        let wrapper = match matches.as_slice() {
            [] => return Err(VaultError::AuthenticationFailure),
            [one] => *one,
            _ => return Err(VaultError::AmbiguousRecoveryCode),
        };
        if wrapper.is_used() {
            return Err(VaultError::RecoveryCodeAlreadyUsed);
        }
        let params = wrapper.kdf_params.as_ref().unwrap_or(&envelope.kdf_params);
        if !params.meets_floor(&self.min_kdf) {
            return Err(VaultError::KdfParamsTooWeak);
        }
        let wrapping_key = derive_key(code.normalized().as_bytes(), &wrapper.salt, params)?;
        let vault_key = unwrap_key(&wrapper.wrapped_key, &wrapping_key)?;
        debug!(wrapper_id = %wrapper.id, "vault key unwrapped with recovery code");
        Ok(RecoveredKey {
            vault_key,
            wrapper_id: wrapper.id.clone(),
        })
    }

    /// Re-wrap the unchanged vault key under a new passphrase and fresh
    /// salt. Recovery wrappers are carried over.
    pub fn rotate_passphrase(
        &self,
        envelope: &VaultEnvelope,
        vault_key: &VaultKey,
        new_passphrase: &str,
    ) -> Result<VaultEnvelope> {
        self.check_passphrase(new_passphrase)?;
        let salt = random_bytes(SALT_LENGTH)?;
        let wrapping_key = derive_key(new_passphrase.as_bytes(), &salt, &self.kdf)?;
        let wrapped_key = wrap_key(vault_key, &wrapping_key)?.to_vec();

        let mut recovery_wrappers = envelope.recovery_wrappers.clone();
        if self.kdf != envelope.kdf_params {
            // Existing wrappers were derived with the old parameters.
            for wrapper in &mut recovery_wrappers {
                if wrapper.kdf_params.is_none() {
                    wrapper.kdf_params = Some(envelope.kdf_params.clone());
                }
            }
        }
        Ok(VaultEnvelope {
            wrapped_key,
            salt,
            kdf_params: self.kdf.clone(),
            version: ENVELOPE_VERSION,
            revision: envelope.revision + 1,
            recovery_wrappers,
        })
    }

    /// Rotate to `new_passphrase` and mark the recovery wrapper spent.
    pub fn complete_recovery(
        &self,
        envelope: &VaultEnvelope,
        recovered: &RecoveredKey,
        new_passphrase: &str,
        now: DateTime<Utc>,
    ) -> Result<VaultEnvelope> {
        let mut rotated = self.rotate_passphrase(envelope, &recovered.vault_key, new_passphrase)?;
        let wrapper = rotated
            .recovery_wrappers
            .iter_mut()
            .find(|w| w.id == recovered.wrapper_id)
            .ok_or_else(|| {
                VaultError::InvalidEnvelope(format!(
                    "recovery wrapper {} disappeared",
                    recovered.wrapper_id
                ))
            })?;
        wrapper.used_at = Some(now);
        info!(wrapper_id = %recovered.wrapper_id, "recovery code spent");
        Ok(rotated)
    }

    /// Replace every recovery wrapper with a new set. Requires the current
    /// passphrase; old codes stop working immediately.
    pub fn regenerate_recovery_codes(
        &self,
        envelope: &VaultEnvelope,
        passphrase: &str,
    ) -> Result<(VaultEnvelope, Vec<RecoveryCode>)> {
        let vault_key = self.unlock(envelope, passphrase)?;
        let (recovery_wrappers, codes) = self.recovery_set(&vault_key)?;
        let mut updated = envelope.clone();
        updated.version = ENVELOPE_VERSION;
        updated.revision = envelope.revision + 1;
        updated.recovery_wrappers = recovery_wrappers;
        info!(recovery_codes = codes.len(), "regenerated recovery codes");
        Ok((updated, codes))
    }

    fn recovery_set(&self, vault_key: &VaultKey) -> Result<(Vec<RecoveryWrapper>, Vec<RecoveryCode>)> {
        let mut wrappers = Vec::with_capacity(self.recovery_code_count);
        let mut codes = Vec::with_capacity(self.recovery_code_count);
        for _ in 0..self.recovery_code_count {
            let code = RecoveryCode::generate()?;
            let salt = random_bytes(SALT_LENGTH)?;
            let secret = Zeroizing::new(code.normalized().as_bytes().to_vec());
            let wrapping_key = derive_key(&secret, &salt, &self.kdf)?;
            wrappers.push(RecoveryWrapper {
                id: uuid::Uuid::new_v4().to_string(),
                wrapped_key: wrap_key(vault_key, &wrapping_key)?.to_vec(),
                code_hash: code.hash_with_salt(&salt).to_vec(),
                salt,
                used_at: None,
                kdf_params: None,
            });
            codes.push(code);
        }
        Ok((wrappers, codes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap() -> KdfParams {
        KdfParams::argon2id(1, 64, 1)
    }

    fn manager() -> EnvelopeManager {
        EnvelopeManager::new(&VaultConfig {
            kdf: cheap(),
            min_kdf: cheap(),
            recovery_code_count: 3,
            ..VaultConfig::default()
        })
    }

    #[test]
    fn passphrase_unlocks_created_envelope() {
        let m = manager();
        let created = m.create("correct horse").unwrap();
        assert_eq!(created.recovery_codes.len(), 3);
        assert_eq!(created.envelope.recovery_wrappers.len(), 3);
        let key = m.unlock(&created.envelope, "correct horse").unwrap();
        assert_eq!(key, created.vault_key);
    }

    #[test]
    fn wrong_passphrase_is_authentication_failure() {
        let m = manager();
        let created = m.create("correct horse").unwrap();
        assert!(matches!(
            m.unlock(&created.envelope, "wrong horse"),
            Err(VaultError::AuthenticationFailure)
        ));
    }

    #[test]
    fn short_passphrase_rejected() {
        assert!(matches!(
            manager().create("short"),
            Err(VaultError::WeakPassphrase { min: 8 })
        ));
    }

    #[test]
    fn every_recovery_code_unwraps_the_same_key() {
        let m = manager();
        let created = m.create("correct horse").unwrap();
        for code in &created.recovery_codes {
            let recovered = m.unlock_with_recovery_code(&created.envelope, code).unwrap();
            assert_eq!(recovered.vault_key, created.vault_key);
        }
    }

    #[test]
    fn unknown_recovery_code_fails() {
        let m = manager();
        let created = m.create("correct horse").unwrap();
        let stranger = RecoveryCode::generate().unwrap();
        assert!(matches!(
            m.unlock_with_recovery_code(&created.envelope, &stranger),
            Err(VaultError::AuthenticationFailure)
        ));
    }

    #[test]
    fn spent_code_is_rejected() {
        let m = manager();
        let created = m.create("correct horse").unwrap();
        let code = &created.recovery_codes[1];
        let recovered = m.unlock_with_recovery_code(&created.envelope, code).unwrap();
        let envelope = m
            .complete_recovery(&created.envelope, &recovered, "new passphrase", Utc::now())
            .unwrap();
        assert_eq!(envelope.unused_recovery_codes(), 2);
        let err = m.unlock_with_recovery_code(&envelope, code).unwrap_err();
        assert!(matches!(err, VaultError::RecoveryCodeAlreadyUsed));
        assert!(err.is_authentication_failure());
        assert_eq!(
            m.unlock(&envelope, "new passphrase").unwrap(),
            created.vault_key
        );
    }

    #[test]
    fn duplicate_hash_is_ambiguous() {
        let m = manager();
        let created = m.create("correct horse").unwrap();
        let mut envelope = created.envelope.clone();
        let mut twin = envelope.recovery_wrappers[0].clone();
        twin.id = "twin".to_string();
        envelope.recovery_wrappers.push(twin);
        assert!(matches!(
            m.unlock_with_recovery_code(&envelope, &created.recovery_codes[0]),
            Err(VaultError::AmbiguousRecoveryCode)
        ));
    }

    #[test]
    fn rotation_keeps_key_and_changes_salt() {
        let m = manager();
        let created = m.create("correct horse").unwrap();
        let rotated = m
            .rotate_passphrase(&created.envelope, &created.vault_key, "battery staple")
            .unwrap();
        assert_ne!(rotated.salt, created.envelope.salt);
        assert!(m.unlock(&rotated, "correct horse").is_err());
        assert_eq!(m.unlock(&rotated, "battery staple").unwrap(), created.vault_key);
        assert_eq!(rotated.recovery_wrappers, created.envelope.recovery_wrappers);
        assert_eq!(created.envelope.revision, 1);
        assert_eq!(rotated.revision, 2);
    }

    #[test]
    fn raised_kdf_keeps_old_recovery_codes_working() {
        let m = manager();
        let created = m.create("correct horse").unwrap();
        let stronger = EnvelopeManager::new(&VaultConfig {
            kdf: KdfParams::argon2id(2, 64, 1),
            min_kdf: cheap(),
            recovery_code_count: 3,
            ..VaultConfig::default()
        });
        let rotated = stronger
            .rotate_passphrase(&created.envelope, &created.vault_key, "battery staple")
            .unwrap();
        assert!(rotated.recovery_wrappers.iter().all(|w| w.kdf_params == Some(cheap())));
        let recovered = stronger
            .unlock_with_recovery_code(&rotated, &created.recovery_codes[0])
            .unwrap();
        assert_eq!(recovered.vault_key, created.vault_key);
    }

    #[test]
    fn regenerate_invalidates_old_codes() {
        let m = manager();
        let created = m.create("correct horse").unwrap();
        let (envelope, codes) = m
            .regenerate_recovery_codes(&created.envelope, "correct horse")
            .unwrap();
        assert_eq!(codes.len(), 3);
        assert_eq!(envelope.revision, created.envelope.revision + 1);
        assert!(m
            .unlock_with_recovery_code(&envelope, &created.recovery_codes[0])
            .is_err());
        assert_eq!(
            m.unlock_with_recovery_code(&envelope, &codes[0]).unwrap().vault_key,
            created.vault_key
        );
    }

    #[test]
    fn regenerate_requires_passphrase() {
        let m = manager();
        let created = m.create("correct horse").unwrap();
        assert!(matches!(
            m.regenerate_recovery_codes(&created.envelope, "nope nope"),
            Err(VaultError::AuthenticationFailure)
        ));
    }

    #[test]
    fn envelope_below_floor_is_refused() {
        let m = manager();
        let created = m.create("correct horse").unwrap();
        let strict = EnvelopeManager::new(&VaultConfig {
            kdf: cheap(),
            min_kdf: KdfParams::argon2id(4, 64, 1),
            ..VaultConfig::default()
        });
        assert!(matches!(
            strict.unlock(&created.envelope, "correct horse"),
            Err(VaultError::KdfParamsTooWeak)
        ));
    }
}
