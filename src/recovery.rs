//! Recovery-code unlock.
//!
//! [`crate::vault::Vault::begin_recovery`] verifies the code and unwraps
//! the key, but the vault stays locked: the only way forward is
//! [`PendingRecovery::complete`] with a new passphrase. Completion re-wraps
//! the latest envelope, marks the code spent and persists it before the
//! session is unlocked. Dropping a `PendingRecovery` discards the key and
//! leaves the envelope untouched.

use chrono::Utc;
use tracing::info;

use crate::envelope::RecoveredKey;
use crate::error::{Result, VaultError};
use crate::vault::Vault;

#[must_use = "the vault stays locked until `complete` sets a new passphrase"]
pub struct PendingRecovery<'v> {
    vault: &'v Vault,
    recovered: RecoveredKey,
}

impl<'v> PendingRecovery<'v> {
    pub(crate) fn new(vault: &'v Vault, recovered: RecoveredKey) -> Self {
        Self { vault, recovered }
    }

    /// Id of the recovery wrapper that will be marked used.
    pub fn wrapper_id(&self) -> &str {
        &self.recovered.wrapper_id
    }

    /// Set `new_passphrase`, spend the code, persist, then unlock. On any
    /// error the vault stays locked and the code stays unspent.
    ///
    /// The code is checked again against the latest envelope, so a code
    /// spent or replaced on another device in the meantime fails here.
    pub async fn complete(self, new_passphrase: &str) -> Result<()> {
        let envelope = self.vault.latest_envelope().await?;
        match envelope
            .recovery_wrappers
            .iter()
            .find(|w| w.id == self.recovered.wrapper_id)
        {
            None => return Err(VaultError::AuthenticationFailure),
            Some(wrapper) if wrapper.is_used() => return Err(VaultError::RecoveryCodeAlreadyUsed),
            Some(_) => {}
        }
        let updated = self.vault.manager().complete_recovery(
            &envelope,
            &self.recovered,
            new_passphrase,
            Utc::now(),
        )?;
        self.vault.persist_envelope(&updated).await?;
        self.vault.session().unlock(self.recovered.vault_key.clone());
        info!(
            wrapper_id = %self.recovered.wrapper_id,
            unused_recovery_codes = updated.unused_recovery_codes(),
            "recovery complete"
        );
        self.vault.after_unlock();
        Ok(())
    }
}
