//! Local persistence of the envelope in the storage meta table.

use std::sync::Arc;

use crate::envelope::types::VaultEnvelope;
use crate::error::Result;
use crate::storage::VaultStorage;

const ENVELOPE_META_KEY: &str = "vault.envelope";
const PENDING_UPLOAD_META_KEY: &str = "vault.envelope.pendingUpload";
const MIRRORED_META_KEY: &str = "vault.envelope.mirrored";

#[derive(Clone)]
pub struct EnvelopeStore {
    storage: Arc<dyn VaultStorage>,
}

impl EnvelopeStore {
    pub fn new(storage: Arc<dyn VaultStorage>) -> Self {
        Self { storage }
    }

    pub fn load(&self) -> Result<Option<VaultEnvelope>> {
        match self.storage.get_meta(ENVELOPE_META_KEY)? {
            Some(json) => Ok(Some(VaultEnvelope::from_json(&json)?)),
            None => Ok(None),
        }
    }

    pub fn save(&self, envelope: &VaultEnvelope) -> Result<()> {
        envelope.validate()?;
        self.storage.set_meta(ENVELOPE_META_KEY, &envelope.to_json()?)?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.storage.delete_meta(ENVELOPE_META_KEY)?;
        self.storage.delete_meta(PENDING_UPLOAD_META_KEY)?;
        self.storage.delete_meta(MIRRORED_META_KEY)?;
        Ok(())
    }

    /// The local envelope matches what the server holds.
    pub fn mark_mirrored(&self) -> Result<()> {
        self.storage.set_meta(MIRRORED_META_KEY, "1")?;
        self.storage.delete_meta(PENDING_UPLOAD_META_KEY)?;
        Ok(())
    }

    /// The server has held an envelope for this vault at some point. If it
    /// later has none, the vault was disabled elsewhere.
    pub fn was_mirrored(&self) -> Result<bool> {
        Ok(self.storage.get_meta(MIRRORED_META_KEY)?.is_some())
    }

    /// The local envelope changed while the server mirror could not be
    /// updated. The sync engine uploads it on its next cycle.
    pub fn set_pending_upload(&self, pending: bool) -> Result<()> {
        if pending {
            self.storage.set_meta(PENDING_UPLOAD_META_KEY, "1")?;
        } else {
            self.storage.delete_meta(PENDING_UPLOAD_META_KEY)?;
        }
        Ok(())
    }

    pub fn pending_upload(&self) -> Result<bool> {
        Ok(self.storage.get_meta(PENDING_UPLOAD_META_KEY)?.is_some())
    }
}
