//! Collaborator-facing facade.
//!
//! UI code talks to the vault only through this type: enable, unlock and
//! lock, record mutations, sync triggers, passphrase and recovery-code
//! management, conflict resolution, backup, and a records-changed
//! subscription.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::backup::{BackupFile, ImportMode, ImportReport};
use crate::config::VaultConfig;
use crate::envelope::{EnvelopeManager, EnvelopeStore, RecoveryCode, VaultEnvelope};
use crate::error::{Result, VaultError};
use crate::notify::{Notifier, RecordsChanged, RecordsChangedCallback, Subscription};
use crate::outbox::Outbox;
use crate::recovery::PendingRecovery;
use crate::records::{self, RecordStore, VaultRecord};
use crate::session::VaultSession;
use crate::storage::{open_storage, StorageWarning, VaultStorage};
use crate::sync::{
    ConflictResolver, CycleOutcome, KeepSide, PlaintextWrite, SyncContext, SyncEngine,
    SyncScheduler, SyncStatus, SyncTransport,
};

/// Recovery codes, shown to the user once and never stored.
///
/// There is no server-side recovery: losing the passphrase and every one
/// of these codes makes the vault's contents permanently unreadable.
#[derive(Debug)]
pub struct RecoveryCodes(Vec<RecoveryCode>);

impl RecoveryCodes {
    pub fn codes(&self) -> &[RecoveryCode] {
        &self.0
    }

    /// `XXXX-XXXX-XXXX-XXXX` strings for display.
    pub fn to_display_strings(&self) -> Vec<String> {
        self.0.iter().map(ToString::to_string).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Result of [`Vault::disable`].
#[derive(Debug, Clone, PartialEq)]
pub struct DisableReport {
    /// Every record, decrypted, as now stored in plaintext on the server.
    pub records: Vec<VaultRecord>,
    pub converted: usize,
    /// Encrypted rows this device could not convert (never pulled or not
    /// decryptable). Plaintext sync stays blocked while this is non-zero.
    pub remaining_encrypted: usize,
}

pub struct Vault {
    manager: EnvelopeManager,
    envelopes: EnvelopeStore,
    session: Arc<VaultSession>,
    records: RecordStore,
    outbox: Outbox,
    engine: Arc<SyncEngine>,
    notifier: Arc<Notifier>,
    transport: Arc<dyn SyncTransport>,
    config: VaultConfig,
    storage_warning: Option<StorageWarning>,
    scheduler: Mutex<Option<SyncScheduler>>,
}

impl Vault {
    pub fn new(
        storage: Arc<dyn VaultStorage>,
        transport: Arc<dyn SyncTransport>,
        config: VaultConfig,
    ) -> Self {
        let session = Arc::new(VaultSession::new(&config.session));
        let outbox = Outbox::new(storage.clone(), config.outbox);
        let records = RecordStore::new(storage.clone(), session.clone(), outbox.clone());
        let envelopes = EnvelopeStore::new(storage.clone());
        let notifier = Notifier::new();
        let engine = Arc::new(SyncEngine::new(
            SyncContext {
                transport: transport.clone(),
                storage,
                records: records.clone(),
                outbox: outbox.clone(),
                session: session.clone(),
                envelopes: envelopes.clone(),
                notifier: notifier.clone(),
            },
            config.sync,
        ));
        Self {
            manager: EnvelopeManager::new(&config),
            envelopes,
            session,
            records,
            outbox,
            engine,
            notifier,
            transport,
            config,
            storage_warning: None,
            scheduler: Mutex::new(None),
        }
    }

    /// Open SQLite storage at `path`, falling back to memory with a
    /// warning (see [`Vault::storage_warning`]).
    pub fn open<P: AsRef<Path>>(
        path: P,
        transport: Arc<dyn SyncTransport>,
        config: VaultConfig,
    ) -> Self {
        let opened = open_storage(path);
        let mut vault = Self::new(opened.storage, transport, config);
        vault.storage_warning = opened.warning;
        vault
    }

    /// Set when vault data only lives in memory for this session.
    pub fn storage_warning(&self) -> Option<&StorageWarning> {
        self.storage_warning.as_ref()
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub(crate) fn manager(&self) -> &EnvelopeManager {
        &self.manager
    }

    pub(crate) fn session(&self) -> &VaultSession {
        &self.session
    }

    pub fn is_enabled(&self) -> Result<bool> {
        Ok(self.envelopes.load()?.is_some())
    }

    pub fn is_unlocked(&self) -> bool {
        self.session.is_unlocked()
    }

    // ========================================================================
    // Key lifecycle
    // ========================================================================

    /// Create the vault key and envelope, unlock, and return the recovery
    /// codes. Works offline; the envelope is uploaded on the next sync.
    pub async fn enable(&self, passphrase: &str) -> Result<RecoveryCodes> {
        if self.envelopes.load()?.is_some() {
            return Err(VaultError::AlreadyEnabled);
        }
        match self.transport.get_envelope().await {
            Ok(Some(_)) => return Err(VaultError::AlreadyEnabled),
            Ok(None) => {}
            Err(e) => {
                let e = VaultError::from(e);
                if !e.is_retryable() {
                    return Err(e);
                }
            }
        }
        let created = self.manager.create(passphrase)?;
        self.persist_envelope(&created.envelope).await?;
        self.session.unlock(created.vault_key);
        info!(
            recovery_codes = created.recovery_codes.len(),
            "vault enabled; without the passphrase or a recovery code the data cannot be recovered"
        );
        Ok(RecoveryCodes(created.recovery_codes))
    }

    /// Unwrap the vault key with the passphrase.
    pub async fn unlock(&self, passphrase: &str) -> Result<()> {
        let envelope = self.latest_envelope().await?;
        let key = self.manager.unlock(&envelope, passphrase)?;
        self.session.unlock(key);
        self.after_unlock();
        Ok(())
    }

    /// Verify a recovery code. The vault stays locked until the returned
    /// [`PendingRecovery`] is completed with a new passphrase.
    pub async fn begin_recovery(&self, code: &str) -> Result<PendingRecovery<'_>> {
        let code = RecoveryCode::parse(code)?;
        let envelope = self.latest_envelope().await?;
        let recovered = self.manager.unlock_with_recovery_code(&envelope, &code)?;
        Ok(PendingRecovery::new(self, recovered))
    }

    /// Drop the key. Safe at any time, including mid-sync.
    pub fn lock(&self) {
        self.session.lock();
    }

    /// Lock if the idle timeout has passed.
    pub fn lock_if_idle(&self, now: DateTime<Utc>) -> bool {
        self.session.lock_if_idle(now)
    }

    /// Re-wrap the vault key under a new passphrase. No record is touched.
    pub async fn rotate_passphrase(&self, current: &str, new_passphrase: &str) -> Result<()> {
        let envelope = self.latest_envelope().await?;
        let key = self.manager.unlock(&envelope, current)?;
        let rotated = self.manager.rotate_passphrase(&envelope, &key, new_passphrase)?;
        self.persist_envelope(&rotated).await?;
        info!("passphrase rotated");
        Ok(())
    }

    /// Replace every recovery code. Requires the passphrase.
    pub async fn regenerate_recovery_codes(&self, passphrase: &str) -> Result<RecoveryCodes> {
        let envelope = self.latest_envelope().await?;
        let (updated, codes) = self.manager.regenerate_recovery_codes(&envelope, passphrase)?;
        self.persist_envelope(&updated).await?;
        Ok(RecoveryCodes(codes))
    }

    /// Unused recovery codes left in the envelope.
    pub fn remaining_recovery_codes(&self) -> Result<usize> {
        let envelope = self.envelopes.load()?.ok_or(VaultError::NotEnabled)?;
        Ok(envelope.unused_recovery_codes())
    }

    /// The envelope every key operation starts from: the server's copy when
    /// it is reachable, the local one when it is not.
    pub(crate) async fn latest_envelope(&self) -> Result<VaultEnvelope> {
        if self.envelopes.load()?.is_none() {
            return match self.transport.get_envelope().await? {
                Some(envelope) => {
                    self.envelopes.save(&envelope)?;
                    self.envelopes.mark_mirrored()?;
                    info!("fetched envelope from server");
                    Ok(envelope)
                }
                None => Err(VaultError::NotEnabled),
            };
        }
        match self.engine.sync_envelope().await {
            Ok(Some(envelope)) => Ok(envelope),
            Ok(None) => Err(VaultError::NotEnabled),
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "server unreachable; using local envelope");
                self.envelopes.load()?.ok_or(VaultError::NotEnabled)
            }
            Err(e) => Err(e),
        }
    }

    /// Mirror to the server, then save locally. A network failure defers
    /// the upload to the next sync cycle; any other failure, including the
    /// server refusing a stale revision, saves nothing.
    pub(crate) async fn persist_envelope(&self, envelope: &VaultEnvelope) -> Result<()> {
        envelope.validate()?;
        let pending = match self.transport.put_envelope(envelope).await {
            Ok(()) => false,
            Err(e) => {
                let e = VaultError::from(e);
                if !e.is_retryable() {
                    return Err(e);
                }
                warn!(error = %e, "envelope upload deferred");
                true
            }
        };
        self.envelopes.save(envelope)?;
        if pending {
            self.envelopes.set_pending_upload(true)?;
        } else {
            self.envelopes.mark_mirrored()?;
        }
        Ok(())
    }

    /// Surface records stored while locked, and retry deferred conflicts.
    pub(crate) fn after_unlock(&self) {
        match self.records.get_all() {
            Ok(upserted) => self.notifier.publish(&RecordsChanged {
                upserted,
                deleted: Vec::new(),
            }),
            Err(e) => warn!(error = %e, "could not decrypt records after unlock"),
        }
        self.trigger_sync();
    }

    // ========================================================================
    // Records
    // ========================================================================

    /// Encrypt and store `record`, queue it, and request a sync.
    pub fn mutate(&self, record: VaultRecord) -> Result<VaultRecord> {
        self.session.touch();
        let stored = self.records.put(&record)?;
        let saved = VaultRecord {
            created_at: stored.created_at,
            updated_at: stored.updated_at,
            ..record
        };
        self.notifier.publish(&RecordsChanged {
            upserted: vec![saved.clone()],
            deleted: Vec::new(),
        });
        self.trigger_sync();
        Ok(saved)
    }

    /// Tombstone a record.
    pub fn delete(&self, record_id: &str) -> Result<()> {
        self.session.touch();
        // Deletes are a user action; keep them behind the unlock.
        self.session.key()?;
        self.records.mark_deleted(record_id)?;
        self.notifier.publish(&RecordsChanged {
            upserted: Vec::new(),
            deleted: vec![record_id.to_string()],
        });
        self.trigger_sync();
        Ok(())
    }

    pub fn get(&self, record_id: &str) -> Result<Option<VaultRecord>> {
        self.session.touch();
        self.records.get(record_id)
    }

    pub fn records(&self) -> Result<Vec<VaultRecord>> {
        self.session.touch();
        self.records.get_all()
    }

    /// Id of the conflict copy for `record_id`, if a conflict is open.
    pub fn conflict_for(&self, record_id: &str) -> Result<Option<String>> {
        Ok(self
            .records
            .get_stored(record_id)?
            .and_then(|stored| stored.conflict_ref))
    }

    /// Keep one side of a conflict; the other is deleted.
    pub fn resolve_conflict(&self, record_id: &str, keep: KeepSide) -> Result<()> {
        self.session.touch();
        let resolver = ConflictResolver::new(&self.records, &self.outbox, &self.session);
        let deleted = resolver.resolve_user_choice(record_id, keep)?;
        let kept = match keep {
            KeepSide::Original => Some(record_id.to_string()),
            KeepSide::Copy => None,
        };
        let mut changed = RecordsChanged {
            upserted: Vec::new(),
            deleted: vec![deleted],
        };
        if let Some(kept) = kept {
            if let Some(record) = self.records.get(&kept)? {
                changed.upserted.push(record);
            }
        }
        self.notifier.publish(&changed);
        self.trigger_sync();
        Ok(())
    }

    pub fn subscribe(&self, callback: RecordsChangedCallback) -> Subscription {
        self.notifier.subscribe(callback)
    }

    // ========================================================================
    // Sync
    // ========================================================================

    /// Start the background scheduler on the current tokio runtime.
    pub fn start_sync(&self) {
        let mut scheduler = self.scheduler.lock();
        if scheduler.is_none() {
            *scheduler = Some(SyncScheduler::spawn(
                self.engine.clone(),
                self.session.clone(),
                &self.config.sync,
            ));
        }
    }

    pub async fn stop_sync(&self) {
        let scheduler = self.scheduler.lock().take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await;
        }
    }

    /// Debounced sync request. No-op without a running scheduler.
    pub fn trigger_sync(&self) {
        if let Some(scheduler) = self.scheduler.lock().as_ref() {
            scheduler.request_sync();
        }
    }

    pub fn notify_reconnect(&self) {
        if let Some(scheduler) = self.scheduler.lock().as_ref() {
            scheduler.notify_reconnect();
        }
    }

    /// Run a cycle now. Returns `AlreadyRunning` if one is in flight.
    pub async fn sync_now(&self) -> Result<CycleOutcome> {
        self.engine.run_cycle().await
    }

    pub fn status(&self) -> SyncStatus {
        self.engine.status()
    }

    pub fn pending_count(&self) -> Result<usize> {
        self.engine.pending_count()
    }

    // ========================================================================
    // Mode transitions
    // ========================================================================

    /// Turn the vault off: decrypt every record, rewrite the server rows
    /// in plaintext, drop the server envelope and clear local vault state.
    pub async fn disable(&self) -> Result<DisableReport> {
        let key = self.session.key()?;
        match self.engine.run_cycle().await? {
            CycleOutcome::AlreadyRunning => return Err(VaultError::SyncInProgress),
            CycleOutcome::Completed(report) if report.failed > 0 => {
                return Err(VaultError::NetworkFailure(
                    "cannot reach the server to convert records".to_string(),
                ))
            }
            CycleOutcome::Completed(_) => {}
        }

        let stored = self.records.scan()?;
        let mut writes = Vec::with_capacity(stored.len());
        let mut live = Vec::new();
        for row in &stored {
            let record = records::open(&key, row)?;
            writes.push(PlaintextWrite {
                record_id: row.record_id.clone(),
                record_type: row.record_type,
                data: record.data.clone(),
                deleted: row.deleted,
            });
            if !row.deleted {
                live.push(record);
            }
        }

        let converted = self.transport.revert_to_plaintext(&writes).await?;
        let remaining_encrypted = self.transport.count_encrypted_rows().await?;
        self.transport.delete_envelope().await?;

        self.engine.forget_vault(false)?;
        if remaining_encrypted > 0 {
            warn!(remaining_encrypted, "vault disabled with encrypted rows left on the server");
        }
        info!(converted, "vault disabled");
        Ok(DisableReport {
            records: live,
            converted,
            remaining_encrypted,
        })
    }

    /// Fails with `PlaintextSyncBlocked` while encrypted rows remain on the
    /// server.
    pub async fn check_plaintext_sync(&self) -> Result<()> {
        let encrypted_rows = self.transport.count_encrypted_rows().await?;
        if encrypted_rows > 0 {
            return Err(VaultError::PlaintextSyncBlocked { encrypted_rows });
        }
        Ok(())
    }

    /// Resolve a plaintext-sync block by deleting the encrypted rows.
    pub async fn delete_remote_encrypted(&self) -> Result<usize> {
        let removed = self.transport.delete_encrypted_rows().await?;
        warn!(removed, "encrypted rows deleted from server");
        Ok(removed)
    }

    // ========================================================================
    // Backup
    // ========================================================================

    /// Envelope plus all rows, still encrypted. No unlock needed.
    pub fn export_backup(&self) -> Result<String> {
        let envelope = self.envelopes.load()?.ok_or(VaultError::NotEnabled)?;
        BackupFile::export(&envelope, &self.records.scan()?).to_json()
    }

    /// Import a backup file. The whole file is validated first; a bad file
    /// changes nothing.
    pub fn import_backup(&self, json: &str, mode: ImportMode) -> Result<ImportReport> {
        let backup = BackupFile::parse(json)?;
        let mut report = ImportReport::default();
        match mode {
            ImportMode::Merge => {
                if self.envelopes.load()?.is_none() {
                    return Err(VaultError::NotEnabled);
                }
                let key = self.session.key()?;
                for row in &backup.records {
                    records::open(&key, row).map_err(|_| {
                        VaultError::InvalidBackupFormat(format!(
                            "record {} was not encrypted with this vault's key",
                            row.record_id
                        ))
                    })?;
                }
                let mut changed = RecordsChanged::default();
                for mut row in backup.records {
                    let local = self.records.get_stored(&row.record_id)?;
                    if let Some(local) = &local {
                        if local.version >= row.version {
                            report.skipped += 1;
                            continue;
                        }
                        row.conflict_ref = local.conflict_ref.clone();
                    }
                    self.records.import_stored(&row)?;
                    report.imported += 1;
                    if row.deleted {
                        changed.deleted.push(row.record_id.clone());
                    } else {
                        changed.upserted.push(records::open(&key, &row)?);
                    }
                }
                self.notifier.publish(&changed);
            }
            ImportMode::Replace => {
                self.session.lock();
                self.records.clear()?;
                self.engine.reset_cursor()?;
                // The restored envelope is offered to the server like any
                // local change; a newer server revision wins.
                self.envelopes.clear()?;
                self.envelopes.save(&backup.envelope)?;
                self.envelopes.set_pending_upload(true)?;
                for row in &backup.records {
                    self.records.import_stored(row)?;
                    report.imported += 1;
                }
            }
        }
        info!(?mode, imported = report.imported, skipped = report.skipped, "backup imported");
        self.trigger_sync();
        Ok(report)
    }
}
