//! Sync engine: one push/pull cycle at a time against a [`SyncTransport`].
//!
//! A cycle checks the envelope mirror, then goes `Idle → Pushing → Pulling
//! → Idle`. Starting a cycle while
//! one is running returns [`CycleOutcome::AlreadyRunning`] instead of
//! queueing. Network failures leave operations queued with backoff and show
//! up only as [`SyncStatus::Offline`].

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::SyncOptions;
use crate::envelope::{EnvelopeStore, VaultEnvelope};
use crate::error::{Result, VaultError};
use crate::notify::{Notifier, RecordsChanged};
use crate::outbox::{OpResult, Outbox};
use crate::records::{self, ApplyOutcome, RecordStore};
use crate::session::VaultSession;
use crate::storage::{OutboxOperation, StorageError, VaultStorage};
use crate::sync::conflict::{ConflictOutcome, ConflictResolver};
use crate::sync::types::{
    CycleOutcome, SyncErrorKind, SyncPhase, SyncReport, SyncStatus, SyncTransport,
};
use crate::sync::wire::{PullRequest, PushOperation, PushRequest, PushResponse};

const CURSOR_META_KEY: &str = "sync.cursor";

#[derive(Debug, Default)]
struct EngineState {
    phase: Option<SyncPhase>,
    status: SyncStatus,
}

/// Everything the engine works on. Built once by the vault facade.
pub struct SyncContext {
    pub transport: Arc<dyn SyncTransport>,
    pub storage: Arc<dyn VaultStorage>,
    pub records: RecordStore,
    pub outbox: Outbox,
    pub session: Arc<VaultSession>,
    pub envelopes: EnvelopeStore,
    pub notifier: Arc<Notifier>,
}

pub struct SyncEngine {
    ctx: SyncContext,
    options: SyncOptions,
    state: Mutex<EngineState>,
}

/// Releases the single-flight slot when the cycle ends, however it ends.
struct CycleGuard<'a> {
    state: &'a Mutex<EngineState>,
}

impl CycleGuard<'_> {
    fn enter(&self, phase: SyncPhase) {
        self.state.lock().phase = Some(phase);
    }

    fn finish(self, status: SyncStatus) {
        self.state.lock().status = status;
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.phase = None;
        if state.status == SyncStatus::Syncing {
            state.status = SyncStatus::Idle;
        }
    }
}

impl SyncEngine {
    pub fn new(ctx: SyncContext, options: SyncOptions) -> Self {
        Self {
            ctx,
            options,
            state: Mutex::new(EngineState::default()),
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.state.lock().status.clone()
    }

    /// `None` when no cycle is running.
    pub fn phase(&self) -> Option<SyncPhase> {
        self.state.lock().phase
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().phase.is_some()
    }

    pub fn pending_count(&self) -> Result<usize> {
        self.ctx.outbox.pending_count()
    }

    fn try_begin(&self) -> Option<CycleGuard<'_>> {
        let mut state = self.state.lock();
        if state.phase.is_some() {
            return None;
        }
        state.phase = Some(SyncPhase::Push);
        state.status = SyncStatus::Syncing;
        Some(CycleGuard { state: &self.state })
    }

    /// Run one cycle: envelope mirror, push, then pull.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let Some(guard) = self.try_begin() else {
            debug!("sync cycle already running");
            return Ok(CycleOutcome::AlreadyRunning);
        };
        let mut report = SyncReport::default();
        let result = self.cycle(&guard, &mut report).await;
        match result {
            Ok(()) => {
                guard.finish(SyncStatus::Idle);
                info!(
                    pushed = report.pushed,
                    pulled = report.pulled,
                    conflicts = report.conflicts,
                    deferred = report.deferred,
                    "sync cycle complete"
                );
                Ok(CycleOutcome::Completed(report))
            }
            Err(VaultError::NetworkFailure(message)) => {
                warn!(error = %message, failed = report.failed, "sync cycle offline");
                guard.finish(SyncStatus::Offline);
                Ok(CycleOutcome::Completed(report))
            }
            Err(e) => {
                warn!(error = %e, "sync cycle failed");
                guard.finish(SyncStatus::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn cycle(&self, guard: &CycleGuard<'_>, report: &mut SyncReport) -> Result<()> {
        if self.ctx.envelopes.load()?.is_none() {
            debug!("vault not enabled; nothing to sync");
            return Ok(());
        }
        // Offline still reaches push so queued operations back off.
        let envelope = match self.sync_envelope().await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => {
                report.vault_disabled = true;
                return Ok(());
            }
            Err(e @ VaultError::NetworkFailure(_)) => Err(e),
            Err(e) => return Err(e),
        };
        guard.enter(SyncPhase::Push);
        self.push(report).await?;
        guard.enter(SyncPhase::Pull);
        self.pull(report).await?;
        envelope
    }

    // ========================================================================
    // Envelope mirror
    // ========================================================================

    /// Reconcile the local envelope with the server's. Returns the envelope
    /// now in force, or `None` when the vault is off on this device.
    ///
    /// A pending local change is uploaded against the server's revision; if
    /// the server refuses it, the server's copy wins. A vault the server no
    /// longer has an envelope for was disabled elsewhere and is forgotten
    /// here, unless the local envelope never reached the server.
    pub(crate) async fn sync_envelope(&self) -> Result<Option<VaultEnvelope>> {
        let Some(local) = self.ctx.envelopes.load()? else {
            return Ok(None);
        };
        let pending = self.ctx.envelopes.pending_upload()?;
        let mirrored = self.ctx.envelopes.was_mirrored()?;
        let remote = match self.ctx.transport.get_envelope().await? {
            Some(remote) => remote,
            None if pending && !mirrored => {
                self.ctx.transport.put_envelope(&local).await?;
                self.ctx.envelopes.mark_mirrored()?;
                info!("uploaded pending envelope");
                return Ok(Some(local));
            }
            None => {
                warn!("server has no envelope; vault was disabled on another device");
                self.forget_vault(true)?;
                return Ok(None);
            }
        };
        if remote == local {
            self.ctx.envelopes.mark_mirrored()?;
            return Ok(Some(local));
        }
        if pending {
            match self.ctx.transport.put_envelope(&local).await {
                Ok(()) => {
                    self.ctx.envelopes.mark_mirrored()?;
                    info!(revision = local.revision, "uploaded pending envelope");
                    return Ok(Some(local));
                }
                Err(e) if e.kind == SyncErrorKind::Conflict => {
                    warn!(error = %e, "server refused local envelope; adopting its copy");
                }
                Err(e) => return Err(e.into()),
            }
        }
        remote.validate()?;
        self.ctx.envelopes.save(&remote)?;
        self.ctx.envelopes.mark_mirrored()?;
        info!(
            revision = remote.revision,
            unused_recovery_codes = remote.unused_recovery_codes(),
            "refreshed envelope from server"
        );
        Ok(Some(remote))
    }

    /// Drop every piece of local vault state and lock. With `announce`,
    /// subscribers see the live records go away.
    pub(crate) fn forget_vault(&self, announce: bool) -> Result<()> {
        let deleted: Vec<String> = if announce {
            self.ctx
                .records
                .scan()?
                .into_iter()
                .filter(|row| !row.deleted)
                .map(|row| row.record_id)
                .collect()
        } else {
            Vec::new()
        };
        self.ctx.records.clear()?;
        self.reset_cursor()?;
        self.ctx.envelopes.clear()?;
        self.ctx.session.lock();
        if !deleted.is_empty() {
            self.ctx.notifier.publish(&RecordsChanged {
                upserted: Vec::new(),
                deleted,
            });
        }
        Ok(())
    }

    // ========================================================================
    // Push
    // ========================================================================

    async fn push(&self, report: &mut SyncReport) -> Result<()> {
        let ops = self.ctx.outbox.retryable_now(Utc::now())?;
        if ops.is_empty() {
            return Ok(());
        }
        for batch in ops.chunks(self.options.effective_batch_size()) {
            let request = PushRequest {
                operations: batch.iter().map(PushOperation::from).collect(),
            };
            debug!(count = batch.len(), "pushing batch");
            let response = match self.ctx.transport.push(&request).await {
                Ok(response) => response,
                Err(e) => {
                    let now = Utc::now();
                    for op in batch {
                        self.ctx.outbox.on_result(op, OpResult::Failed, now)?;
                    }
                    report.failed += batch.len();
                    return Err(e.into());
                }
            };
            self.apply_push_response(batch, &response, report)?;
        }
        Ok(())
    }

    fn apply_push_response(
        &self,
        batch: &[OutboxOperation],
        response: &PushResponse,
        report: &mut SyncReport,
    ) -> Result<()> {
        let now = Utc::now();
        let mut handled: HashSet<&str> = HashSet::new();
        let mut changed = RecordsChanged::default();
        let find = |record_id: &str| batch.iter().find(|op| op.record_id == record_id);

        for result in &response.results {
            let Some(op) = find(&result.record_id) else {
                warn!(record_id = %result.record_id, "push result for unknown record");
                continue;
            };
            handled.insert(op.id.as_str());
            self.ctx.outbox.on_result(
                op,
                OpResult::Accepted {
                    version: result.version,
                },
                now,
            )?;
            self.ctx
                .records
                .reconcile_version(&op.record_id, result.version)?;
            // A newer local edit queued while this one was in flight.
            self.ctx.outbox.rebase(&op.record_id, Some(result.version))?;
            report.pushed += 1;
        }

        let resolver = ConflictResolver::new(&self.ctx.records, &self.ctx.outbox, &self.ctx.session);
        for conflict in &response.conflicts {
            let Some(op) = find(&conflict.record_id) else {
                warn!(record_id = %conflict.record_id, "push conflict for unknown record");
                continue;
            };
            handled.insert(op.id.as_str());
            match resolver.resolve(op, conflict)? {
                ConflictOutcome::Copied { copy, original } => {
                    report.conflicts += 1;
                    changed.upserted.push(copy);
                    match original {
                        Some(original) => changed.upserted.push(original),
                        None if conflict.current_deleted => {
                            changed.deleted.push(op.record_id.clone())
                        }
                        None => {}
                    }
                }
                ConflictOutcome::AdoptedServer { record_id } => {
                    report.conflicts += 1;
                    self.collect_change(&record_id, &mut changed)?;
                }
                ConflictOutcome::Deferred | ConflictOutcome::Rebased => report.deferred += 1,
            }
        }

        for op in batch.iter().filter(|op| !handled.contains(op.id.as_str())) {
            warn!(op_id = %op.id, record_id = %op.record_id, "push response omitted operation");
            self.ctx.outbox.on_result(op, OpResult::Failed, now)?;
            report.failed += 1;
        }

        self.ctx.notifier.publish(&changed);
        Ok(())
    }

    /// Add the current local state of `record_id` to a change event, if it
    /// can be shown.
    fn collect_change(&self, record_id: &str, changed: &mut RecordsChanged) -> Result<()> {
        let Some(stored) = self.ctx.records.get_stored(record_id)? else {
            return Ok(());
        };
        if stored.deleted {
            changed.deleted.push(stored.record_id);
            return Ok(());
        }
        if let Ok(key) = self.ctx.session.key() {
            match records::open(&key, &stored) {
                Ok(record) => changed.upserted.push(record),
                Err(e) => warn!(record_id, error = %e, "record does not decrypt"),
            }
        }
        Ok(())
    }

    // ========================================================================
    // Pull
    // ========================================================================

    async fn pull(&self, report: &mut SyncReport) -> Result<()> {
        let limit = self.options.effective_pull_limit();
        let mut cursor = self.load_cursor()?;
        loop {
            let response = self
                .ctx
                .transport
                .pull(&PullRequest { cursor, limit })
                .await?;
            let mut changed = RecordsChanged::default();
            for record in &response.records {
                let remote = record.to_remote()?;
                if let ApplyOutcome::Applied(stored) = self.ctx.records.apply_remote(&remote)? {
                    report.pulled += 1;
                    if stored.deleted {
                        changed.deleted.push(stored.record_id);
                        continue;
                    }
                    // Locked (possibly mid-cycle): ciphertext is kept for later.
                    if let Ok(key) = self.ctx.session.key() {
                        match records::open(&key, &stored) {
                            Ok(record) => changed.upserted.push(record),
                            Err(e) => warn!(
                                record_id = %stored.record_id,
                                error = %e,
                                "pulled record does not decrypt"
                            ),
                        }
                    }
                }
            }
            self.ctx.notifier.publish(&changed);

            let next = response
                .next_cursor
                .or_else(|| response.records.iter().map(|r| r.updated_at).max());
            if let Some(next) = next {
                if cursor.map_or(true, |c| next > c) {
                    cursor = Some(next);
                    self.save_cursor(&next)?;
                }
            }
            debug!(
                count = response.records.len(),
                has_more = response.has_more,
                "pulled page"
            );
            if !response.has_more || response.records.is_empty() {
                break;
            }
        }
        Ok(())
    }

    fn load_cursor(&self) -> Result<Option<DateTime<Utc>>> {
        let Some(raw) = self.ctx.storage.get_meta(CURSOR_META_KEY)? else {
            return Ok(None);
        };
        let cursor = DateTime::parse_from_rfc3339(&raw)
            .map_err(|e| StorageError::Corrupt {
                table: "meta",
                message: format!("sync cursor {raw:?}: {e}"),
            })?
            .with_timezone(&Utc);
        Ok(Some(cursor))
    }

    fn save_cursor(&self, cursor: &DateTime<Utc>) -> Result<()> {
        self.ctx.storage.set_meta(
            CURSOR_META_KEY,
            &cursor.to_rfc3339_opts(SecondsFormat::Nanos, true),
        )?;
        Ok(())
    }

    /// Forget the pull cursor so the next cycle pulls everything.
    pub fn reset_cursor(&self) -> Result<()> {
        self.ctx.storage.delete_meta(CURSOR_META_KEY)?;
        Ok(())
    }
}
