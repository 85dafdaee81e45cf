//! Sync-specific types: the transport trait and the results reported by a
//! sync cycle.

use async_trait::async_trait;

use crate::envelope::VaultEnvelope;
use crate::sync::wire::{
    PlaintextPushResponse, PlaintextWrite, PullRequest, PullResponse, PushRequest, PushResponse,
};

// ============================================================================
// SyncTransport: network layer to the sync server
// ============================================================================

/// Transport to the sync server.
///
/// Implementations handle the network (HTTP, WebSocket, in-process). A push
/// that reaches the server always returns a [`PushResponse`], including the
/// 409 conflict case; `Err` is reserved for requests that did not complete.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn push(&self, request: &PushRequest) -> Result<PushResponse, TransportError>;

    /// Rows with `updatedAt` strictly after the request cursor.
    async fn pull(&self, request: &PullRequest) -> Result<PullResponse, TransportError>;

    async fn get_envelope(&self) -> Result<Option<VaultEnvelope>, TransportError>;
    async fn put_envelope(&self, envelope: &VaultEnvelope) -> Result<(), TransportError>;
    async fn delete_envelope(&self) -> Result<(), TransportError>;

    /// Plaintext-mode write. Blocked while encrypted rows remain.
    async fn push_plaintext(
        &self,
        writes: &[PlaintextWrite],
    ) -> Result<PlaintextPushResponse, TransportError>;

    /// Rows for this user still stored encrypted.
    async fn count_encrypted_rows(&self) -> Result<usize, TransportError>;

    /// Convert rows to plaintext. Bypasses the plaintext-sync block; this
    /// is how the block is resolved.
    async fn revert_to_plaintext(&self, writes: &[PlaintextWrite]) -> Result<usize, TransportError>;

    /// Drop every encrypted row for this user. Returns how many went.
    async fn delete_encrypted_rows(&self) -> Result<usize, TransportError>;
}

/// Transport-level error.
#[derive(Debug, Clone)]
pub struct TransportError {
    pub message: String,
    pub kind: SyncErrorKind,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: SyncErrorKind::Transient,
        }
    }

    pub fn with_kind(message: impl Into<String>, kind: SyncErrorKind) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TransportError {}

/// Classification of transport errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncErrorKind {
    /// Retriable (network, temporary failures)
    Transient,
    /// Not retriable (malformed request, oversized batch)
    Permanent,
    /// Authentication failed
    Auth,
    /// Rate limit or quota exceeded
    Capacity,
    /// The write was based on a stale copy of the target
    Conflict,
}

// ============================================================================
// Sync Result Types
// ============================================================================

/// Counters for one completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pushed: usize,
    pub pulled: usize,
    /// Rejected pushes handled by copy or adoption.
    pub conflicts: usize,
    /// Operations that hit a network failure and will back off.
    pub failed: usize,
    /// Operations left queued untouched (conflict while locked, rebased).
    pub deferred: usize,
    /// The server envelope was gone, so local vault state was dropped.
    pub vault_disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(SyncReport),
    /// Another cycle held the single-flight guard.
    AlreadyRunning,
}

/// Coarse status for a "transient status indicator".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    /// Last cycle hit a network failure; operations stay queued.
    Offline,
    Error(String),
}

/// Which phase of a cycle the engine is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Push,
    Pull,
}
