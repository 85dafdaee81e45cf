//! Crate-level error taxonomy.
//!
//! Cryptographic and protocol errors are never retried automatically;
//! only [`VaultError::NetworkFailure`] is.

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::storage::StorageError;
use crate::sync::types::{SyncErrorKind, TransportError};

const AUTH_FAILURE_MESSAGE: &str = "Wrong passphrase or recovery code";

#[derive(Debug, Error)]
pub enum VaultError {
    /// Tag or key-wrap verification failed. Surfaced to the user as-is.
    #[error("{}", AUTH_FAILURE_MESSAGE)]
    AuthenticationFailure,

    /// A spent recovery code. Renders exactly like a wrong code.
    #[error("{}", AUTH_FAILURE_MESSAGE)]
    RecoveryCodeAlreadyUsed,

    /// More than one recovery wrapper matched the same code hash.
    #[error("Recovery code matches more than one wrapper")]
    AmbiguousRecoveryCode,

    #[error("Malformed recovery code: {0}")]
    InvalidRecoveryCode(String),

    #[error("Version conflict on {record_id}: base {base_version:?}, server {current_version}")]
    VersionConflict {
        record_id: String,
        base_version: Option<i64>,
        current_version: i64,
    },

    #[error("Network failure: {0}")]
    NetworkFailure(String),

    #[error("Invalid backup format: {0}")]
    InvalidBackupFormat(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Vault is locked")]
    Locked,

    #[error("Vault is not enabled")]
    NotEnabled,

    #[error("Vault is already enabled")]
    AlreadyEnabled,

    #[error("Passphrase must be at least {min} characters")]
    WeakPassphrase { min: usize },

    #[error("Envelope KDF parameters are below the configured floor")]
    KdfParamsTooWeak,

    #[error("Unsupported envelope version: {0}")]
    UnsupportedEnvelopeVersion(u32),

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// The server holds a newer envelope than the one this write replaced.
    #[error("Envelope changed on the server: {0}")]
    EnvelopeConflict(String),

    /// Plaintext sync refuses to run while encrypted rows remain.
    #[error("Plaintext sync blocked: {encrypted_rows} encrypted rows remain on the server")]
    PlaintextSyncBlocked { encrypted_rows: usize },

    #[error("A sync cycle is already running")]
    SyncInProgress,

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Crypto error: {0}")]
    Crypto(CryptoError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VaultError {
    /// Only network failures are retried (through outbox backoff).
    pub fn is_retryable(&self) -> bool {
        matches!(self, VaultError::NetworkFailure(_))
    }

    /// Wrong passphrase, wrong code, or spent code.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            VaultError::AuthenticationFailure | VaultError::RecoveryCodeAlreadyUsed
        )
    }
}

impl From<CryptoError> for VaultError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::AuthenticationFailed => VaultError::AuthenticationFailure,
            other => VaultError::Crypto(other),
        }
    }
}

impl From<TransportError> for VaultError {
    fn from(e: TransportError) -> Self {
        match e.kind {
            SyncErrorKind::Transient | SyncErrorKind::Capacity => {
                VaultError::NetworkFailure(e.message)
            }
            SyncErrorKind::Auth => VaultError::Protocol(format!("unauthorized: {}", e.message)),
            SyncErrorKind::Permanent => VaultError::Protocol(e.message),
            SyncErrorKind::Conflict => VaultError::EnvelopeConflict(e.message),
        }
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
