//! Zero-knowledge vault for bookmark sync.
//!
//! Records (bookmarks, collections, saved views) are sealed on the device
//! under a random vault key. The key is wrapped by a passphrase-derived key
//! and by one-time recovery codes; the server only ever stores ciphertext
//! and the wrapped key. Local writes go through an outbox and reach the
//! server through an optimistic-concurrency push/pull protocol.
//!
//! Start at [`Vault`].

pub mod backup;
pub mod config;
pub mod crypto;
pub mod encoding;
pub mod envelope;
pub mod error;
pub mod notify;
pub mod outbox;
pub mod records;
pub mod recovery;
pub mod server;
pub mod session;
pub mod storage;
pub mod sync;
pub mod vault;

pub use backup::{BackupFile, ImportMode, ImportReport};
pub use config::VaultConfig;
pub use envelope::{RecoveryCode, VaultEnvelope};
pub use error::{Result, VaultError};
pub use notify::{RecordsChanged, Subscription};
pub use recovery::PendingRecovery;
pub use records::VaultRecord;
pub use storage::RecordType;
pub use sync::{CycleOutcome, KeepSide, SyncReport, SyncStatus, SyncTransport};
pub use vault::{DisableReport, RecoveryCodes, Vault};
