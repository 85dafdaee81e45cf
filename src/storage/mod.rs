//! Client-side persistence.
//!
//! `VaultStorage` is the narrow interface the record store, outbox, and
//! envelope store share. SQLite is the durable backend; `MemoryStorage` is
//! the fallback when durable storage cannot be opened.

pub mod error;
pub mod memory;
pub mod sqlite;
pub mod traits;
pub mod types;

use std::path::Path;
use std::sync::Arc;

pub use error::StorageError;
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use traits::VaultStorage;
pub use types::{OutboxOperation, RecordType, StoredRecord};

/// Emitted when vault data will only live in memory for this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageWarning {
    pub message: String,
}

/// Result of [`open_storage`].
pub struct OpenedStorage {
    pub storage: Arc<dyn VaultStorage>,
    /// Set when durable storage was unavailable and memory was used instead.
    pub warning: Option<StorageWarning>,
}

impl OpenedStorage {
    pub fn is_durable(&self) -> bool {
        self.warning.is_none()
    }
}

/// Open SQLite at `path`, degrading to in-memory storage with an explicit
/// warning when that fails. Nothing is silently dropped: the caller gets
/// the warning and is expected to show it.
pub fn open_storage<P: AsRef<Path>>(path: P) -> OpenedStorage {
    match SqliteStorage::open(path.as_ref()) {
        Ok(storage) => OpenedStorage {
            storage: Arc::new(storage),
            warning: None,
        },
        Err(e) => {
            let message = format!(
                "durable storage at {} unavailable ({e}); vault data is kept in memory only \
                 and will be lost when this session ends",
                path.as_ref().display()
            );
            tracing::warn!(error = %e, "falling back to in-memory vault storage");
            OpenedStorage {
                storage: Arc::new(MemoryStorage::new()),
                warning: Some(StorageWarning { message }),
            }
        }
    }
}
