#![allow(dead_code)]

use std::sync::Arc;

use bookmark_vault::crypto::KdfParams;
use bookmark_vault::server::{LoopbackTransport, MemoryServer};
use bookmark_vault::storage::{MemoryStorage, VaultStorage};
use bookmark_vault::{CycleOutcome, RecordType, SyncReport, Vault, VaultConfig, VaultRecord};
use serde_json::json;

pub const USER: &str = "user-1";

/// Cheap Argon2 so tests stay fast; the floor is lowered to match.
pub fn test_config() -> VaultConfig {
    let cheap = KdfParams::argon2id(1, 64, 1);
    VaultConfig {
        kdf: cheap.clone(),
        min_kdf: cheap,
        min_passphrase_len: 2,
        ..VaultConfig::default()
    }
}

/// One client device: its own storage and transport, shared server.
pub struct Device {
    pub vault: Vault,
    pub storage: Arc<dyn VaultStorage>,
    pub transport: Arc<LoopbackTransport>,
}

impl Device {
    pub fn new(server: &Arc<MemoryServer>) -> Self {
        Self::with_config(server, test_config())
    }

    pub fn with_config(server: &Arc<MemoryServer>, config: VaultConfig) -> Self {
        let storage: Arc<dyn VaultStorage> = Arc::new(MemoryStorage::new());
        let transport = Arc::new(LoopbackTransport::new(server.clone(), USER));
        let vault = Vault::new(storage.clone(), transport.clone(), config);
        Self {
            vault,
            storage,
            transport,
        }
    }
}

/// Run one cycle and unwrap its report.
pub async fn sync(device: &Device) -> SyncReport {
    match device.vault.sync_now().await.unwrap() {
        CycleOutcome::Completed(report) => report,
        CycleOutcome::AlreadyRunning => panic!("unexpected concurrent cycle"),
    }
}

pub fn bookmark(title: &str) -> VaultRecord {
    VaultRecord::new(
        RecordType::Bookmark,
        json!({"title": title, "url": "https://example.com"}),
    )
}
