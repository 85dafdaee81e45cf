mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bookmark_vault::config::{OutboxConfig, SyncOptions};
use bookmark_vault::server::{LoopbackTransport, MemoryServer};
use bookmark_vault::storage::{MemoryStorage, VaultStorage};
use bookmark_vault::sync::types::TransportError;
use bookmark_vault::sync::wire::{
    PlaintextPushResponse, PlaintextWrite, PullRequest, PullResponse, PushRequest, PushResponse,
};
use bookmark_vault::{CycleOutcome, SyncTransport, Vault, VaultConfig, VaultEnvelope};
use common::{bookmark, sync, test_config, Device, USER};
use tokio::sync::Notify;

/// Holds every push until the test releases it.
struct GatedTransport {
    inner: LoopbackTransport,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl SyncTransport for GatedTransport {
    async fn push(&self, request: &PushRequest) -> Result<PushResponse, TransportError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.push(request).await
    }

    async fn pull(&self, request: &PullRequest) -> Result<PullResponse, TransportError> {
        self.inner.pull(request).await
    }

    async fn get_envelope(&self) -> Result<Option<VaultEnvelope>, TransportError> {
        self.inner.get_envelope().await
    }

    async fn put_envelope(&self, envelope: &VaultEnvelope) -> Result<(), TransportError> {
        self.inner.put_envelope(envelope).await
    }

    async fn delete_envelope(&self) -> Result<(), TransportError> {
        self.inner.delete_envelope().await
    }

    async fn push_plaintext(
        &self,
        writes: &[PlaintextWrite],
    ) -> Result<PlaintextPushResponse, TransportError> {
        self.inner.push_plaintext(writes).await
    }

    async fn count_encrypted_rows(&self) -> Result<usize, TransportError> {
        self.inner.count_encrypted_rows().await
    }

    async fn revert_to_plaintext(&self, writes: &[PlaintextWrite]) -> Result<usize, TransportError> {
        self.inner.revert_to_plaintext(writes).await
    }

    async fn delete_encrypted_rows(&self) -> Result<usize, TransportError> {
        self.inner.delete_encrypted_rows().await
    }
}

#[tokio::test]
async fn only_one_cycle_runs_at_a_time() {
    let server = Arc::new(MemoryServer::new());
    let transport = Arc::new(GatedTransport {
        inner: LoopbackTransport::new(server.clone(), USER),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let storage: Arc<dyn VaultStorage> = Arc::new(MemoryStorage::new());
    let vault = Vault::new(storage, transport.clone(), test_config());
    vault.enable("p1").await.unwrap();
    vault.mutate(bookmark("one")).unwrap();

    let (first, second) = tokio::join!(vault.sync_now(), async {
        transport.entered.notified().await;
        let second = vault.sync_now().await;
        let running = vault.status();
        transport.release.notify_one();
        (second, running)
    });

    let (second, running) = second;
    assert!(matches!(second.unwrap(), CycleOutcome::AlreadyRunning));
    assert_eq!(running, bookmark_vault::SyncStatus::Syncing);
    match first.unwrap() {
        CycleOutcome::Completed(report) => assert_eq!(report.pushed, 1),
        CycleOutcome::AlreadyRunning => panic!("first cycle should run"),
    }
    // The guard is released once the cycle ends.
    assert!(matches!(
        vault.sync_now().await.unwrap(),
        CycleOutcome::Completed(_)
    ));
}

#[tokio::test]
async fn pull_pages_through_everything() {
    let server = Arc::new(MemoryServer::new());
    let writer = Device::new(&server);
    writer.vault.enable("p1").await.unwrap();
    for i in 0..7 {
        writer.vault.mutate(bookmark(&format!("b{i}"))).unwrap();
    }
    sync(&writer).await;

    let config = VaultConfig {
        sync: SyncOptions {
            pull_limit: 3,
            ..SyncOptions::default()
        },
        ..test_config()
    };
    let reader = Device::with_config(&server, config);
    reader.vault.unlock("p1").await.unwrap();
    assert_eq!(sync(&reader).await.pulled, 7);
    assert_eq!(reader.vault.records().unwrap().len(), 7);
    // Cursor is saved: nothing new on the next cycle.
    assert_eq!(sync(&reader).await.pulled, 0);
}

#[tokio::test]
async fn push_is_split_into_batches() {
    let server = Arc::new(MemoryServer::new());
    let config = VaultConfig {
        sync: SyncOptions {
            push_batch_size: 2,
            ..SyncOptions::default()
        },
        ..test_config()
    };
    let device = Device::with_config(&server, config);
    device.vault.enable("p1").await.unwrap();
    for i in 0..5 {
        device.vault.mutate(bookmark(&format!("b{i}"))).unwrap();
    }
    assert_eq!(sync(&device).await.pushed, 5);
    assert_eq!(device.transport.push_calls(), 3);
    assert_eq!(server.rows(USER).len(), 5);
}

#[tokio::test]
async fn scheduler_pushes_after_a_local_edit() {
    let server = Arc::new(MemoryServer::new());
    let config = VaultConfig {
        sync: SyncOptions {
            debounce_ms: 10,
            ..SyncOptions::default()
        },
        ..test_config()
    };
    let device = Device::with_config(&server, config);
    device.vault.enable("p1").await.unwrap();
    device.vault.start_sync();

    let record = device.vault.mutate(bookmark("scheduled")).unwrap();
    let mut landed = false;
    for _ in 0..200 {
        if server.row(USER, &record.record_id).is_some() {
            landed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    device.vault.stop_sync().await;
    assert!(landed, "scheduled sync never pushed the record");
    assert_eq!(device.vault.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn reconnect_flushes_queued_edits() {
    let server = Arc::new(MemoryServer::new());
    let config = VaultConfig {
        sync: SyncOptions {
            debounce_ms: 60_000,
            ..SyncOptions::default()
        },
        outbox: OutboxConfig {
            base_delay_ms: 0,
            max_delay_ms: 0,
        },
        ..test_config()
    };
    let device = Device::with_config(&server, config);
    device.vault.enable("p1").await.unwrap();
    device.transport.set_online(false);
    let record = device.vault.mutate(bookmark("queued")).unwrap();
    assert_eq!(sync(&device).await.failed, 1);

    // The long debounce would hold a plain request; a reconnect skips it.
    device.transport.set_online(true);
    device.vault.start_sync();
    device.vault.notify_reconnect();
    let mut landed = false;
    for _ in 0..300 {
        if server.row(USER, &record.record_id).is_some() {
            landed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    device.vault.stop_sync().await;
    assert!(landed);
}

#[tokio::test]
async fn lock_between_push_and_pull_keeps_pulled_rows_sealed() {
    let server = Arc::new(MemoryServer::new());
    let writer = Device::new(&server);
    writer.vault.enable("p1").await.unwrap();
    let remote = writer.vault.mutate(bookmark("from writer")).unwrap();
    sync(&writer).await;

    let transport = Arc::new(GatedTransport {
        inner: LoopbackTransport::new(server.clone(), USER),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let storage: Arc<dyn VaultStorage> = Arc::new(MemoryStorage::new());
    let vault = Vault::new(storage.clone(), transport.clone(), test_config());
    vault.unlock("p1").await.unwrap();
    let local = vault.mutate(bookmark("from reader")).unwrap();

    let upserted = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
    let sink = upserted.clone();
    let _sub = vault.subscribe(Arc::new(move |event: &bookmark_vault::RecordsChanged| {
        sink.lock()
            .extend(event.upserted.iter().map(|r| r.record_id.clone()));
    }));

    let (outcome, ()) = tokio::join!(vault.sync_now(), async {
        transport.entered.notified().await;
        vault.lock();
        transport.release.notify_one();
    });

    match outcome.unwrap() {
        CycleOutcome::Completed(report) => {
            assert_eq!(report.pushed, 1);
            assert_eq!(report.pulled, 1);
        }
        CycleOutcome::AlreadyRunning => panic!("cycle should run"),
    }
    assert!(!vault.is_unlocked());
    assert!(upserted.lock().is_empty());
    let sealed = storage.get_record(&remote.record_id).unwrap().unwrap();
    assert!(!sealed.deleted);
    assert!(server.row(USER, &local.record_id).is_some());

    vault.unlock("p1").await.unwrap();
    assert_eq!(
        vault.get(&remote.record_id).unwrap().unwrap().data["title"],
        "from writer"
    );
    assert!(upserted.lock().contains(&remote.record_id));
}
