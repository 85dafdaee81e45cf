mod common;

use std::sync::Arc;

use bookmark_vault::server::MemoryServer;
use bookmark_vault::{ImportMode, ImportReport, VaultError};
use common::{bookmark, sync, Device, USER};
use serde_json::json;

#[tokio::test]
async fn replace_restores_onto_a_fresh_device() {
    let server = Arc::new(MemoryServer::new());
    let source = Device::new(&server);
    source.vault.enable("p1").await.unwrap();
    let kept = source.vault.mutate(bookmark("kept")).unwrap();
    let gone = source.vault.mutate(bookmark("gone")).unwrap();
    source.vault.delete(&gone.record_id).unwrap();
    sync(&source).await;
    let backup = source.vault.export_backup().unwrap();

    // Restore onto an empty server: rows are re-created there.
    let fresh_server = Arc::new(MemoryServer::new());
    let restored = Device::new(&fresh_server);
    let report = restored
        .vault
        .import_backup(&backup, ImportMode::Replace)
        .unwrap();
    assert_eq!(report, ImportReport { imported: 2, skipped: 0 });
    assert!(restored.vault.is_enabled().unwrap());
    assert!(!restored.vault.is_unlocked());

    restored.vault.unlock("p1").await.unwrap();
    let records = restored.vault.records().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].data["title"], json!("kept"));
    assert_eq!(records[0].record_id, kept.record_id);

    // The backup's versions do not exist on the new server, so the first
    // push is rebased and the second one lands.
    let first = sync(&restored).await;
    assert_eq!(first.deferred, 2);
    let second = sync(&restored).await;
    assert_eq!(second.pushed, 2);
    assert_eq!(restored.vault.pending_count().unwrap(), 0);
    assert!(fresh_server.get_envelope(USER).is_some());
    assert!(fresh_server.row(USER, &gone.record_id).unwrap().deleted);
}

#[tokio::test]
async fn merge_keeps_the_newer_version() {
    let server = Arc::new(MemoryServer::new());
    let device = Device::new(&server);
    device.vault.enable("p1").await.unwrap();
    let mut record = device.vault.mutate(bookmark("v1")).unwrap();
    let other = device.vault.mutate(bookmark("other")).unwrap();
    sync(&device).await;
    let backup = device.vault.export_backup().unwrap();

    // Local edit moves past the backup; a deleted record comes back.
    record.data["title"] = json!("v2");
    device.vault.mutate(record.clone()).unwrap();
    device.vault.delete(&other.record_id).unwrap();

    let report = device
        .vault
        .import_backup(&backup, ImportMode::Merge)
        .unwrap();
    assert_eq!(report, ImportReport { imported: 0, skipped: 2 });
    assert_eq!(
        device.vault.get(&record.record_id).unwrap().unwrap().data["title"],
        json!("v2")
    );
    assert!(device.vault.get(&other.record_id).unwrap().is_none());
}

#[tokio::test]
async fn merge_imports_rows_missing_locally() {
    let server = Arc::new(MemoryServer::new());
    let a = Device::new(&server);
    a.vault.enable("p1").await.unwrap();
    let record = a.vault.mutate(bookmark("from backup")).unwrap();
    let backup = a.vault.export_backup().unwrap();

    let b = Device::new(&server);
    b.vault.unlock("p1").await.unwrap();
    let report = b.vault.import_backup(&backup, ImportMode::Merge).unwrap();
    assert_eq!(report.imported, 1);
    assert_eq!(
        b.vault.get(&record.record_id).unwrap().unwrap().data["title"],
        json!("from backup")
    );
}

#[tokio::test]
async fn merge_rejects_backup_from_another_vault() {
    let server_a = Arc::new(MemoryServer::new());
    let a = Device::new(&server_a);
    a.vault.enable("p1").await.unwrap();
    a.vault.mutate(bookmark("foreign")).unwrap();
    let foreign = a.vault.export_backup().unwrap();

    let server_b = Arc::new(MemoryServer::new());
    let b = Device::new(&server_b);
    b.vault.enable("p1").await.unwrap();
    let own = b.vault.mutate(bookmark("own")).unwrap();

    assert!(matches!(
        b.vault.import_backup(&foreign, ImportMode::Merge),
        Err(VaultError::InvalidBackupFormat(_))
    ));
    let records = b.vault.records().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].record_id, own.record_id);
    assert_eq!(b.vault.pending_count().unwrap(), 1);
}

#[tokio::test]
async fn malformed_backup_changes_nothing() {
    let server = Arc::new(MemoryServer::new());
    let device = Device::new(&server);
    device.vault.enable("p1").await.unwrap();
    device.vault.mutate(bookmark("one")).unwrap();

    for bad in ["not json", r#"{"version":9}"#, "{}"] {
        assert!(matches!(
            device.vault.import_backup(bad, ImportMode::Replace),
            Err(VaultError::InvalidBackupFormat(_))
        ));
    }
    assert!(device.vault.is_unlocked());
    assert_eq!(device.vault.records().unwrap().len(), 1);
}

#[tokio::test]
async fn merge_requires_unlock() {
    let server = Arc::new(MemoryServer::new());
    let device = Device::new(&server);
    device.vault.enable("p1").await.unwrap();
    let backup = device.vault.export_backup().unwrap();
    device.vault.lock();
    assert!(matches!(
        device.vault.import_backup(&backup, ImportMode::Merge),
        Err(VaultError::Locked)
    ));
}
