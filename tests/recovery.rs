mod common;

use std::sync::Arc;

use bookmark_vault::server::MemoryServer;
use bookmark_vault::VaultError;
use common::{Device, USER};

#[tokio::test]
async fn recovery_code_forces_new_passphrase_and_is_spent() {
    let server = Arc::new(MemoryServer::new());
    let device = Device::new(&server);
    let codes = device.vault.enable("p1").await.unwrap().to_display_strings();
    assert_eq!(codes.len(), 8);
    device.vault.lock();

    let r3 = &codes[2];
    let pending = device.vault.begin_recovery(r3).await.unwrap();
    assert!(!device.vault.is_unlocked());
    pending.complete("p2").await.unwrap();
    assert!(device.vault.is_unlocked());
    assert_eq!(device.vault.remaining_recovery_codes().unwrap(), 7);

    device.vault.lock();
    assert!(matches!(
        device.vault.unlock("p1").await,
        Err(VaultError::AuthenticationFailure)
    ));
    device.vault.unlock("p2").await.unwrap();
    device.vault.lock();

    let reuse = device.vault.begin_recovery(r3).await.err().unwrap();
    assert!(matches!(reuse, VaultError::RecoveryCodeAlreadyUsed));
    assert_eq!(reuse.to_string(), VaultError::AuthenticationFailure.to_string());

    for (i, code) in codes.iter().enumerate().filter(|(i, _)| *i != 2) {
        assert!(
            device.vault.begin_recovery(code).await.is_ok(),
            "code {i} should still work"
        );
    }
    assert!(!device.vault.is_unlocked());

    // The spent wrapper is mirrored to the server.
    let mirrored = server.get_envelope(USER).unwrap();
    assert_eq!(mirrored.unused_recovery_codes(), 7);
}

#[tokio::test]
async fn recovery_codes_accept_lowercase_and_spacing() {
    let server = Arc::new(MemoryServer::new());
    let device = Device::new(&server);
    let codes = device.vault.enable("p1").await.unwrap().to_display_strings();
    device.vault.lock();
    let sloppy = codes[0].to_lowercase().replace('-', " ");
    assert!(device.vault.begin_recovery(&sloppy).await.is_ok());
}

#[tokio::test]
async fn failed_completion_leaves_vault_locked_and_code_unspent() {
    let server = Arc::new(MemoryServer::new());
    let mut config = common::test_config();
    config.min_passphrase_len = 8;
    let device = Device::with_config(&server, config);
    let codes = device.vault.enable("long passphrase").await.unwrap().to_display_strings();
    device.vault.lock();

    let pending = device.vault.begin_recovery(&codes[0]).await.unwrap();
    assert!(matches!(
        pending.complete("short").await,
        Err(VaultError::WeakPassphrase { min: 8 })
    ));
    assert!(!device.vault.is_unlocked());
    assert_eq!(device.vault.remaining_recovery_codes().unwrap(), 8);

    // Same code still works because nothing was marked.
    let pending = device.vault.begin_recovery(&codes[0]).await.unwrap();
    pending.complete("another long one").await.unwrap();
    assert!(device.vault.is_unlocked());
}

#[tokio::test]
async fn dropped_recovery_marks_nothing() {
    let server = Arc::new(MemoryServer::new());
    let device = Device::new(&server);
    let codes = device.vault.enable("p1").await.unwrap().to_display_strings();
    device.vault.lock();
    drop(device.vault.begin_recovery(&codes[5]).await.unwrap());
    assert_eq!(device.vault.remaining_recovery_codes().unwrap(), 8);
    device.vault.unlock("p1").await.unwrap();
}

#[tokio::test]
async fn unknown_and_malformed_codes() {
    let server = Arc::new(MemoryServer::new());
    let device = Device::new(&server);
    device.vault.enable("p1").await.unwrap();
    device.vault.lock();
    assert!(matches!(
        device.vault.begin_recovery("2222-2222-2222-2222").await.err().unwrap(),
        VaultError::AuthenticationFailure
    ));
    assert!(matches!(
        device.vault.begin_recovery("not a code").await.err().unwrap(),
        VaultError::InvalidRecoveryCode(_)
    ));
}

#[tokio::test]
async fn regenerated_codes_replace_old_ones() {
    let server = Arc::new(MemoryServer::new());
    let device = Device::new(&server);
    let old = device.vault.enable("p1").await.unwrap().to_display_strings();
    assert!(matches!(
        device.vault.regenerate_recovery_codes("wrong").await,
        Err(VaultError::AuthenticationFailure)
    ));
    let new = device
        .vault
        .regenerate_recovery_codes("p1")
        .await
        .unwrap()
        .to_display_strings();
    assert_eq!(new.len(), 8);
    device.vault.lock();
    assert!(device.vault.begin_recovery(&old[0]).await.is_err());
    assert!(device.vault.begin_recovery(&new[0]).await.is_ok());
}

#[tokio::test]
async fn recovery_on_a_second_device_propagates() {
    let server = Arc::new(MemoryServer::new());
    let a = Device::new(&server);
    let codes = a.vault.enable("p1").await.unwrap().to_display_strings();

    let b = Device::new(&server);
    b.vault
        .begin_recovery(&codes[3])
        .await
        .unwrap()
        .complete("p2")
        .await
        .unwrap();

    // A picks up the new envelope through its sync cycle.
    a.vault.sync_now().await.unwrap();
    a.vault.lock();
    a.vault.unlock("p2").await.unwrap();
    assert_eq!(a.vault.remaining_recovery_codes().unwrap(), 7);
}

#[tokio::test]
async fn stale_device_cannot_revive_a_spent_code() {
    let server = Arc::new(MemoryServer::new());
    let a = Device::new(&server);
    let codes = a.vault.enable("p1").await.unwrap().to_display_strings();

    let b = Device::new(&server);
    b.vault
        .begin_recovery(&codes[2])
        .await
        .unwrap()
        .complete("p2")
        .await
        .unwrap();

    // A never synced, but key operations read the server's envelope.
    a.vault.lock();
    assert!(matches!(
        a.vault.unlock("p1").await,
        Err(VaultError::AuthenticationFailure)
    ));
    assert!(matches!(
        a.vault.rotate_passphrase("p1", "p3").await,
        Err(VaultError::AuthenticationFailure)
    ));
    assert_eq!(server.get_envelope(USER).unwrap().unused_recovery_codes(), 7);

    let fresh = Device::new(&server);
    assert!(matches!(
        fresh.vault.begin_recovery(&codes[2]).await.err().unwrap(),
        VaultError::RecoveryCodeAlreadyUsed
    ));
    fresh.vault.unlock("p2").await.unwrap();
}

#[tokio::test]
async fn offline_rotation_loses_to_a_newer_server_envelope() {
    let server = Arc::new(MemoryServer::new());
    let a = Device::new(&server);
    let codes = a.vault.enable("p1").await.unwrap().to_display_strings();

    let b = Device::new(&server);
    b.vault
        .begin_recovery(&codes[2])
        .await
        .unwrap()
        .complete("p2")
        .await
        .unwrap();

    a.transport.set_online(false);
    a.vault.rotate_passphrase("p1", "p3").await.unwrap();
    a.transport.set_online(true);
    common::sync(&a).await;

    let mirrored = server.get_envelope(USER).unwrap();
    assert_eq!(mirrored.unused_recovery_codes(), 7);
    assert_eq!(a.vault.remaining_recovery_codes().unwrap(), 7);

    a.vault.lock();
    assert!(a.vault.unlock("p3").await.is_err());
    a.vault.unlock("p2").await.unwrap();
    let fresh = Device::new(&server);
    assert!(fresh.vault.begin_recovery(&codes[2]).await.is_err());
}

#[tokio::test]
async fn code_spent_elsewhere_fails_at_completion() {
    let server = Arc::new(MemoryServer::new());
    let a = Device::new(&server);
    let codes = a.vault.enable("p1").await.unwrap().to_display_strings();
    a.vault.lock();
    let pending = a.vault.begin_recovery(&codes[4]).await.unwrap();

    let b = Device::new(&server);
    b.vault
        .begin_recovery(&codes[4])
        .await
        .unwrap()
        .complete("p2")
        .await
        .unwrap();

    assert!(matches!(
        pending.complete("p3").await,
        Err(VaultError::RecoveryCodeAlreadyUsed)
    ));
    assert!(!a.vault.is_unlocked());
    assert_eq!(server.get_envelope(USER).unwrap().unused_recovery_codes(), 7);
    a.vault.unlock("p2").await.unwrap();
}
