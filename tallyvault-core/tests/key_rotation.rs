//! Key rotation: resumability, exclusivity and key retirement
//!
//! Run with: cargo test --test key_rotation

use std::sync::{Arc, Barrier};
use std::thread;

use tallyvault_core::core_crypto::{encrypt, Algorithm};
use tallyvault_core::core_keys::rotation::ROTATION_LOCK_KEY;
use tallyvault_core::core_keys::{KeyRotationJob, KeyStatus, RotationControl, RotationStatus};
use tallyvault_core::core_store::clock::SystemTimeSource;
use tallyvault_core::core_store::model::{FieldValue, JobId};
use tallyvault_core::core_store::store::{MemoryBackend, StorageBackend, Table, WriteBatch};
use tallyvault_core::test_utils::{acme, assert_sealed_under, memory_vault_with, transaction};
use tallyvault_core::{Vault, VaultError};

const ENTITIES: usize = 6;

fn open(backend: &Arc<dyn StorageBackend>) -> Vault {
    memory_vault_with("laptop", backend.clone(), Arc::new(SystemTimeSource)).unwrap()
}

fn seeded(backend: &Arc<dyn StorageBackend>) -> Vault {
    let vault = open(backend);
    vault.provision_company(&acme()).unwrap();
    for i in 0..ENTITIES {
        let tx = transaction(&format!("tx-{}", i));
        vault.mutate_field(&tx, "memo", FieldValue::text(format!("memo {}", i))).unwrap();
        vault
            .mutate_field(&tx, "amount", FieldValue::money(i as i64 * 100, "USD"))
            .unwrap();
    }
    vault
}

#[tokio::test]
async fn test_crash_mid_rotation_resumes_without_double_encryption() {
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let vault = seeded(&backend);
    let job = vault.rotate_key(&acme()).unwrap();

    let first = vault
        .run_rotation(&acme(), &job.job_id, &RotationControl::stop_after(2))
        .await
        .unwrap();
    assert!(!first.finished);
    assert_eq!(first.entities_reencrypted, 2);

    // Simulated crash: the session goes away, the store survives
    drop(vault);
    let vault = open(&backend);
    let in_flight = vault.in_flight_rotation(&acme()).unwrap().unwrap();
    assert_eq!(in_flight.job_id, job.job_id);
    assert_eq!(in_flight.entities_processed, 2);

    let resumed = vault.resume_rotation(&acme()).await.unwrap();
    assert!(resumed.finished);
    assert_eq!(resumed.entities_reencrypted, (ENTITIES - 2) as u64);
    assert_eq!(resumed.job.entities_reencrypted, ENTITIES as u64);
    assert_eq!(resumed.job.fields_reencrypted, (ENTITIES * 2) as u64);
    assert_eq!(resumed.job.status, RotationStatus::Completed);

    for i in 0..ENTITIES {
        let tx = transaction(&format!("tx-{}", i));
        assert_sealed_under(&vault, &tx, &job.new_key_id);
        assert_eq!(
            vault.get_entity(&tx).unwrap().value("memo"),
            Some(&FieldValue::text(format!("memo {}", i)))
        );
    }
}

#[tokio::test]
async fn test_second_rotation_is_refused() {
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let vault = seeded(&backend);
    let job = vault.rotate_key(&acme()).unwrap();
    assert!(matches!(
        vault.rotate_key(&acme()),
        Err(VaultError::RotationInProgress { .. })
    ));

    vault
        .run_rotation(&acme(), &job.job_id, &RotationControl::new())
        .await
        .unwrap();
    // The guard is released once the job finishes
    let next = vault.rotate_key(&acme()).unwrap();
    assert_ne!(next.job_id, job.job_id);
}

#[tokio::test]
async fn test_completed_rotation_retires_old_key() {
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let vault = seeded(&backend);
    let old_key = vault.keys().active_record(&acme()).unwrap().key_id;
    let job = vault.rotate_key(&acme()).unwrap();
    vault
        .run_rotation(&acme(), &job.job_id, &RotationControl::new())
        .await
        .unwrap();

    let record = vault.keys().key_record(&acme(), &old_key).unwrap().unwrap();
    assert!(matches!(record.status, KeyStatus::Retired { .. }));

    // Still decrypts during the grace period, never encrypts
    let old = vault.keys().data_key(&acme(), &old_key).unwrap();
    assert!(matches!(
        encrypt(b"late write", &old, b"aad", Algorithm::default()),
        Err(VaultError::KeyRetired(_))
    ));

    let tx = transaction("tx-new");
    vault.mutate_field(&tx, "memo", FieldValue::text("after rotation")).unwrap();
    assert_sealed_under(&vault, &tx, &job.new_key_id);
}

#[tokio::test]
async fn test_cancelled_rotation_can_be_rolled_back() {
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let vault = seeded(&backend);
    let old_key = vault.keys().active_record(&acme()).unwrap().key_id;
    let job = vault.rotate_key(&acme()).unwrap();

    let control = RotationControl::new();
    control.cancel();
    let report = vault.run_rotation(&acme(), &job.job_id, &control).await.unwrap();
    assert!(!report.finished);
    assert_eq!(report.entities_visited, 0);

    let report = vault.rollback_rotation(&acme(), &job.job_id).await.unwrap();
    assert_eq!(report.job.status, RotationStatus::RolledBack);
    assert_eq!(vault.keys().active_record(&acme()).unwrap().key_id, old_key);
    for i in 0..ENTITIES {
        assert_sealed_under(&vault, &transaction(&format!("tx-{}", i)), &old_key);
    }
    assert!(vault.in_flight_rotation(&acme()).unwrap().is_none());
}

/// Start a rotation on every vault at once, one thread each
fn race_rotations(vaults: Vec<Arc<Vault>>) -> Vec<Result<KeyRotationJob, VaultError>> {
    let barrier = Arc::new(Barrier::new(vaults.len()));
    let handles: Vec<_> = vaults
        .into_iter()
        .map(|vault| {
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                vault.rotate_key(&acme())
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

fn assert_one_winner(results: &[Result<KeyRotationJob, VaultError>]) -> KeyRotationJob {
    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1, "expected exactly one rotation to start: {:?}", results);
    let refused = results
        .iter()
        .filter(|r| matches!(r, Err(VaultError::RotationInProgress { .. })))
        .count();
    assert_eq!(refused, results.len() - 1, "{:?}", results);
    winners[0].clone()
}

#[test]
fn test_concurrent_rotations_on_one_session() {
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let vault = Arc::new(seeded(&backend));
    let results = race_rotations(vec![vault.clone(), vault.clone()]);
    let job = assert_one_winner(&results);
    assert_eq!(vault.in_flight_rotation(&acme()).unwrap().unwrap().job_id, job.job_id);
}

#[test]
fn test_concurrent_rotations_from_two_sessions_on_one_store() {
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let first = Arc::new(seeded(&backend));
    // A second session has its own write lock; only the stored guard is shared
    let second = Arc::new(open(&backend));
    let results = race_rotations(vec![first.clone(), second.clone()]);
    let job = assert_one_winner(&results);
    assert_eq!(second.in_flight_rotation(&acme()).unwrap().unwrap().job_id, job.job_id);
}

#[test]
fn test_stored_guard_alone_refuses_a_second_claim() {
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let vault = seeded(&backend);

    // Another session claimed the guard but its job is not visible yet
    let claimed = JobId::new("job-claimed-elsewhere");
    let mut batch = WriteBatch::new();
    vault
        .store()
        .stage_insert(&mut batch, Table::RotationLocks, &acme(), ROTATION_LOCK_KEY, &claimed)
        .unwrap();
    vault.store().commit(batch).unwrap();
    assert!(vault.in_flight_rotation(&acme()).unwrap().is_none());

    let active = vault.keys().active_record(&acme()).unwrap().key_id;
    match vault.rotate_key(&acme()) {
        Err(VaultError::RotationInProgress { job_id, .. }) => assert_eq!(job_id, claimed.to_string()),
        other => panic!("expected RotationInProgress, got {:?}", other),
    }
    // The refused claim left nothing behind
    assert_eq!(vault.keys().active_record(&acme()).unwrap().key_id, active);
    assert!(vault.in_flight_rotation(&acme()).unwrap().is_none());
}
