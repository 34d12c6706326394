/*
    vault - Per-device vault session

    Wires the subsystems together for one device:
    - key session (unlocked with the passphrase) and rotation runner
    - field cipher, merge engine and conflict store
    - audit trail sharing the store's write batches

    Local mutations are synchronous and serialised by one write lock shared
    with the rotation runner. Every mutation commits its entity state, op-log
    entry and audit entry as a single batch.
*/

mod conflicts;
mod rotation;
mod writes;

pub use conflicts::{ConflictSummary, FieldSelections};
pub use writes::{ApplyReport, EntitySnapshot, EntitySummary, FieldView, RejectedOp};

use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::config::Config;
use crate::core_audit::{AuditAction, AuditEvent, AuditFilter, AuditRecord, AuditTrail, ChainVerification};
use crate::core_conflict::ConflictStore;
use crate::core_crdt::{MergeEngine, ValueComparator};
use crate::core_crypto::{BatchLimiter, EncryptedField, FieldCipher};
use crate::core_keys::{DataKey, KeySession, RotationRunner};
use crate::core_store::clock::{HybridClock, SystemTimeSource, TimeSource};
use crate::core_store::model::{CompanyId, DeviceId, EntityRef, KeyId, Timestamp};
use crate::core_store::store::{LocalStore, Page, SqliteBackend, StorageBackend};
use crate::errors::{handle_poison, VaultResult};

/// Assembles a [`Vault`] for one device
pub struct VaultBuilder {
    device: DeviceId,
    config: Config,
    backend: Option<Arc<dyn StorageBackend>>,
    time: Arc<dyn TimeSource>,
}

impl VaultBuilder {
    pub fn new(device: impl Into<DeviceId>) -> Self {
        VaultBuilder {
            device: device.into(),
            config: Config::default(),
            backend: None,
            time: Arc::new(SystemTimeSource),
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Storage to use instead of the SQLite file named by the config
    pub fn backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    /// Unlock the vault with the user's passphrase
    pub fn open(self, passphrase: &str) -> VaultResult<Vault> {
        self.device.validate()?;
        self.config.validate()?;
        let policy = self.config.conflicts.policy()?;

        let backend = match self.backend {
            Some(backend) => backend,
            None => {
                let path = self.config.store.database_path();
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Arc::new(SqliteBackend::open(&path, self.config.store.pool_size)?)
            }
        };

        let store = Arc::new(LocalStore::new(backend, self.config.store.limits()));
        let keys = Arc::new(KeySession::unlock(
            store.clone(),
            passphrase,
            &self.config.keys,
            self.time.clone(),
        )?);
        let cipher = FieldCipher::new(self.config.crypto.algorithm, self.config.store.max_field_bytes);
        let audit = Arc::new(AuditTrail::new(
            store.clone(),
            self.config.audit.retention,
            self.config.crypto.algorithm,
        ));
        let limiter = Arc::new(BatchLimiter::new(self.config.crypto.batch_limits()));
        let write_lock = Arc::new(Mutex::new(()));
        let rotation = RotationRunner::new(
            store.clone(),
            keys.clone(),
            audit.clone(),
            cipher.clone(),
            limiter,
            write_lock.clone(),
            self.device.clone(),
            self.config.keys.rotation_page_size,
        );

        info!(device = %self.device, "Vault opened");
        Ok(Vault {
            clock: Arc::new(HybridClock::new(self.time, self.config.sync.max_clock_drift)),
            conflicts: ConflictStore::new(store.clone()),
            merge: MergeEngine::new(policy),
            device: self.device,
            config: self.config,
            store,
            keys,
            cipher,
            audit,
            rotation,
            write_lock,
        })
    }
}

/// An unlocked vault session on one device
pub struct Vault {
    device: DeviceId,
    config: Config,
    store: Arc<LocalStore>,
    keys: Arc<KeySession>,
    cipher: FieldCipher,
    clock: Arc<HybridClock>,
    merge: MergeEngine,
    audit: Arc<AuditTrail>,
    conflicts: ConflictStore,
    rotation: RotationRunner,
    write_lock: Arc<Mutex<()>>,
}

impl Vault {
    pub fn device_id(&self) -> &DeviceId {
        &self.device
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn keys(&self) -> &Arc<KeySession> {
        &self.keys
    }

    pub fn now(&self) -> Timestamp {
        self.clock.physical_now()
    }

    /// Generate the company's first data key. Idempotent.
    pub fn provision_company(&self, company: &CompanyId) -> VaultResult<KeyId> {
        let _guard = self.write_lock.lock().map_err(handle_poison)?;
        let now = self.now();
        self.keys.provision_company(company, |batch, key| {
            let event = AuditEvent::new(self.device.clone(), AuditAction::KeyProvisioned)
                .key(key.key_id().clone());
            self.audit.stage(batch, company, &event, key, now)?;
            Ok(())
        })
    }

    /// Destroy retired keys past their grace period
    pub fn purge_expired_keys(&self, company: &CompanyId) -> VaultResult<Vec<KeyId>> {
        let _guard = self.write_lock.lock().map_err(handle_poison)?;
        let now = self.now();
        let audit_key = self.audit_key(company)?;
        self.keys.purge_expired_keys(company, now, |batch, purged| {
            let ids: Vec<String> = purged.iter().map(|k| k.to_string()).collect();
            let event = AuditEvent::new(self.device.clone(), AuditAction::KeysPurged)
                .detail(ids.join(","));
            self.audit.stage(batch, company, &event, &audit_key, now)?;
            Ok(())
        })
    }

    /// Filtered page of a company's audit entries
    pub fn get_audit_trail(&self, company: &CompanyId, filter: &AuditFilter) -> VaultResult<Page<AuditRecord>> {
        self.audit.query(company, filter, &self.keys)
    }

    pub fn verify_audit_chain(&self, company: &CompanyId) -> VaultResult<ChainVerification> {
        let verification = self.audit.verify_chain(company)?;
        if !verification.intact {
            warn!(
                company = %company,
                seq = ?verification.first_broken_seq,
                "Audit chain verification failed"
            );
        }
        Ok(verification)
    }

    /// Drop the master key and cached data keys. Every later call that
    /// needs a key fails with `SessionLocked`.
    pub fn lock(&self) -> VaultResult<()> {
        let _guard = self.write_lock.lock().map_err(handle_poison)?;
        self.keys.lock()?;
        info!(device = %self.device, "Vault locked");
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.keys.is_locked()
    }

    fn comparator(&self) -> SealedComparator<'_> {
        SealedComparator {
            keys: &self.keys,
            cipher: &self.cipher,
        }
    }

    /// Audit key: always the active key, so entries outlive a rolled back rotation
    fn audit_key(&self, company: &CompanyId) -> VaultResult<Arc<DataKey>> {
        self.keys.unwrap_data_key(company)
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("device", &self.device)
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// Compares sealed values by decrypting them with the session's keys
struct SealedComparator<'a> {
    keys: &'a KeySession,
    cipher: &'a FieldCipher,
}

impl ValueComparator for SealedComparator<'_> {
    fn same_value(
        &self,
        entity: &EntityRef,
        field: &str,
        a: &EncryptedField,
        b: &EncryptedField,
    ) -> VaultResult<bool> {
        let company = &entity.company_id;
        let key_a = self.keys.data_key(company, &a.key_id)?;
        let key_b = if b.key_id == a.key_id {
            key_a.clone()
        } else {
            self.keys.data_key(company, &b.key_id)?
        };
        let left = self.cipher.open(entity, field, a, &key_a)?;
        let right = self.cipher.open(entity, field, b, &key_b)?;
        Ok(left == right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_audit::AuditAction;
    use crate::core_store::store::MemoryBackend;
    use crate::errors::VaultError;
    use crate::test_utils::{acme, test_config, TEST_PASSPHRASE};

    fn open(backend: Arc<dyn StorageBackend>) -> VaultResult<Vault> {
        VaultBuilder::new("laptop")
            .config(test_config())
            .backend(backend)
            .open(TEST_PASSPHRASE)
    }

    #[test]
    fn test_provision_is_idempotent_and_audited() {
        let vault = open(Arc::new(MemoryBackend::new())).unwrap();
        let first = vault.provision_company(&acme()).unwrap();
        let second = vault.provision_company(&acme()).unwrap();
        assert_eq!(first, second);

        let trail = vault.get_audit_trail(&acme(), &AuditFilter::default()).unwrap();
        assert_eq!(trail.items.len(), 1);
        let event = trail.items[0].event.as_ref().unwrap();
        assert_eq!(event.action, AuditAction::KeyProvisioned);
        assert_eq!(event.key_id.as_ref(), Some(&first));
    }

    #[test]
    fn test_wrong_passphrase_rejected_on_reopen() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        open(backend.clone()).unwrap();
        let result = VaultBuilder::new("laptop")
            .config(test_config())
            .backend(backend)
            .open("a different but long passphrase!");
        assert!(matches!(result, Err(VaultError::Integrity(_))));
    }

    #[test]
    fn test_invalid_device_rejected() {
        let result = VaultBuilder::new("bad/device")
            .config(test_config())
            .backend(Arc::new(MemoryBackend::new()))
            .open(TEST_PASSPHRASE);
        assert!(matches!(result, Err(VaultError::Validation(_))));
    }

    #[test]
    fn test_lock_blocks_key_use() {
        let vault = open(Arc::new(MemoryBackend::new())).unwrap();
        vault.provision_company(&acme()).unwrap();
        vault.lock().unwrap();
        assert!(vault.is_locked());
        assert!(matches!(
            vault.provision_company(&CompanyId::new("globex")),
            Err(VaultError::SessionLocked)
        ));
    }

    #[test]
    fn test_fresh_chain_verifies() {
        let vault = open(Arc::new(MemoryBackend::new())).unwrap();
        vault.provision_company(&acme()).unwrap();
        let verification = vault.verify_audit_chain(&acme()).unwrap();
        assert!(verification.intact);
        assert_eq!(verification.entries_checked, 1);
    }
}
