//! Key session: the unlocked state of a vault.
//!
//! Holds the master key for as long as the vault is unlocked and caches
//! unwrapped data keys. [`KeySession::lock`] drops both, zeroizing the
//! material.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use super::data_key::{DataKey, KeyRecord, KeyStatus};
use super::master_key::{derive_master_key, KdfParams, MasterKey, PassphraseVerifier, KEY_LENGTH};
use super::rotation::{KeyRotationJob, RotationDirection, ROTATION_LOCK_KEY};
use crate::config::KeyConfig;
use crate::core_store::model::{CompanyId, JobId, KeyId, Timestamp};
use crate::core_store::store::{LocalStore, ScanRange, Table, WriteBatch};
use crate::core_store::TimeSource;
use crate::errors::{handle_poison, VaultError, VaultResult};

const KDF_PARAMS_KEY: &str = "kdf_params";
const VERIFIER_KEY: &str = "passphrase_verifier";
const PROVISIONED_KEY: &str = "provisioned";
const KEY_SCAN_LIMIT: usize = 256;

/// Unlocked key state for one vault
pub struct KeySession {
    store: Arc<LocalStore>,
    master: RwLock<Option<MasterKey>>,
    cache: RwLock<HashMap<(CompanyId, KeyId), Arc<DataKey>>>,
    grace_period: Duration,
    time: Arc<dyn TimeSource>,
}

impl KeySession {
    /// Derive the master key and open the session.
    ///
    /// The first unlock of a fresh store generates and persists the KDF
    /// parameters and a passphrase verifier; later unlocks re-derive with the
    /// stored parameters and fail with `Integrity` for the wrong passphrase.
    pub fn unlock(
        store: Arc<LocalStore>,
        passphrase: &str,
        config: &KeyConfig,
        time: Arc<dyn TimeSource>,
    ) -> VaultResult<Self> {
        let system = CompanyId::system();
        let stored: Option<KdfParams> = store.get_record(Table::Meta, &system, KDF_PARAMS_KEY)?;

        let master = match stored {
            Some(params) => {
                params.validate(config.allow_insecure_kdf)?;
                let master = derive_master_key(passphrase, &params)?;
                let verifier: PassphraseVerifier = store
                    .get_record(Table::Meta, &system, VERIFIER_KEY)?
                    .ok_or_else(|| {
                        VaultError::Integrity("passphrase verifier is missing".into())
                    })?;
                if let Err(e) = master.check_verifier(&verifier) {
                    warn!("Unlock rejected: passphrase does not match");
                    return Err(e);
                }
                master
            }
            None => {
                let params = KdfParams::generate(
                    config.kdf_memory_kib,
                    config.kdf_iterations,
                    config.kdf_parallelism,
                );
                params.validate(config.allow_insecure_kdf)?;
                let master = derive_master_key(passphrase, &params)?;

                let mut batch = WriteBatch::new();
                store.stage_insert(&mut batch, Table::Meta, &system, KDF_PARAMS_KEY, &params)?;
                store.stage_insert(
                    &mut batch,
                    Table::Meta,
                    &system,
                    VERIFIER_KEY,
                    &master.verifier()?,
                )?;
                store.commit(batch)?;
                info!("Initialized vault key material");
                master
            }
        };

        info!("Key session unlocked");
        Ok(KeySession {
            store,
            master: RwLock::new(Some(master)),
            cache: RwLock::new(HashMap::new()),
            grace_period: config.grace_period,
            time,
        })
    }

    /// Destroy the master key and every cached data key
    pub fn lock(&self) -> VaultResult<()> {
        self.master.write().map_err(handle_poison)?.take();
        self.cache.write().map_err(handle_poison)?.clear();
        info!("Key session locked");
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.master.read().map(|m| m.is_none()).unwrap_or(true)
    }

    pub fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.time.now_ms())
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    fn with_master<R>(&self, f: impl FnOnce(&MasterKey) -> VaultResult<R>) -> VaultResult<R> {
        let guard = self.master.read().map_err(handle_poison)?;
        let master = guard.as_ref().ok_or(VaultError::SessionLocked)?;
        f(master)
    }

    fn ensure_unlocked(&self) -> VaultResult<()> {
        if self.is_locked() {
            return Err(VaultError::SessionLocked);
        }
        Ok(())
    }

    // ===== Key records =====

    pub fn key_record(&self, company: &CompanyId, key_id: &KeyId) -> VaultResult<Option<KeyRecord>> {
        self.store.get_record(Table::Keys, company, key_id.as_str())
    }

    pub fn key_records(&self, company: &CompanyId) -> VaultResult<Vec<KeyRecord>> {
        let mut records = Vec::new();
        let mut after = None;
        loop {
            let batch: Vec<(String, KeyRecord)> = self.store.scan_records(
                Table::Keys,
                company,
                &ScanRange::new(KEY_SCAN_LIMIT).after_opt(after.clone()),
            )?;
            let done = batch.len() < KEY_SCAN_LIMIT;
            after = batch.last().map(|(k, _)| k.clone());
            records.extend(batch.into_iter().map(|(_, r)| r));
            if done {
                return Ok(records);
            }
        }
    }

    pub fn active_record(&self, company: &CompanyId) -> VaultResult<KeyRecord> {
        self.key_records(company)?
            .into_iter()
            .find(|r| r.status == KeyStatus::Active)
            .ok_or_else(|| VaultError::KeyNotFound(format!("no active key for company {}", company)))
    }

    /// Job currently holding the company's rotation guard
    pub fn in_flight_job(&self, company: &CompanyId) -> VaultResult<Option<KeyRotationJob>> {
        let job_id: Option<JobId> = self.store.get_record(Table::RotationLocks, company, ROTATION_LOCK_KEY)?;
        match job_id {
            Some(job_id) => self.store.get_record(Table::RotationJobs, company, job_id.as_str()),
            None => Ok(None),
        }
    }

    // ===== Data keys =====

    /// Generate the first active key for a company.
    ///
    /// Idempotent: returns the existing active key if there is one. `extra`
    /// may stage more writes (an audit entry) into the provisioning batch.
    pub fn provision_company(
        &self,
        company: &CompanyId,
        extra: impl FnOnce(&mut WriteBatch, &DataKey) -> VaultResult<()>,
    ) -> VaultResult<KeyId> {
        company.validate()?;
        self.ensure_unlocked()?;
        if let Ok(active) = self.active_record(company) {
            return Ok(active.key_id);
        }

        let (record, key) = self.generate_key(company, KeyStatus::Active)?;
        let mut batch = WriteBatch::new();
        self.store
            .stage_insert(&mut batch, Table::Meta, company, PROVISIONED_KEY, &record.key_id)?;
        self.store
            .stage_put(&mut batch, Table::Keys, company, record.key_id.as_str(), &record)?;
        extra(&mut batch, &key)?;

        match self.store.commit(batch) {
            Ok(()) => {
                info!(company = %company, key_id = %record.key_id, "Provisioned company data key");
                Ok(record.key_id)
            }
            Err(VaultError::AlreadyExists(_)) => Ok(self.active_record(company)?.key_id),
            Err(e) => Err(e),
        }
    }

    /// Any key that may still decrypt
    pub fn data_key(&self, company: &CompanyId, key_id: &KeyId) -> VaultResult<Arc<DataKey>> {
        self.ensure_unlocked()?;
        let now = self.now();
        let cache_key = (company.clone(), key_id.clone());
        if let Some(key) = self.cache.read().map_err(handle_poison)?.get(&cache_key) {
            if key.status().can_decrypt(now) {
                return Ok(key.clone());
            }
        }

        let record = self
            .key_record(company, key_id)?
            .ok_or_else(|| VaultError::KeyNotFound(format!("{} (company {})", key_id, company)))?;
        if !record.status.can_decrypt(now) {
            return Err(VaultError::KeyNotFound(format!(
                "{} is {} (company {})",
                key_id,
                record.status.name(),
                company
            )));
        }
        let wrapped = record
            .wrapped
            .as_ref()
            .ok_or_else(|| VaultError::KeyNotFound(format!("{} has no key material", key_id)))?;

        let material = self
            .with_master(|master| master.unwrap(company, key_id, wrapped))
            .map_err(|e| {
                if let VaultError::Integrity(reason) = &e {
                    error!(company = %company, key_id = %key_id, reason = %reason, "Data key failed to unwrap");
                    crate::metrics::record_integrity_failure();
                }
                e
            })?;
        let key = Arc::new(DataKey::new(key_id.clone(), company.clone(), record.status, material));
        self.cache
            .write()
            .map_err(handle_poison)?
            .insert(cache_key, key.clone());
        debug!(company = %company, key_id = %key_id, "Unwrapped data key");
        Ok(key)
    }

    /// The company's active key
    pub fn unwrap_data_key(&self, company: &CompanyId) -> VaultResult<Arc<DataKey>> {
        let active = self.active_record(company)?;
        self.data_key(company, &active.key_id)
    }

    /// Key new ciphertext must use: the pending key during a forward
    /// rotation, otherwise the active key
    pub fn write_key(&self, company: &CompanyId) -> VaultResult<Arc<DataKey>> {
        if let Some(job) = self.in_flight_job(company)? {
            if job.direction == RotationDirection::Forward {
                return self.data_key(company, &job.new_key_id);
            }
        }
        self.unwrap_data_key(company)
    }

    /// Destroy retired keys whose grace period ended at or before `now`.
    ///
    /// `extra` sees the purged ids and may stage more writes into the same
    /// batch; it is not called when nothing expired.
    pub fn purge_expired_keys(
        &self,
        company: &CompanyId,
        now: Timestamp,
        extra: impl FnOnce(&mut WriteBatch, &[KeyId]) -> VaultResult<()>,
    ) -> VaultResult<Vec<KeyId>> {
        let mut batch = WriteBatch::new();
        let mut purged = Vec::new();
        for mut record in self.key_records(company)? {
            if let KeyStatus::Retired { expires_at, .. } = record.status {
                if expires_at <= now {
                    record.destroy(now);
                    self.store
                        .stage_put(&mut batch, Table::Keys, company, record.key_id.as_str(), &record)?;
                    purged.push(record.key_id.clone());
                }
            }
        }
        if purged.is_empty() {
            return Ok(purged);
        }
        extra(&mut batch, &purged)?;
        self.store.commit(batch)?;
        for key_id in &purged {
            self.invalidate(company, key_id)?;
            info!(company = %company, key_id = %key_id, "Destroyed expired data key");
        }
        Ok(purged)
    }

    /// Fresh key material, wrapped; the record is not persisted
    pub(crate) fn generate_key(
        &self,
        company: &CompanyId,
        status: KeyStatus,
    ) -> VaultResult<(KeyRecord, DataKey)> {
        let key_id = KeyId::generate();
        let material = Zeroizing::new(rand::random::<[u8; KEY_LENGTH]>());
        let wrapped = self.with_master(|master| master.wrap(company, &key_id, &material))?;
        let record = KeyRecord {
            key_id: key_id.clone(),
            company_id: company.clone(),
            status,
            wrapped: Some(wrapped),
            created_at: self.now(),
        };
        Ok((record, DataKey::new(key_id, company.clone(), status, material)))
    }

    /// Drop a cached key so its status is re-read
    pub(crate) fn invalidate(&self, company: &CompanyId, key_id: &KeyId) -> VaultResult<()> {
        self.cache
            .write()
            .map_err(handle_poison)?
            .remove(&(company.clone(), key_id.clone()));
        Ok(())
    }
}

impl std::fmt::Debug for KeySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySession")
            .field("locked", &self.is_locked())
            .field("grace_period", &self.grace_period)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::store::{MemoryBackend, StoreLimits};
    use crate::core_store::ManualTimeSource;
    use crate::test_utils::{test_config, TEST_PASSPHRASE};

    fn store() -> Arc<LocalStore> {
        Arc::new(LocalStore::new(Arc::new(MemoryBackend::new()), StoreLimits::default()))
    }

    fn unlock(store: Arc<LocalStore>, passphrase: &str) -> VaultResult<KeySession> {
        KeySession::unlock(
            store,
            passphrase,
            &test_config().keys,
            Arc::new(ManualTimeSource::new(1_000)),
        )
    }

    fn no_extra(_: &mut WriteBatch, _: &DataKey) -> VaultResult<()> {
        Ok(())
    }

    #[test]
    fn test_provision_is_idempotent() {
        let session = unlock(store(), TEST_PASSPHRASE).unwrap();
        let acme = CompanyId::new("acme");
        let first = session.provision_company(&acme, no_extra).unwrap();
        let second = session.provision_company(&acme, no_extra).unwrap();
        assert_eq!(first, second);
        assert_eq!(session.key_records(&acme).unwrap().len(), 1);
    }

    #[test]
    fn test_wrong_passphrase_rejected_on_reopen() {
        let store = store();
        unlock(store.clone(), TEST_PASSPHRASE).unwrap();
        assert!(matches!(
            unlock(store, "Different-pass-42"),
            Err(VaultError::Integrity(_))
        ));
    }

    #[test]
    fn test_weak_passphrase_rejected() {
        assert!(matches!(
            unlock(store(), "password"),
            Err(VaultError::WeakPassphrase(_))
        ));
    }

    #[test]
    fn test_keys_survive_reopen() {
        let store = store();
        let acme = CompanyId::new("acme");
        let key_id = {
            let session = unlock(store.clone(), TEST_PASSPHRASE).unwrap();
            session.provision_company(&acme, no_extra).unwrap()
        };
        let session = unlock(store, TEST_PASSPHRASE).unwrap();
        assert_eq!(session.unwrap_data_key(&acme).unwrap().key_id(), &key_id);
    }

    #[test]
    fn test_lock_blocks_key_access() {
        let session = unlock(store(), TEST_PASSPHRASE).unwrap();
        let acme = CompanyId::new("acme");
        session.provision_company(&acme, no_extra).unwrap();
        session.lock().unwrap();
        assert!(session.is_locked());
        assert!(matches!(
            session.unwrap_data_key(&acme),
            Err(VaultError::SessionLocked)
        ));
    }

    #[test]
    fn test_unknown_company_has_no_key() {
        let session = unlock(store(), TEST_PASSPHRASE).unwrap();
        assert!(matches!(
            session.write_key(&CompanyId::new("nobody")),
            Err(VaultError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_tampered_wrapped_key_is_integrity_error() {
        let store = store();
        let session = unlock(store.clone(), TEST_PASSPHRASE).unwrap();
        let acme = CompanyId::new("acme");
        let key_id = session.provision_company(&acme, no_extra).unwrap();

        let mut record = session.key_record(&acme, &key_id).unwrap().unwrap();
        if let Some(wrapped) = record.wrapped.as_mut() {
            wrapped.ciphertext[3] ^= 0x80;
        }
        let mut batch = WriteBatch::new();
        store
            .stage_put(&mut batch, Table::Keys, &acme, key_id.as_str(), &record)
            .unwrap();
        store.commit(batch).unwrap();

        let fresh = unlock(store, TEST_PASSPHRASE).unwrap();
        assert!(matches!(
            fresh.data_key(&acme, &key_id),
            Err(VaultError::Integrity(_))
        ));
    }

    #[test]
    fn test_purge_expired_keys() {
        let store = store();
        let session = unlock(store.clone(), TEST_PASSPHRASE).unwrap();
        let acme = CompanyId::new("acme");
        session.provision_company(&acme, no_extra).unwrap();

        let (mut retired, _) = session.generate_key(&acme, KeyStatus::Active).unwrap();
        retired.status = KeyStatus::Retired {
            retired_at: Timestamp::from_millis(10),
            expires_at: Timestamp::from_millis(500),
        };
        let mut batch = WriteBatch::new();
        store
            .stage_put(&mut batch, Table::Keys, &acme, retired.key_id.as_str(), &retired)
            .unwrap();
        store.commit(batch).unwrap();

        assert!(session
            .purge_expired_keys(&acme, Timestamp::from_millis(100), |_, _| Ok(()))
            .unwrap()
            .is_empty());
        let purged = session
            .purge_expired_keys(&acme, Timestamp::from_millis(500), |_, _| Ok(()))
            .unwrap();
        assert_eq!(purged, vec![retired.key_id.clone()]);
        assert!(matches!(
            session.data_key(&acme, &retired.key_id),
            Err(VaultError::KeyNotFound(_))
        ));
    }
}
