//! Test fixtures for creating vault sessions
//!
//! Every fixture uses a deliberately cheap KDF so tests stay fast; never
//! use [`test_config`] outside tests.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::core_store::clock::{SystemTimeSource, TimeSource};
use crate::core_store::model::{CompanyId, EntityId, EntityKind, EntityRef};
use crate::core_store::store::{MemoryBackend, ScanRange, StorageBackend, Table, WriteBatch};
use crate::errors::VaultResult;
use crate::vault::{Vault, VaultBuilder};

/// Passphrase accepted by the strength policy
pub const TEST_PASSPHRASE: &str = "Correct-Horse-Battery-42";

const COPY_LIMIT: usize = 1_000;

/// Default config with a cheap KDF and fast sync retries
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.keys.kdf_memory_kib = 64;
    config.keys.kdf_iterations = 1;
    config.keys.kdf_parallelism = 1;
    config.keys.allow_insecure_kdf = true;
    config.keys.rotation_page_size = 2;
    config.crypto.batch_fields_per_second = 100_000;
    config.crypto.batch_burst = 100_000;
    config.sync.timeout = Duration::from_millis(500);
    config.sync.backoff_base = Duration::from_millis(5);
    config.sync.backoff_max = Duration::from_millis(20);
    config.sync.max_attempts = 3;
    config.sync.batch_size = 2;
    config.sync.interval = Duration::from_millis(20);
    config
}

pub fn acme() -> CompanyId {
    CompanyId::new("acme")
}

pub fn transaction(id: &str) -> EntityRef {
    EntityRef::new(acme(), EntityKind::Transaction, EntityId::new(id))
}

/// Unlocked vault on an in-memory store
pub fn memory_vault(device: &str) -> Vault {
    memory_vault_with(device, Arc::new(MemoryBackend::new()), Arc::new(SystemTimeSource))
        .expect("test vault opens")
}

pub fn memory_vault_with(
    device: &str,
    backend: Arc<dyn StorageBackend>,
    time: Arc<dyn TimeSource>,
) -> VaultResult<Vault> {
    VaultBuilder::new(device)
        .config(test_config())
        .backend(backend)
        .time_source(time)
        .open(TEST_PASSPHRASE)
}

/// Copy vault-wide KDF parameters and one company's wrapped keys into a
/// fresh store, as if the device had been restored from a backup of `from`.
/// Call before the first unlock of `to`.
pub fn share_key_material(
    from: &dyn StorageBackend,
    to: &dyn StorageBackend,
    company: &CompanyId,
) -> VaultResult<()> {
    let mut batch = WriteBatch::new();
    let system = CompanyId::system();
    for (key, value) in from.scan(Table::Meta, &system, &ScanRange::new(COPY_LIMIT))? {
        batch.put(Table::Meta, &system, key, value);
    }
    for (key, value) in from.scan(Table::Keys, company, &ScanRange::new(COPY_LIMIT))? {
        batch.put(Table::Keys, company, key, value);
    }
    if let Some(value) = from.get(Table::Meta, company, "provisioned")? {
        batch.put(Table::Meta, company, "provisioned", value);
    }
    to.commit(batch)
}

/// One vault per device name, all able to read each other's ciphertext
/// for `company`. The first device provisions the company.
pub fn paired_vaults(devices: &[&str], company: &CompanyId) -> VaultResult<Vec<Arc<Vault>>> {
    paired_vaults_with(devices, company, Arc::new(SystemTimeSource))
}

pub fn paired_vaults_with(
    devices: &[&str],
    company: &CompanyId,
    time: Arc<dyn TimeSource>,
) -> VaultResult<Vec<Arc<Vault>>> {
    let mut vaults = Vec::with_capacity(devices.len());
    let mut origin: Option<Arc<dyn StorageBackend>> = None;
    for device in devices {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        match &origin {
            Some(source) => share_key_material(source.as_ref(), backend.as_ref(), company)?,
            None => origin = Some(backend.clone()),
        }
        let vault = memory_vault_with(device, backend, time.clone())?;
        if vaults.is_empty() {
            vault.provision_company(company)?;
        }
        vaults.push(Arc::new(vault));
    }
    Ok(vaults)
}
