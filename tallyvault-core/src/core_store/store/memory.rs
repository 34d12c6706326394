/*
    memory.rs - In-memory storage backend

    Used by tests and ephemeral sessions. Clones share the same underlying
    maps, so dropping a Vault and opening a new one over a clone behaves
    like a process restart over the same disk.
*/

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use super::backend::{duplicate_key_error, ScanRange, StorageBackend, Table, WriteBatch, WriteKind};
use crate::core_store::model::CompanyId;
use crate::errors::{handle_poison, VaultResult};

type Partition = BTreeMap<String, Vec<u8>>;

/// Storage backend holding everything in process memory
#[derive(Clone, Default)]
pub struct MemoryBackend {
    partitions: Arc<Mutex<BTreeMap<(Table, CompanyId), Partition>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records stored for a company in a table
    pub fn len(&self, table: Table, company: &CompanyId) -> VaultResult<usize> {
        let partitions = self.partitions.lock().map_err(handle_poison)?;
        Ok(partitions
            .get(&(table, company.clone()))
            .map_or(0, |p| p.len()))
    }

    /// Replace a stored value, bypassing every check.
    ///
    /// Simulates out-of-band modification of the storage medium.
    #[doc(hidden)]
    pub fn overwrite_raw(
        &self,
        table: Table,
        company: &CompanyId,
        key: &str,
        value: Vec<u8>,
    ) -> VaultResult<()> {
        let mut partitions = self.partitions.lock().map_err(handle_poison)?;
        partitions
            .entry((table, company.clone()))
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, table: Table, company: &CompanyId, key: &str) -> VaultResult<Option<Vec<u8>>> {
        let partitions = self.partitions.lock().map_err(handle_poison)?;
        Ok(partitions
            .get(&(table, company.clone()))
            .and_then(|p| p.get(key).cloned()))
    }

    fn scan(
        &self,
        table: Table,
        company: &CompanyId,
        range: &ScanRange,
    ) -> VaultResult<Vec<(String, Vec<u8>)>> {
        let partitions = self.partitions.lock().map_err(handle_poison)?;
        let Some(partition) = partitions.get(&(table, company.clone())) else {
            return Ok(Vec::new());
        };
        Ok(partition
            .iter()
            .filter(|(key, _)| range.contains(key))
            .take(range.limit)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn commit(&self, batch: WriteBatch) -> VaultResult<()> {
        batch.check_append_only()?;
        let mut partitions = self.partitions.lock().map_err(handle_poison)?;

        // Validate every insert before touching anything
        let mut inserted: HashSet<(Table, &CompanyId, &str)> = HashSet::new();
        for op in batch.ops() {
            if let WriteKind::Insert(_) = op.kind {
                let exists = partitions
                    .get(&(op.table, op.company.clone()))
                    .is_some_and(|p| p.contains_key(&op.key));
                if exists || !inserted.insert((op.table, &op.company, op.key.as_str())) {
                    return Err(duplicate_key_error(op.table, &op.company, &op.key));
                }
            }
        }

        for op in batch.ops() {
            let partition = partitions.entry((op.table, op.company.clone())).or_default();
            match &op.kind {
                WriteKind::Put(value) | WriteKind::Insert(value) => {
                    partition.insert(op.key.clone(), value.clone());
                }
                WriteKind::Delete => {
                    partition.remove(&op.key);
                }
            }
        }
        Ok(())
    }
}
