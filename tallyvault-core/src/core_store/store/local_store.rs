/*
    local_store.rs - Typed access to the storage backend

    Wraps an injected StorageBackend with:
    - bincode encoding of records
    - entity, operation log, sequence and quota accessors
    - bounded pagination

    Writes are never applied directly: callers stage them into a WriteBatch
    and commit the batch as one atomic unit.
*/

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use super::backend::{ScanRange, StorageBackend, Table, WriteBatch};
use crate::core_store::entity::Entity;
use crate::core_store::model::{CompanyId, DeviceId, EntityKind, EntityRef, OpId};
use crate::core_store::oplog::OperationLogEntry;
use crate::errors::{VaultError, VaultResult};

const ENTITY_COUNT_KEY: &str = "entity_count";

/// Store-level limits
#[derive(Debug, Clone, Copy)]
pub struct StoreLimits {
    pub max_page_size: usize,
    pub default_page_size: usize,
    pub max_entities_per_company: u64,
}

impl Default for StoreLimits {
    fn default() -> Self {
        StoreLimits {
            max_page_size: 500,
            default_page_size: 50,
            max_entities_per_company: 1_000_000,
        }
    }
}

/// Cursor-based page request; `after` is the last key of the previous page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    pub after: Option<String>,
    /// 0 means the default page size
    pub limit: usize,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        PageRequest { after: None, limit }
    }

    pub fn after(cursor: impl Into<String>, limit: usize) -> Self {
        PageRequest {
            after: Some(cursor.into()),
            limit,
        }
    }
}

/// One page of results
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Cursor for the next page, `None` when exhausted
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Page {
            items: Vec::new(),
            next_cursor: None,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            next_cursor: self.next_cursor,
        }
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> VaultResult<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> VaultResult<T> {
    Ok(bincode::deserialize(bytes)?)
}

fn seq_key(device: &DeviceId) -> String {
    format!("seq/{}", device)
}

/// Typed store over an injected backend
pub struct LocalStore {
    backend: Arc<dyn StorageBackend>,
    limits: StoreLimits,
}

impl LocalStore {
    pub fn new(backend: Arc<dyn StorageBackend>, limits: StoreLimits) -> Self {
        LocalStore { backend, limits }
    }

    pub fn limits(&self) -> &StoreLimits {
        &self.limits
    }

    /// Effective page size for a request
    pub fn clamp(&self, page: &PageRequest) -> usize {
        let requested = if page.limit == 0 {
            self.limits.default_page_size
        } else {
            page.limit
        };
        requested.clamp(1, self.limits.max_page_size.max(1))
    }

    pub fn commit(&self, batch: WriteBatch) -> VaultResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.backend.commit(batch)
    }

    // ===== Generic record access =====

    pub fn get_record<T: DeserializeOwned>(
        &self,
        table: Table,
        company: &CompanyId,
        key: &str,
    ) -> VaultResult<Option<T>> {
        match self.backend.get(table, company, key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn stage_put<T: Serialize>(
        &self,
        batch: &mut WriteBatch,
        table: Table,
        company: &CompanyId,
        key: impl Into<String>,
        value: &T,
    ) -> VaultResult<()> {
        batch.put(table, company, key, encode(value)?);
        Ok(())
    }

    pub fn stage_insert<T: Serialize>(
        &self,
        batch: &mut WriteBatch,
        table: Table,
        company: &CompanyId,
        key: impl Into<String>,
        value: &T,
    ) -> VaultResult<()> {
        batch.insert(table, company, key, encode(value)?);
        Ok(())
    }

    pub fn scan_records<T: DeserializeOwned>(
        &self,
        table: Table,
        company: &CompanyId,
        range: &ScanRange,
    ) -> VaultResult<Vec<(String, T)>> {
        self.backend
            .scan(table, company, range)?
            .into_iter()
            .map(|(key, bytes)| Ok((key, decode(&bytes)?)))
            .collect()
    }

    /// Undecoded records, for checks that must survive corrupt values
    pub fn scan_raw(
        &self,
        table: Table,
        company: &CompanyId,
        range: &ScanRange,
    ) -> VaultResult<Vec<(String, Vec<u8>)>> {
        self.backend.scan(table, company, range)
    }

    /// Page through a table, optionally restricted to a key prefix
    pub fn page_records<T: DeserializeOwned>(
        &self,
        table: Table,
        company: &CompanyId,
        prefix: Option<&str>,
        page: &PageRequest,
    ) -> VaultResult<Page<(String, T)>> {
        let limit = self.clamp(page);
        let mut range = ScanRange::new(limit).after_opt(page.after.clone());
        if let Some(prefix) = prefix {
            range = range.prefix(prefix);
        }
        let items: Vec<(String, T)> = self.scan_records(table, company, &range)?;
        let next_cursor = if items.len() == limit {
            items.last().map(|(key, _)| key.clone())
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }

    // ===== Entities =====

    pub fn get_entity(&self, entity: &EntityRef) -> VaultResult<Option<Entity>> {
        self.get_record(Table::Entities, &entity.company_id, &entity.storage_key())
    }

    pub fn stage_entity(&self, batch: &mut WriteBatch, entity: &Entity) -> VaultResult<()> {
        let r = &entity.entity_ref;
        self.stage_put(batch, Table::Entities, &r.company_id, r.storage_key(), entity)
    }

    pub fn list_entities(
        &self,
        company: &CompanyId,
        kind: Option<EntityKind>,
        page: &PageRequest,
    ) -> VaultResult<Page<Entity>> {
        let prefix = kind.map(|k| format!("{}/", k.as_str()));
        Ok(self
            .page_records::<Entity>(Table::Entities, company, prefix.as_deref(), page)?
            .map(|(_, entity)| entity))
    }

    pub fn entity_count(&self, company: &CompanyId) -> VaultResult<u64> {
        Ok(self
            .get_record(Table::Meta, company, ENTITY_COUNT_KEY)?
            .unwrap_or(0))
    }

    /// Stage the count increment for a newly created entity, enforcing the quota
    pub fn stage_new_entity(&self, batch: &mut WriteBatch, company: &CompanyId) -> VaultResult<()> {
        let count = self.entity_count(company)?;
        if count >= self.limits.max_entities_per_company {
            return Err(VaultError::QuotaExceeded(format!(
                "company {} already holds {} entities",
                company, count
            )));
        }
        self.stage_put(batch, Table::Meta, company, ENTITY_COUNT_KEY, &(count + 1))
    }

    // ===== Operation log =====

    pub fn get_op(&self, company: &CompanyId, op_id: &OpId) -> VaultResult<Option<OperationLogEntry>> {
        self.get_record(Table::OperationLog, company, &op_id.storage_key())
    }

    pub fn has_op(&self, company: &CompanyId, op_id: &OpId) -> VaultResult<bool> {
        Ok(self
            .backend
            .get(Table::OperationLog, company, &op_id.storage_key())?
            .is_some())
    }

    pub fn stage_op(&self, batch: &mut WriteBatch, op: &OperationLogEntry) -> VaultResult<()> {
        self.stage_insert(
            batch,
            Table::OperationLog,
            &op.entity.company_id,
            op.op_id.storage_key(),
            op,
        )
    }

    /// A device's ops with `seq > after_seq`, in sequence order
    pub fn ops_by_device(
        &self,
        company: &CompanyId,
        device: &DeviceId,
        after_seq: u64,
        limit: usize,
    ) -> VaultResult<Vec<OperationLogEntry>> {
        let range = ScanRange::new(limit.min(self.limits.max_page_size.max(1)))
            .prefix(format!("{}:", device))
            .after(OpId::new(device.clone(), after_seq).storage_key());
        Ok(self
            .scan_records::<OperationLogEntry>(Table::OperationLog, company, &range)?
            .into_iter()
            .map(|(_, op)| op)
            .collect())
    }

    // ===== Device sequence counters =====

    /// Highest sequence this device has used in the company
    pub fn device_seq(&self, company: &CompanyId, device: &DeviceId) -> VaultResult<u64> {
        Ok(self
            .get_record(Table::Meta, company, &seq_key(device))?
            .unwrap_or(0))
    }

    pub fn stage_device_seq(
        &self,
        batch: &mut WriteBatch,
        company: &CompanyId,
        device: &DeviceId,
        seq: u64,
    ) -> VaultResult<()> {
        self.stage_put(batch, Table::Meta, company, seq_key(device), &seq)
    }
}
