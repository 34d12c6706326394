/*
    backend.rs - Storage backend abstraction

    The vault never talks to a database directly. Everything goes through
    an injected StorageBackend that offers three primitives, all scoped by
    company and table:
    - get: point lookup
    - scan: ordered range read after a key, optionally under a prefix
    - commit: apply a WriteBatch atomically

    Append-only tables (operation log, audit log) refuse Put and Delete and
    refuse to re-insert an existing key.
*/

use crate::core_store::model::CompanyId;
use crate::errors::{VaultError, VaultResult};

/// Logical tables; each is partitioned by company
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Entities,
    OperationLog,
    Conflicts,
    AuditLog,
    Keys,
    RotationJobs,
    RotationLocks,
    Meta,
}

impl Table {
    pub const ALL: [Table; 8] = [
        Table::Entities,
        Table::OperationLog,
        Table::Conflicts,
        Table::AuditLog,
        Table::Keys,
        Table::RotationJobs,
        Table::RotationLocks,
        Table::Meta,
    ];

    /// Physical table name
    pub fn name(&self) -> &'static str {
        match self {
            Table::Entities => "entities",
            Table::OperationLog => "operation_log",
            Table::Conflicts => "conflicts",
            Table::AuditLog => "audit_log",
            Table::Keys => "data_keys",
            Table::RotationJobs => "rotation_jobs",
            Table::RotationLocks => "rotation_locks",
            Table::Meta => "meta",
        }
    }

    /// Records in these tables can be inserted once and never changed
    pub fn is_append_only(&self) -> bool {
        matches!(self, Table::OperationLog | Table::AuditLog)
    }
}

/// Kind of write in a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteKind {
    /// Create or overwrite
    Put(Vec<u8>),
    /// Create only; fails if the key exists
    Insert(Vec<u8>),
    Delete,
}

/// One write in a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOp {
    pub table: Table,
    pub company: CompanyId,
    pub key: String,
    pub kind: WriteKind,
}

/// Writes applied all-or-nothing by [`StorageBackend::commit`]
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        WriteBatch { ops: Vec::new() }
    }

    pub fn put(&mut self, table: Table, company: &CompanyId, key: impl Into<String>, value: Vec<u8>) {
        self.push(table, company, key.into(), WriteKind::Put(value));
    }

    pub fn insert(
        &mut self,
        table: Table,
        company: &CompanyId,
        key: impl Into<String>,
        value: Vec<u8>,
    ) {
        self.push(table, company, key.into(), WriteKind::Insert(value));
    }

    pub fn delete(&mut self, table: Table, company: &CompanyId, key: impl Into<String>) {
        self.push(table, company, key.into(), WriteKind::Delete);
    }

    fn push(&mut self, table: Table, company: &CompanyId, key: String, kind: WriteKind) {
        self.ops.push(WriteOp {
            table,
            company: company.clone(),
            key,
            kind,
        });
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of writes targeting `table`
    pub fn count(&self, table: Table) -> usize {
        self.ops.iter().filter(|op| op.table == table).count()
    }

    /// Reject writes that can never be valid regardless of stored state
    pub fn check_append_only(&self) -> VaultResult<()> {
        for op in &self.ops {
            if op.table.is_append_only() && !matches!(op.kind, WriteKind::Insert(_)) {
                return Err(VaultError::ImmutabilityViolation(format!(
                    "{} record {}/{} cannot be overwritten or deleted",
                    op.table.name(),
                    op.company,
                    op.key
                )));
            }
        }
        Ok(())
    }
}

/// Error for an Insert that found an existing key
pub fn duplicate_key_error(table: Table, company: &CompanyId, key: &str) -> VaultError {
    if table.is_append_only() {
        VaultError::ImmutabilityViolation(format!(
            "{} record {}/{} already exists",
            table.name(),
            company,
            key
        ))
    } else {
        VaultError::AlreadyExists(format!("{} record {}/{}", table.name(), company, key))
    }
}

/// Ordered range read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanRange {
    /// Exclusive lower bound
    pub after: Option<String>,
    /// Only keys starting with this prefix
    pub prefix: Option<String>,
    pub limit: usize,
}

impl ScanRange {
    pub fn new(limit: usize) -> Self {
        ScanRange {
            after: None,
            prefix: None,
            limit,
        }
    }

    pub fn after(mut self, key: impl Into<String>) -> Self {
        self.after = Some(key.into());
        self
    }

    pub fn after_opt(mut self, key: Option<String>) -> Self {
        self.after = key;
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Whether `key` falls inside the range bounds (ignoring the limit)
    pub fn contains(&self, key: &str) -> bool {
        let after_ok = self.after.as_deref().map_or(true, |after| key > after);
        let prefix_ok = self.prefix.as_deref().map_or(true, |p| key.starts_with(p));
        after_ok && prefix_ok
    }
}

/// Injected persistence layer
pub trait StorageBackend: Send + Sync {
    /// Point lookup
    fn get(&self, table: Table, company: &CompanyId, key: &str) -> VaultResult<Option<Vec<u8>>>;

    /// Up to `range.limit` records in ascending key order
    fn scan(
        &self,
        table: Table,
        company: &CompanyId,
        range: &ScanRange,
    ) -> VaultResult<Vec<(String, Vec<u8>)>>;

    /// Apply every write in the batch or none of them
    fn commit(&self, batch: WriteBatch) -> VaultResult<()>;
}
