//! SQLite storage backend
//!
//! One physical table per logical [`Table`], keyed by `(company_id, key)`.
//! Connections come from an r2d2 pool and every batch runs in a single SQL
//! transaction.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, ErrorCode, OptionalExtension};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::backend::{duplicate_key_error, ScanRange, StorageBackend, Table, WriteBatch, WriteKind};
use super::migrations;
use crate::core_store::model::CompanyId;
use crate::errors::{VaultError, VaultResult};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed storage
pub struct SqliteBackend {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteBackend {
    /// Open (or create) a database file and bring its schema up to date
    pub fn open(path: impl AsRef<Path>, pool_size: u32) -> VaultResult<Self> {
        let path = path.as_ref();
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
            conn.pragma_update(None, "synchronous", "NORMAL")
        });
        let pool = Pool::builder().max_size(pool_size.max(1)).build(manager)?;
        migrations::migrate(&pool)?;

        info!(path = %path.display(), pool_size, "Opened SQLite store");
        Ok(Self { pool })
    }

    /// Private in-memory database (single connection)
    pub fn memory() -> VaultResult<Self> {
        let pool = Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())?;
        migrations::migrate(&pool)?;
        Ok(Self { pool })
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

impl StorageBackend for SqliteBackend {
    fn get(&self, table: Table, company: &CompanyId, key: &str) -> VaultResult<Option<Vec<u8>>> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT value FROM {} WHERE company_id = ?1 AND key = ?2",
            table.name()
        );
        let value = conn
            .query_row(&sql, params![company.as_str(), key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn scan(
        &self,
        table: Table,
        company: &CompanyId,
        range: &ScanRange,
    ) -> VaultResult<Vec<(String, Vec<u8>)>> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT key, value FROM {} \
             WHERE company_id = ?1 AND key > ?2 AND substr(key, 1, length(?3)) = ?3 \
             ORDER BY key LIMIT ?4",
            table.name()
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(
            params![
                company.as_str(),
                range.after.as_deref().unwrap_or(""),
                range.prefix.as_deref().unwrap_or(""),
                range.limit as i64,
            ],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)),
        )?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn commit(&self, batch: WriteBatch) -> VaultResult<()> {
        batch.check_append_only()?;
        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;

        for op in batch.ops() {
            let table = op.table.name();
            match &op.kind {
                WriteKind::Put(value) => {
                    let sql = format!(
                        "INSERT INTO {} (company_id, key, value) VALUES (?1, ?2, ?3) \
                         ON CONFLICT(company_id, key) DO UPDATE SET value = excluded.value",
                        table
                    );
                    tx.execute(&sql, params![op.company.as_str(), op.key, value])?;
                }
                WriteKind::Insert(value) => {
                    let sql = format!(
                        "INSERT INTO {} (company_id, key, value) VALUES (?1, ?2, ?3)",
                        table
                    );
                    match tx.execute(&sql, params![op.company.as_str(), op.key, value]) {
                        Ok(_) => {}
                        Err(e) if is_constraint_violation(&e) => {
                            return Err(duplicate_key_error(op.table, &op.company, &op.key));
                        }
                        Err(e) => return Err(VaultError::from(e)),
                    }
                }
                WriteKind::Delete => {
                    let sql = format!("DELETE FROM {} WHERE company_id = ?1 AND key = ?2", table);
                    tx.execute(&sql, params![op.company.as_str(), op.key])?;
                }
            }
        }

        tx.commit()?;
        debug!(writes = batch.len(), "Committed batch");
        Ok(())
    }
}
