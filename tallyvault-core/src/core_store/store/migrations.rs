//! Database migrations for the SQLite backend
//!
//! Provides versioned migrations for the vault storage schema.
//! Each migration is applied atomically and tracked in the schema_version table.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use tracing::info;

use crate::core_store::model::Timestamp;
use crate::errors::VaultResult;

/// Current schema version
pub const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Migration descriptor
pub struct Migration {
    pub version: i32,
    pub description: &'static str,
    pub up_sql: &'static str,
    pub down_sql: Option<&'static str>,
}

/// All available migrations in order
pub fn get_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Company-partitioned record tables",
            up_sql: r#"
                CREATE TABLE IF NOT EXISTS entities (
                    company_id TEXT NOT NULL,
                    key TEXT NOT NULL,                      -- <kind>/<entity id>
                    value BLOB NOT NULL,
                    PRIMARY KEY (company_id, key)
                ) WITHOUT ROWID;

                CREATE TABLE IF NOT EXISTS operation_log (
                    company_id TEXT NOT NULL,
                    key TEXT NOT NULL,                      -- <device>:<seq, zero padded>
                    value BLOB NOT NULL,
                    PRIMARY KEY (company_id, key)
                ) WITHOUT ROWID;

                CREATE TABLE IF NOT EXISTS conflicts (
                    company_id TEXT NOT NULL,
                    key TEXT NOT NULL,
                    value BLOB NOT NULL,
                    PRIMARY KEY (company_id, key)
                ) WITHOUT ROWID;

                CREATE TABLE IF NOT EXISTS audit_log (
                    company_id TEXT NOT NULL,
                    key TEXT NOT NULL,                      -- seq, zero padded
                    value BLOB NOT NULL,
                    PRIMARY KEY (company_id, key)
                ) WITHOUT ROWID;

                CREATE TABLE IF NOT EXISTS data_keys (
                    company_id TEXT NOT NULL,
                    key TEXT NOT NULL,
                    value BLOB NOT NULL,
                    PRIMARY KEY (company_id, key)
                ) WITHOUT ROWID;

                CREATE TABLE IF NOT EXISTS rotation_jobs (
                    company_id TEXT NOT NULL,
                    key TEXT NOT NULL,
                    value BLOB NOT NULL,
                    PRIMARY KEY (company_id, key)
                ) WITHOUT ROWID;

                CREATE TABLE IF NOT EXISTS rotation_locks (
                    company_id TEXT NOT NULL,
                    key TEXT NOT NULL,
                    value BLOB NOT NULL,
                    PRIMARY KEY (company_id, key)
                ) WITHOUT ROWID;

                CREATE TABLE IF NOT EXISTS meta (
                    company_id TEXT NOT NULL,
                    key TEXT NOT NULL,
                    value BLOB NOT NULL,
                    PRIMARY KEY (company_id, key)
                ) WITHOUT ROWID;
            "#,
            down_sql: Some(
                r#"
                DROP TABLE IF EXISTS meta;
                DROP TABLE IF EXISTS rotation_locks;
                DROP TABLE IF EXISTS rotation_jobs;
                DROP TABLE IF EXISTS data_keys;
                DROP TABLE IF EXISTS audit_log;
                DROP TABLE IF EXISTS conflicts;
                DROP TABLE IF EXISTS operation_log;
                DROP TABLE IF EXISTS entities;
            "#,
            ),
        },
        Migration {
            version: 2,
            description: "Append-only guards on operation and audit logs",
            up_sql: r#"
                CREATE TRIGGER IF NOT EXISTS operation_log_no_update
                BEFORE UPDATE ON operation_log
                BEGIN
                    SELECT RAISE(ABORT, 'operation_log is append-only');
                END;

                CREATE TRIGGER IF NOT EXISTS operation_log_no_delete
                BEFORE DELETE ON operation_log
                BEGIN
                    SELECT RAISE(ABORT, 'operation_log is append-only');
                END;

                CREATE TRIGGER IF NOT EXISTS audit_log_no_update
                BEFORE UPDATE ON audit_log
                BEGIN
                    SELECT RAISE(ABORT, 'audit_log is append-only');
                END;

                CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
                BEFORE DELETE ON audit_log
                BEGIN
                    SELECT RAISE(ABORT, 'audit_log is append-only');
                END;
            "#,
            down_sql: Some(
                r#"
                DROP TRIGGER IF EXISTS audit_log_no_delete;
                DROP TRIGGER IF EXISTS audit_log_no_update;
                DROP TRIGGER IF EXISTS operation_log_no_delete;
                DROP TRIGGER IF EXISTS operation_log_no_update;
            "#,
            ),
        },
    ]
}

/// Get current schema version from database
pub fn get_current_version(pool: &Pool<SqliteConnectionManager>) -> VaultResult<i32> {
    let conn = pool.get()?;

    // Ensure schema_version table exists
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let version: Option<i32> = conn.query_row(
        "SELECT MAX(version) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    Ok(version.unwrap_or(0))
}

/// Run all pending migrations
pub fn migrate(pool: &Pool<SqliteConnectionManager>) -> VaultResult<()> {
    let current_version = get_current_version(pool)?;
    let pending: Vec<_> = get_migrations()
        .into_iter()
        .filter(|m| m.version > current_version)
        .collect();

    if pending.is_empty() {
        return Ok(());
    }

    let conn = pool.get()?;
    for migration in pending {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.up_sql)?;
        tx.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            params![migration.version, Timestamp::now().as_millis() as i64],
        )?;
        tx.commit()?;

        info!(
            version = migration.version,
            description = migration.description,
            "Applied storage migration"
        );
    }

    Ok(())
}

/// Roll back to `target_version`
pub fn rollback(pool: &Pool<SqliteConnectionManager>, target_version: i32) -> VaultResult<()> {
    let current_version = get_current_version(pool)?;
    let mut to_revert: Vec<_> = get_migrations()
        .into_iter()
        .filter(|m| m.version > target_version && m.version <= current_version)
        .collect();
    to_revert.sort_by(|a, b| b.version.cmp(&a.version));

    let conn = pool.get()?;
    for migration in to_revert {
        if let Some(down_sql) = migration.down_sql {
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(down_sql)?;
            tx.execute(
                "DELETE FROM schema_version WHERE version = ?1",
                params![migration.version],
            )?;
            tx.commit()?;
            info!(version = migration.version, "Reverted storage migration");
        }
    }

    Ok(())
}
