/*
    store - Persistence for vault records

    Components:
    - backend: the injected StorageBackend trait, tables and write batches
    - memory / sqlite: backend implementations
    - migrations: SQLite schema versions
    - local_store: typed accessors and pagination
*/

pub mod backend;
pub mod local_store;
pub mod memory;
pub mod migrations;
pub mod sqlite;

pub use backend::{ScanRange, StorageBackend, Table, WriteBatch, WriteKind, WriteOp};
pub use local_store::{LocalStore, Page, PageRequest, StoreLimits};
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;
