/*
    core_store - Local durable store and version vectors

    The authoritative local state layer for a vault session.
    Handles:
    - Data model (ids, entity kinds and field schemas)
    - Version vectors and the hybrid logical clock
    - Operation log entries and materialized entity state
    - Storage backends (memory, SQLite) behind one trait
    - Typed access with bounded pagination
*/

pub mod clock;
pub mod entity;
pub mod model;
pub mod oplog;
pub mod store;

// Re-export commonly used types
pub use clock::{HlcTimestamp, HybridClock, ManualTimeSource, SystemTimeSource, TimeSource, VectorClock};
pub use entity::{Entity, FieldHead, FieldState};
pub use model::{
    CompanyId, ConflictId, DeviceId, EntityId, EntityKind, EntityRef, FieldSpec, FieldType,
    FieldValue, JobId, KeyId, OpId, Timestamp,
};
pub use oplog::{OpKind, OperationLogEntry};
pub use store::{
    LocalStore, MemoryBackend, Page, PageRequest, ScanRange, SqliteBackend, StorageBackend,
    StoreLimits, Table, WriteBatch,
};
