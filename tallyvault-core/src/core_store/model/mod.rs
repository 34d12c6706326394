/*
    model - Identifiers, timestamps and entity schemas
*/

pub mod schema;
pub mod types;

pub use schema::{EntityKind, FieldSpec, FieldType, FieldValue};
pub use types::{CompanyId, ConflictId, DeviceId, EntityId, EntityRef, JobId, KeyId, OpId, Timestamp};
