//! Audit Trail
//!
//! Append-only, hash-chained record of every mutation and key event. Payloads
//! are encrypted under the company's data key; chain metadata stays in the
//! clear so integrity can be checked without unlocking anything.

pub mod entry;
pub mod trail;

pub use entry::{AuditAction, AuditEvent, AuditHead, AuditLogEntry, GENESIS_HASH};
pub use trail::{AuditFilter, AuditRecord, AuditTrail, ChainVerification, MIN_RETENTION};
