/*
    oplog.rs - Operation log entries

    One immutable entry per mutation. Entries are the unit exchanged between
    devices and the source of truth for history. Each entry is:
    - Identified by (author device, per-company sequence)
    - Vector-clocked through its causal dependencies
    - Encrypted: a SetField value is always an EncryptedField
*/

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use super::clock::{HlcTimestamp, VectorClock};
use super::model::{ConflictId, DeviceId, EntityRef, OpId};
use crate::core_crypto::EncryptedField;
use crate::errors::{VaultError, VaultResult};

/// What an operation does
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    SetField { field: String, value: EncryptedField },
    Delete,
}

/// A single entry in the operation log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationLogEntry {
    pub op_id: OpId,
    pub entity: EntityRef,
    pub kind: OpKind,
    pub hlc: HlcTimestamp,
    /// Version vector of the entity as the author saw it before this op
    pub deps: VectorClock,
    /// Conflict this op resolves, if any
    pub resolves: Option<ConflictId>,
}

impl OperationLogEntry {
    pub fn set_field(
        op_id: OpId,
        entity: EntityRef,
        field: impl Into<String>,
        value: EncryptedField,
        hlc: HlcTimestamp,
        deps: VectorClock,
    ) -> Self {
        OperationLogEntry {
            op_id,
            entity,
            kind: OpKind::SetField {
                field: field.into(),
                value,
            },
            hlc,
            deps,
            resolves: None,
        }
    }

    pub fn delete(op_id: OpId, entity: EntityRef, hlc: HlcTimestamp, deps: VectorClock) -> Self {
        OperationLogEntry {
            op_id,
            entity,
            kind: OpKind::Delete,
            hlc,
            deps,
            resolves: None,
        }
    }

    pub fn resolving(mut self, conflict: ConflictId) -> Self {
        self.resolves = Some(conflict);
        self
    }

    pub fn author(&self) -> &DeviceId {
        &self.op_id.device
    }

    /// The op's own clock: `deps` with the author's entry raised to `seq`
    pub fn clock(&self) -> VectorClock {
        self.deps.clone().with(&self.op_id.device, self.op_id.seq)
    }

    pub fn field(&self) -> Option<&str> {
        match &self.kind {
            OpKind::SetField { field, .. } => Some(field),
            OpKind::Delete => None,
        }
    }

    pub fn value(&self) -> Option<&EncryptedField> {
        match &self.kind {
            OpKind::SetField { value, .. } => Some(value),
            OpKind::Delete => None,
        }
    }

    /// Structural checks applied to every entry received from elsewhere
    pub fn validate(&self) -> VaultResult<()> {
        self.entity.validate()?;
        self.op_id.device.validate()?;
        if self.op_id.seq == 0 {
            return Err(VaultError::Validation(format!("op {} has sequence 0", self.op_id)));
        }
        if self.deps.get(&self.op_id.device) >= self.op_id.seq {
            return Err(VaultError::CausalViolation(format!(
                "op {} depends on its own future",
                self.op_id
            )));
        }
        if let OpKind::SetField { field, .. } = &self.kind {
            self.entity.kind.field(field)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> VaultResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> VaultResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Deterministic last-writer order: HLC, then device id
pub fn last_writer_cmp(a: (&HlcTimestamp, &OpId), b: (&HlcTimestamp, &OpId)) -> Ordering {
    a.0.cmp(b.0)
        .then_with(|| a.1.device.cmp(&b.1.device))
        .then_with(|| a.1.seq.cmp(&b.1.seq))
}
