/*
    entity.rs - Materialized entity state

    An entity keeps, per field, the set of heads (operations on that field
    not causally dominated by another applied operation) and the ids of every
    operation ever applied to the field. The displayed value is the last
    writer among the heads.
*/

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::clock::{HlcTimestamp, VectorClock};
use super::model::{ConflictId, EntityRef, KeyId, OpId, Timestamp};
use super::oplog::{last_writer_cmp, OperationLogEntry};
use crate::core_crypto::EncryptedField;

/// A current (undominated) write to a field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldHead {
    pub op_id: OpId,
    pub hlc: HlcTimestamp,
    /// Clock of the op that produced this head
    pub clock: VectorClock,
    /// Value, possibly re-sealed under a newer key than the op log copy
    pub value: EncryptedField,
}

impl FieldHead {
    /// Head for a SetField op; `None` for deletes
    pub fn from_op(op: &OperationLogEntry) -> Option<Self> {
        op.value().map(|value| FieldHead {
            op_id: op.op_id.clone(),
            hlc: op.hlc,
            clock: op.clock(),
            value: value.clone(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldState {
    /// Kept sorted by op id
    pub heads: Vec<FieldHead>,
    /// Every op applied to this field, sorted by op id
    pub history: Vec<OpId>,
}

impl FieldState {
    /// Head shown to readers
    pub fn current(&self) -> Option<&FieldHead> {
        self.heads
            .iter()
            .max_by(|a, b| last_writer_cmp((&a.hlc, &a.op_id), (&b.hlc, &b.op_id)))
    }

    pub fn head(&self, op_id: &OpId) -> Option<&FieldHead> {
        self.heads.iter().find(|h| &h.op_id == op_id)
    }

    pub fn has_applied(&self, op_id: &OpId) -> bool {
        self.history.binary_search(op_id).is_ok()
    }

    /// Add an op to the history; false if it was already there
    pub fn record(&mut self, op_id: &OpId) -> bool {
        match self.history.binary_search(op_id) {
            Ok(_) => false,
            Err(pos) => {
                self.history.insert(pos, op_id.clone());
                true
            }
        }
    }

    pub fn head_ids(&self) -> Vec<OpId> {
        self.heads.iter().map(|h| h.op_id.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_ref: EntityRef,
    pub fields: BTreeMap<String, FieldState>,
    pub version_vector: VectorClock,
    /// HLC of the latest applied op
    pub hlc: HlcTimestamp,
    pub tombstone: bool,
    pub deleted_by: Option<OpId>,
    /// Open conflict record for this entity, at most one
    pub open_conflict: Option<ConflictId>,
    pub created_at: Timestamp,
}

impl Entity {
    pub fn new(entity_ref: EntityRef, created_at: Timestamp) -> Self {
        Entity {
            entity_ref,
            fields: BTreeMap::new(),
            version_vector: VectorClock::new(),
            hlc: HlcTimestamp::default(),
            tombstone: false,
            deleted_by: None,
            open_conflict: None,
            created_at,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldState> {
        self.fields.get(name)
    }

    /// Keys under which this entity's head values are currently sealed
    pub fn key_ids(&self) -> BTreeSet<KeyId> {
        self.fields
            .values()
            .flat_map(|state| state.heads.iter().map(|h| h.value.key_id.clone()))
            .collect()
    }

    /// Number of head values (the unit of re-encryption work)
    pub fn head_count(&self) -> usize {
        self.fields.values().map(|state| state.heads.len()).sum()
    }

    /// Fold an applied op into the entity-level clock and timestamp
    pub fn observe(&mut self, op: &OperationLogEntry) {
        self.version_vector.merge(&op.clock());
        if op.hlc > self.hlc {
            self.hlc = op.hlc;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::model::DeviceId;

    fn head(device: &str, seq: u64, wall: u64, key: &str) -> FieldHead {
        FieldHead {
            op_id: OpId::new(DeviceId::new(device), seq),
            hlc: HlcTimestamp::new(wall, 0),
            clock: VectorClock::new().with(&DeviceId::new(device), seq),
            value: EncryptedField {
                ciphertext: vec![],
                nonce: vec![0; 12],
                auth_tag: vec![0; 16],
                key_id: KeyId::new(key),
                algorithm_version: 1,
            },
        }
    }

    #[test]
    fn test_current_is_last_writer() {
        let state = FieldState {
            heads: vec![head("laptop", 1, 20, "k1"), head("phone", 1, 30, "k1")],
            history: vec![],
        };
        assert_eq!(state.current().unwrap().op_id.device, DeviceId::new("phone"));
    }

    #[test]
    fn test_current_tie_break_on_device() {
        let state = FieldState {
            heads: vec![head("zeta", 1, 20, "k1"), head("alpha", 1, 20, "k1")],
            history: vec![],
        };
        assert_eq!(state.current().unwrap().op_id.device, DeviceId::new("zeta"));
    }

    #[test]
    fn test_key_ids_and_head_count() {
        let mut entity = Entity::new(
            EntityRef::new(
                crate::core_store::model::CompanyId::new("acme"),
                crate::core_store::model::EntityKind::Contact,
                crate::core_store::model::EntityId::new("c1"),
            ),
            Timestamp::from_millis(0),
        );
        entity.fields.insert(
            "email".into(),
            FieldState {
                heads: vec![head("a", 1, 1, "k1"), head("b", 1, 1, "k2")],
                history: vec![],
            },
        );
        assert_eq!(entity.head_count(), 2);
        assert_eq!(entity.key_ids().len(), 2);
    }
}
