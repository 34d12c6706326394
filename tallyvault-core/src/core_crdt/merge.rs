/*
    merge.rs - Field-level multi-value register merge

    Each field keeps its heads: the applied SetField ops not causally
    dominated by another applied op on the same field. Applying an op:
    - already in the field history: no-op
    - dominated by a head: history only
    - otherwise: replaces the heads it dominates and joins the rest

    The head set depends only on which ops were applied, never on the order,
    so replicas that saw the same ops agree. Values are compared through a
    ValueComparator because heads hold ciphertext.
*/

use tracing::{debug, warn};

use super::policy::{ConflictPolicy, MergePolicy};
use crate::core_crypto::EncryptedField;
use crate::core_store::entity::{Entity, FieldHead};
use crate::core_store::model::{EntityRef, OpId};
use crate::core_store::oplog::{OpKind, OperationLogEntry};
use crate::errors::{VaultError, VaultResult};

/// Compares the plaintext behind two sealed values of the same field
pub trait ValueComparator {
    fn same_value(
        &self,
        entity: &EntityRef,
        field: &str,
        a: &EncryptedField,
        b: &EncryptedField,
    ) -> VaultResult<bool>;
}

/// Result of applying one op to an entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeStatus {
    /// The op was applied before
    AlreadyApplied,
    /// A causally later write to the field already exists
    Obsolete,
    /// The op is now the field's only head
    Advanced,
    /// Concurrent heads, all holding the same value
    Converged,
    /// Concurrent heads with different values, settled by last-writer-wins
    AutoMerged,
    /// Concurrent heads with different values; a human must choose
    Conflicted { contenders: Vec<OpId> },
    /// The entity is deleted
    Tombstoned,
    /// A write that arrived for a deleted entity; history only
    IgnoredDeleted,
}

impl MergeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStatus::AlreadyApplied => "already_applied",
            MergeStatus::Obsolete => "obsolete",
            MergeStatus::Advanced => "advanced",
            MergeStatus::Converged => "converged",
            MergeStatus::AutoMerged => "auto_merged",
            MergeStatus::Conflicted { .. } => "conflicted",
            MergeStatus::Tombstoned => "tombstoned",
            MergeStatus::IgnoredDeleted => "ignored_deleted",
        }
    }

    /// Whether the op changed what readers of the field see
    pub fn changed_heads(&self) -> bool {
        matches!(
            self,
            MergeStatus::Advanced
                | MergeStatus::Converged
                | MergeStatus::AutoMerged
                | MergeStatus::Conflicted { .. }
        )
    }
}

/// Applies ops to entities under a conflict policy
#[derive(Debug, Clone, Default)]
pub struct MergeEngine {
    policy: ConflictPolicy,
}

impl MergeEngine {
    pub fn new(policy: ConflictPolicy) -> Self {
        MergeEngine { policy }
    }

    pub fn policy(&self) -> &ConflictPolicy {
        &self.policy
    }

    pub fn apply(
        &self,
        entity: &mut Entity,
        op: &OperationLogEntry,
        comparator: &dyn ValueComparator,
    ) -> VaultResult<MergeStatus> {
        if op.entity != entity.entity_ref {
            return Err(VaultError::Validation(format!(
                "op {} targets {}, not {}",
                op.op_id, op.entity, entity.entity_ref
            )));
        }

        match &op.kind {
            OpKind::Delete => Ok(self.apply_delete(entity, op)),
            OpKind::SetField { field, value } => self.apply_set(entity, op, field, value, comparator),
        }
    }

    fn apply_delete(&self, entity: &mut Entity, op: &OperationLogEntry) -> MergeStatus {
        let newer = match &entity.deleted_by {
            Some(existing) if existing == &op.op_id => return MergeStatus::AlreadyApplied,
            Some(existing) => op.op_id > *existing,
            None => true,
        };
        // Concurrent deletes agree on the highest op id as the deleter
        if newer {
            entity.deleted_by = Some(op.op_id.clone());
        }
        entity.tombstone = true;
        entity.observe(op);
        debug!(entity = %entity.entity_ref, op = %op.op_id, "Entity tombstoned");
        MergeStatus::Tombstoned
    }

    fn apply_set(
        &self,
        entity: &mut Entity,
        op: &OperationLogEntry,
        field: &str,
        value: &EncryptedField,
        comparator: &dyn ValueComparator,
    ) -> VaultResult<MergeStatus> {
        let field_type = entity.entity_ref.kind.field(field)?.field_type;
        let entity_ref = entity.entity_ref.clone();
        let tombstoned = entity.tombstone;
        let state = entity.fields.entry(field.to_string()).or_default();

        if !state.record(&op.op_id) {
            return Ok(MergeStatus::AlreadyApplied);
        }

        let clock = op.clock();
        let status = if tombstoned {
            MergeStatus::IgnoredDeleted
        } else if state.heads.iter().any(|h| clock.dominated_by(&h.clock)) {
            MergeStatus::Obsolete
        } else {
            state.heads.retain(|h| !h.clock.dominated_by(&clock));
            state.heads.push(FieldHead {
                op_id: op.op_id.clone(),
                hlc: op.hlc,
                clock,
                value: value.clone(),
            });
            state.heads.sort_by(|a, b| a.op_id.cmp(&b.op_id));

            if state.heads.len() == 1 {
                MergeStatus::Advanced
            } else {
                let first = &state.heads[0];
                let mut all_same = true;
                for other in &state.heads[1..] {
                    let same = match comparator.same_value(&entity_ref, field, &first.value, &other.value) {
                        Ok(same) => same,
                        Err(e @ VaultError::Integrity(_)) => return Err(e),
                        Err(e) => {
                            warn!(
                                entity = %entity_ref,
                                field,
                                error = %e,
                                "Could not compare concurrent values; treating them as different"
                            );
                            false
                        }
                    };
                    if !same {
                        all_same = false;
                        break;
                    }
                }

                if all_same {
                    MergeStatus::Converged
                } else {
                    match self.policy.policy_for(field_type) {
                        MergePolicy::LastWriterWins => MergeStatus::AutoMerged,
                        MergePolicy::RaiseConflict => MergeStatus::Conflicted {
                            contenders: state.head_ids(),
                        },
                    }
                }
            }
        };

        entity.observe(op);
        debug!(entity = %entity_ref, field, op = %op.op_id, status = ?status, "Merged op");
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::clock::{HlcTimestamp, VectorClock};
    use crate::core_store::model::{CompanyId, DeviceId, EntityId, EntityKind, KeyId, Timestamp};
    use proptest::prelude::*;

    /// Test values carry their "plaintext" in the clear
    struct ClearComparator;

    impl ValueComparator for ClearComparator {
        fn same_value(
            &self,
            _entity: &EntityRef,
            _field: &str,
            a: &EncryptedField,
            b: &EncryptedField,
        ) -> VaultResult<bool> {
            Ok(a.ciphertext == b.ciphertext)
        }
    }

    struct FailingComparator;

    impl ValueComparator for FailingComparator {
        fn same_value(
            &self,
            _entity: &EntityRef,
            _field: &str,
            _a: &EncryptedField,
            _b: &EncryptedField,
        ) -> VaultResult<bool> {
            Err(VaultError::KeyNotFound("k9".into()))
        }
    }

    struct TamperedComparator;

    impl ValueComparator for TamperedComparator {
        fn same_value(
            &self,
            _entity: &EntityRef,
            _field: &str,
            _a: &EncryptedField,
            _b: &EncryptedField,
        ) -> VaultResult<bool> {
            Err(VaultError::Integrity("authentication tag mismatch".into()))
        }
    }

    fn entity_ref() -> EntityRef {
        EntityRef::new(CompanyId::new("acme"), EntityKind::Transaction, EntityId::new("tx-1"))
    }

    fn fresh() -> Entity {
        Entity::new(entity_ref(), Timestamp::from_millis(0))
    }

    fn clear(value: u8) -> EncryptedField {
        EncryptedField {
            ciphertext: vec![value],
            nonce: vec![0; 12],
            auth_tag: vec![0; 16],
            key_id: KeyId::new("k1"),
            algorithm_version: 1,
        }
    }

    fn set(device: &str, seq: u64, wall: u64, field: &str, value: u8, deps: VectorClock) -> OperationLogEntry {
        OperationLogEntry::set_field(
            OpId::new(DeviceId::new(device), seq),
            entity_ref(),
            field,
            clear(value),
            HlcTimestamp::new(wall, 0),
            deps,
        )
    }

    #[test]
    fn test_causal_chain_advances() {
        let engine = MergeEngine::default();
        let mut entity = fresh();
        let first = set("laptop", 1, 10, "memo", 1, VectorClock::new());
        let second = set("phone", 1, 20, "memo", 2, first.clock());

        assert_eq!(engine.apply(&mut entity, &first, &ClearComparator).unwrap(), MergeStatus::Advanced);
        assert_eq!(engine.apply(&mut entity, &second, &ClearComparator).unwrap(), MergeStatus::Advanced);
        assert_eq!(entity.field("memo").unwrap().head_ids(), vec![second.op_id.clone()]);
        assert_eq!(entity.field("memo").unwrap().history.len(), 2);
    }

    #[test]
    fn test_reapply_is_noop() {
        let engine = MergeEngine::default();
        let mut entity = fresh();
        let op = set("laptop", 1, 10, "memo", 1, VectorClock::new());
        engine.apply(&mut entity, &op, &ClearComparator).unwrap();
        let snapshot = entity.clone();
        assert_eq!(
            engine.apply(&mut entity, &op, &ClearComparator).unwrap(),
            MergeStatus::AlreadyApplied
        );
        assert_eq!(entity, snapshot);
    }

    #[test]
    fn test_late_dominated_op_is_obsolete() {
        let engine = MergeEngine::default();
        let mut entity = fresh();
        let first = set("laptop", 1, 10, "memo", 1, VectorClock::new());
        let second = set("phone", 1, 20, "memo", 2, first.clock());

        engine.apply(&mut entity, &second, &ClearComparator).unwrap();
        assert_eq!(engine.apply(&mut entity, &first, &ClearComparator).unwrap(), MergeStatus::Obsolete);
        assert_eq!(entity.field("memo").unwrap().head_ids(), vec![second.op_id.clone()]);
    }

    #[test]
    fn test_concurrent_different_values_conflict() {
        let engine = MergeEngine::default();
        let mut entity = fresh();
        let a = set("laptop", 1, 10, "voided_reason", 1, VectorClock::new());
        let b = set("phone", 1, 11, "voided_reason", 2, VectorClock::new());

        engine.apply(&mut entity, &a, &ClearComparator).unwrap();
        let status = engine.apply(&mut entity, &b, &ClearComparator).unwrap();
        assert_eq!(
            status,
            MergeStatus::Conflicted {
                contenders: vec![a.op_id.clone(), b.op_id.clone()]
            }
        );
        // Displayed value is the last writer
        assert_eq!(entity.field("voided_reason").unwrap().current().unwrap().op_id, b.op_id);
    }

    #[test]
    fn test_concurrent_equal_values_converge() {
        let engine = MergeEngine::default();
        let mut entity = fresh();
        engine
            .apply(&mut entity, &set("laptop", 1, 10, "memo", 7, VectorClock::new()), &ClearComparator)
            .unwrap();
        assert_eq!(
            engine
                .apply(&mut entity, &set("phone", 1, 12, "memo", 7, VectorClock::new()), &ClearComparator)
                .unwrap(),
            MergeStatus::Converged
        );
    }

    #[test]
    fn test_last_writer_wins_policy() {
        let engine = MergeEngine::new(
            ConflictPolicy::with_last_writer_wins(&[crate::core_store::model::FieldType::Text]).unwrap(),
        );
        let mut entity = fresh();
        engine
            .apply(&mut entity, &set("laptop", 1, 10, "memo", 1, VectorClock::new()), &ClearComparator)
            .unwrap();
        assert_eq!(
            engine
                .apply(&mut entity, &set("phone", 1, 12, "memo", 2, VectorClock::new()), &ClearComparator)
                .unwrap(),
            MergeStatus::AutoMerged
        );
        // Money still conflicts
        let amount = |device: &str, value: u8| {
            OperationLogEntry::set_field(
                OpId::new(DeviceId::new(device), 2),
                entity_ref(),
                "amount",
                clear(value),
                HlcTimestamp::new(20, 0),
                VectorClock::new(),
            )
        };
        engine.apply(&mut entity, &amount("laptop", 1), &ClearComparator).unwrap();
        assert!(matches!(
            engine.apply(&mut entity, &amount("phone", 2), &ClearComparator).unwrap(),
            MergeStatus::Conflicted { .. }
        ));
    }

    #[test]
    fn test_independent_fields_do_not_conflict() {
        let engine = MergeEngine::default();
        let mut entity = fresh();
        let memo = set("laptop", 1, 10, "memo", 1, VectorClock::new());
        let description = set("phone", 1, 11, "description", 2, VectorClock::new());
        assert_eq!(engine.apply(&mut entity, &memo, &ClearComparator).unwrap(), MergeStatus::Advanced);
        assert_eq!(
            engine.apply(&mut entity, &description, &ClearComparator).unwrap(),
            MergeStatus::Advanced
        );
    }

    #[test]
    fn test_comparator_failure_means_different() {
        let engine = MergeEngine::default();
        let mut entity = fresh();
        engine
            .apply(&mut entity, &set("laptop", 1, 10, "memo", 1, VectorClock::new()), &FailingComparator)
            .unwrap();
        assert!(matches!(
            engine
                .apply(&mut entity, &set("phone", 1, 12, "memo", 1, VectorClock::new()), &FailingComparator)
                .unwrap(),
            MergeStatus::Conflicted { .. }
        ));
    }

    #[test]
    fn test_integrity_failure_while_comparing_is_surfaced() {
        let engine = MergeEngine::default();
        let mut entity = fresh();
        engine
            .apply(&mut entity, &set("laptop", 1, 10, "memo", 1, VectorClock::new()), &TamperedComparator)
            .unwrap();
        assert!(matches!(
            engine.apply(&mut entity, &set("phone", 1, 12, "memo", 2, VectorClock::new()), &TamperedComparator),
            Err(VaultError::Integrity(_))
        ));
    }

    #[test]
    fn test_delete_is_sticky() {
        let engine = MergeEngine::default();
        let mut entity = fresh();
        let delete = OperationLogEntry::delete(
            OpId::new(DeviceId::new("phone"), 1),
            entity_ref(),
            HlcTimestamp::new(5, 0),
            VectorClock::new(),
        );
        assert_eq!(engine.apply(&mut entity, &delete, &ClearComparator).unwrap(), MergeStatus::Tombstoned);
        assert_eq!(
            engine
                .apply(&mut entity, &set("laptop", 1, 10, "memo", 1, VectorClock::new()), &ClearComparator)
                .unwrap(),
            MergeStatus::IgnoredDeleted
        );
        assert!(entity.tombstone);
        assert!(entity.field("memo").unwrap().heads.is_empty());
        assert_eq!(engine.apply(&mut entity, &delete, &ClearComparator).unwrap(), MergeStatus::AlreadyApplied);
    }

    #[test]
    fn test_wrong_entity_rejected() {
        let engine = MergeEngine::default();
        let mut entity = Entity::new(
            EntityRef::new(CompanyId::new("other"), EntityKind::Transaction, EntityId::new("tx-1")),
            Timestamp::from_millis(0),
        );
        let op = set("laptop", 1, 10, "memo", 1, VectorClock::new());
        assert!(engine.apply(&mut entity, &op, &ClearComparator).is_err());
    }

    /// Simulate devices that write and occasionally sync, returning every op
    fn simulate(actions: &[(usize, u8, bool, usize)]) -> Vec<OperationLogEntry> {
        let devices = ["alpha", "beta", "gamma"];
        let fields = ["memo", "description"];
        let engine = MergeEngine::default();
        let mut replicas: Vec<Entity> = devices.iter().map(|_| fresh()).collect();
        let mut known: Vec<Vec<OperationLogEntry>> = devices.iter().map(|_| Vec::new()).collect();
        let mut seqs = [0u64; 3];
        let mut ops = Vec::new();

        for (step, &(device, value, sync, field)) in actions.iter().enumerate() {
            let device = device % devices.len();
            if sync {
                let peer = (device + 1) % devices.len();
                for op in known[peer].clone() {
                    engine.apply(&mut replicas[device], &op, &ClearComparator).unwrap();
                    known[device].push(op);
                }
                continue;
            }
            seqs[device] += 1;
            let op = set(
                devices[device],
                seqs[device],
                step as u64,
                fields[field % fields.len()],
                value,
                replicas[device].version_vector.clone(),
            );
            engine.apply(&mut replicas[device], &op, &ClearComparator).unwrap();
            known[device].push(op.clone());
            ops.push(op);
        }
        ops
    }

    fn materialize(ops: &[OperationLogEntry], order: &[usize]) -> Entity {
        let engine = MergeEngine::default();
        let mut entity = fresh();
        for &i in order {
            engine.apply(&mut entity, &ops[i], &ClearComparator).unwrap();
        }
        entity
    }

    proptest! {
        #[test]
        fn prop_merge_is_order_independent(
            actions in prop::collection::vec((0usize..3, 0u8..4, any::<bool>(), 0usize..2), 1..30),
            salt in prop::collection::vec(any::<u32>(), 30),
        ) {
            let ops = simulate(&actions);
            let forward: Vec<usize> = (0..ops.len()).collect();
            let mut shuffled = forward.clone();
            shuffled.sort_by_key(|&i| (salt[i % salt.len()], i));
            let mut twice = shuffled.clone();
            twice.extend(forward.iter().rev());

            let a = materialize(&ops, &forward);
            let b = materialize(&ops, &shuffled);
            let c = materialize(&ops, &twice);

            for other in [&b, &c] {
                prop_assert_eq!(&a.version_vector, &other.version_vector);
                prop_assert_eq!(a.fields.len(), other.fields.len());
                for (name, state) in &a.fields {
                    let theirs = &other.fields[name];
                    prop_assert_eq!(state.head_ids(), theirs.head_ids());
                    prop_assert_eq!(&state.history, &theirs.history);
                    prop_assert_eq!(
                        state.current().map(|h| h.op_id.clone()),
                        theirs.current().map(|h| h.op_id.clone())
                    );
                }
            }
        }

        #[test]
        fn prop_heads_are_mutually_concurrent(
            actions in prop::collection::vec((0usize..3, 0u8..4, any::<bool>(), 0usize..2), 1..30),
        ) {
            let ops = simulate(&actions);
            let order: Vec<usize> = (0..ops.len()).collect();
            let entity = materialize(&ops, &order);
            for state in entity.fields.values() {
                for (i, a) in state.heads.iter().enumerate() {
                    for b in &state.heads[i + 1..] {
                        prop_assert!(a.clock.is_concurrent(&b.clock));
                    }
                }
            }
        }
    }
}
