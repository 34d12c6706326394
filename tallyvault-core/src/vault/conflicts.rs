//! Conflict listing, presentation and resolution.

use std::collections::BTreeMap;
use tracing::info;

use super::Vault;
use crate::core_audit::{AuditAction, AuditEvent};
use crate::core_conflict::{
    plan_resolution, ConflictRecord, ConflictStatus, ConflictView, ContenderView, FieldChoice,
    FieldConflictView, ResolutionStrategy,
};
use crate::core_crypto::EncryptedField;
use crate::core_store::entity::Entity;
use crate::core_store::model::{CompanyId, ConflictId, EntityRef, OpId, Timestamp};
use crate::core_store::oplog::OperationLogEntry;
use crate::core_store::store::{Page, PageRequest, WriteBatch};
use crate::errors::{handle_poison, VaultError, VaultResult};
use crate::metrics::record_counter;

/// Per-field picks for a `FieldMerge` resolution, keyed by field name
pub type FieldSelections = BTreeMap<String, FieldChoice>;

/// Listing entry for an open conflict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictSummary {
    pub id: ConflictId,
    pub entity: EntityRef,
    pub status: ConflictStatus,
    pub fields: Vec<String>,
    pub detected_at: Timestamp,
}

impl From<ConflictRecord> for ConflictSummary {
    fn from(record: ConflictRecord) -> Self {
        ConflictSummary {
            fields: record.fields.into_iter().map(|f| f.field).collect(),
            id: record.id,
            entity: record.entity,
            status: record.status,
            detected_at: record.detected_at,
        }
    }
}

impl Vault {
    pub fn list_unresolved_conflicts(
        &self,
        company: &CompanyId,
        page: &PageRequest,
    ) -> VaultResult<Page<ConflictSummary>> {
        Ok(self
            .conflicts
            .list_unresolved(company, page)?
            .map(ConflictSummary::from))
    }

    pub fn get_conflict(&self, company: &CompanyId, id: &ConflictId) -> VaultResult<ConflictRecord> {
        self.conflicts.get(company, id)
    }

    /// Decrypt every contender of an open conflict and mark it presented
    pub fn present_conflict(&self, company: &CompanyId, id: &ConflictId) -> VaultResult<ConflictView> {
        let _guard = self.write_lock.lock().map_err(handle_poison)?;
        let mut record = self.conflicts.get(company, id)?;
        if !record.is_open() {
            return Err(VaultError::ConflictAlreadyResolved(format!(
                "conflict {} is {}",
                record.id, record.status
            )));
        }
        let entity = self
            .store
            .get_entity(&record.entity)?
            .ok_or_else(|| VaultError::NotFound(record.entity.to_string()))?;

        let mut fields = Vec::with_capacity(record.fields.len());
        for contention in &record.fields {
            let mut contenders = Vec::with_capacity(contention.contenders.len());
            for contender in &contention.contenders {
                let sealed = self.contender_value(&entity, &contention.field, &contender.op_id)?;
                let key = self.keys.data_key(company, &sealed.key_id)?;
                contenders.push(ContenderView {
                    value: self.cipher.open(&record.entity, &contention.field, &sealed, &key)?,
                    op_id: contender.op_id.clone(),
                    author: contender.author.clone(),
                    hlc: contender.hlc,
                    is_local: contender.op_id == contention.local,
                });
            }
            fields.push(FieldConflictView {
                field: contention.field.clone(),
                contenders,
            });
        }

        if record.status == ConflictStatus::Detected {
            record.transition(ConflictStatus::Presented, self.now())?;
            let mut batch = WriteBatch::new();
            self.conflicts.stage(&mut batch, &record)?;
            self.store.commit(batch)?;
        }

        Ok(ConflictView {
            id: record.id,
            entity: record.entity,
            status: record.status,
            detected_at: record.detected_at,
            fields,
        })
    }

    /// Settle a presented conflict.
    ///
    /// Writes one op per contended field whose deps cover every head, closes
    /// the record and appends one audit entry, all in one batch. Returns the
    /// resolution op ids in field order.
    pub fn resolve_conflict(
        &self,
        company: &CompanyId,
        id: &ConflictId,
        strategy: ResolutionStrategy,
        selections: &FieldSelections,
    ) -> VaultResult<Vec<OpId>> {
        let _guard = self.write_lock.lock().map_err(handle_poison)?;
        let mut record = self.conflicts.get(company, id)?;
        let plan = plan_resolution(&record, strategy, selections)?;
        let now = self.now();
        record.transition(ConflictStatus::Resolving, now)?;

        let mut entity = self
            .store
            .get_entity(&record.entity)?
            .ok_or_else(|| VaultError::NotFound(record.entity.to_string()))?;
        let write_key = self.keys.write_key(company)?;
        let mut seq = self.store.device_seq(company, &self.device)?;

        let mut batch = WriteBatch::new();
        let mut ops = Vec::with_capacity(plan.len());
        for planned in &plan {
            let sealed = self.contender_value(&entity, &planned.field, &planned.winner)?;
            let source = self.keys.data_key(company, &sealed.key_id)?;
            let value = self
                .cipher
                .reseal(&record.entity, &planned.field, &sealed, &source, &write_key)?;

            seq += 1;
            let op = OperationLogEntry::set_field(
                OpId::new(self.device.clone(), seq),
                record.entity.clone(),
                planned.field.clone(),
                value,
                self.clock.observe(entity.hlc)?,
                entity.version_vector.clone(),
            )
            .resolving(record.id.clone());
            self.merge.apply(&mut entity, &op, &self.comparator())?;
            self.store.stage_op(&mut batch, &op)?;
            ops.push(op.op_id);
        }

        record.complete(strategy, self.device.clone(), ops.clone(), now)?;
        if entity.open_conflict.as_ref() == Some(&record.id) {
            entity.open_conflict = None;
        }
        self.conflicts.stage(&mut batch, &record)?;
        self.store.stage_entity(&mut batch, &entity)?;
        self.store.stage_device_seq(&mut batch, company, &self.device, seq)?;

        let event = AuditEvent::new(self.device.clone(), AuditAction::ConflictResolved)
            .entity(record.entity.clone())
            .conflict(record.id.clone())
            .detail(strategy.as_str());
        let audit_key = self.audit_key(company)?;
        self.audit.stage(&mut batch, company, &event, &audit_key, now)?;
        self.store.commit(batch)?;

        record_counter("crdt.conflicts.resolved", 1);
        info!(
            conflict = %record.id,
            entity = %record.entity,
            strategy = %strategy,
            ops = ops.len(),
            "Conflict resolved"
        );
        Ok(ops)
    }

    /// Sealed value of a contender: the entity head, else the op-log copy
    fn contender_value(&self, entity: &Entity, field: &str, op_id: &OpId) -> VaultResult<EncryptedField> {
        if let Some(head) = entity.field(field).and_then(|state| state.head(op_id)) {
            return Ok(head.value.clone());
        }
        let op = self
            .store
            .get_op(&entity.entity_ref.company_id, op_id)?
            .ok_or_else(|| VaultError::NotFound(format!("operation {}", op_id)))?;
        op.value()
            .cloned()
            .ok_or_else(|| VaultError::Validation(format!("operation {} carries no value", op_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::model::FieldValue;
    use crate::test_utils::{acme, paired_vaults, transaction};

    /// Two devices write the same field concurrently; the laptop learns of it
    fn conflicted() -> (Vec<std::sync::Arc<Vault>>, ConflictId) {
        let vaults = paired_vaults(&["laptop", "phone"], &acme()).unwrap();
        let tx = transaction("tx-1");
        vaults[0].mutate_field(&tx, "memo", FieldValue::text("laptop memo")).unwrap();
        vaults[1].mutate_field(&tx, "memo", FieldValue::text("phone memo")).unwrap();
        let report = vaults[0]
            .apply_remote_operations(vaults[1].outbound_operations(&acme(), 0, 100).unwrap())
            .unwrap();
        let id = report.conflicts[0].clone();
        (vaults, id)
    }

    #[test]
    fn test_present_shows_every_contender() {
        let (vaults, id) = conflicted();
        let view = vaults[0].present_conflict(&acme(), &id).unwrap();
        assert_eq!(view.status, ConflictStatus::Presented);
        assert_eq!(view.fields.len(), 1);
        let contenders = &view.fields[0].contenders;
        assert_eq!(contenders.len(), 2);
        let local = contenders.iter().find(|c| c.is_local).unwrap();
        assert_eq!(local.value, FieldValue::text("laptop memo"));
        assert!(contenders.iter().any(|c| c.value == FieldValue::text("phone memo")));

        // Presenting twice is harmless
        assert!(vaults[0].present_conflict(&acme(), &id).is_ok());
    }

    #[test]
    fn test_resolve_requires_presentation() {
        let (vaults, id) = conflicted();
        assert!(matches!(
            vaults[0].resolve_conflict(&acme(), &id, ResolutionStrategy::KeepLocal, &FieldSelections::new()),
            Err(VaultError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_keep_remote_then_resolved_twice() {
        let (vaults, id) = conflicted();
        vaults[0].present_conflict(&acme(), &id).unwrap();
        let ops = vaults[0]
            .resolve_conflict(&acme(), &id, ResolutionStrategy::KeepRemote, &FieldSelections::new())
            .unwrap();
        assert_eq!(ops.len(), 1);

        let snapshot = vaults[0].get_entity(&transaction("tx-1")).unwrap();
        assert_eq!(snapshot.value("memo"), Some(&FieldValue::text("phone memo")));
        assert!(snapshot.open_conflict.is_none());
        assert!(snapshot.field("memo").unwrap().alternatives.is_empty());

        let record = vaults[0].get_conflict(&acme(), &id).unwrap();
        assert_eq!(record.status, ConflictStatus::Resolved);
        assert_eq!(record.resolution_ops, ops);
        assert!(matches!(
            vaults[0].resolve_conflict(&acme(), &id, ResolutionStrategy::KeepLocal, &FieldSelections::new()),
            Err(VaultError::ConflictAlreadyResolved(_))
        ));
        assert!(matches!(
            vaults[0].present_conflict(&acme(), &id),
            Err(VaultError::ConflictAlreadyResolved(_))
        ));
    }

    #[test]
    fn test_resolution_supersedes_on_the_other_device() {
        let (vaults, id) = conflicted();
        // The phone sees the conflict too
        vaults[1]
            .apply_remote_operations(vaults[0].outbound_operations(&acme(), 0, 100).unwrap())
            .unwrap();
        let phone_conflict = vaults[1].get_entity(&transaction("tx-1")).unwrap().open_conflict.unwrap();

        vaults[0].present_conflict(&acme(), &id).unwrap();
        vaults[0]
            .resolve_conflict(&acme(), &id, ResolutionStrategy::KeepLocal, &FieldSelections::new())
            .unwrap();
        vaults[1]
            .apply_remote_operations(vaults[0].outbound_operations(&acme(), 1, 100).unwrap())
            .unwrap();

        let record = vaults[1].get_conflict(&acme(), &phone_conflict).unwrap();
        assert_eq!(record.status, ConflictStatus::Resolved);
        assert_eq!(record.strategy, Some(ResolutionStrategy::Superseded));
        assert_eq!(
            vaults[1].get_entity(&transaction("tx-1")).unwrap().value("memo"),
            Some(&FieldValue::text("laptop memo"))
        );
    }

    #[test]
    fn test_late_contender_must_be_presented_before_resolving() {
        let vaults = paired_vaults(&["laptop", "phone", "tablet"], &acme()).unwrap();
        let tx = transaction("tx-1");
        vaults[0].mutate_field(&tx, "memo", FieldValue::text("laptop memo")).unwrap();
        vaults[1].mutate_field(&tx, "memo", FieldValue::text("phone memo")).unwrap();
        vaults[2].mutate_field(&tx, "memo", FieldValue::text("tablet memo")).unwrap();

        let report = vaults[0]
            .apply_remote_operations(vaults[1].outbound_operations(&acme(), 0, 100).unwrap())
            .unwrap();
        let id = report.conflicts[0].clone();
        let view = vaults[0].present_conflict(&acme(), &id).unwrap();
        assert_eq!(view.fields[0].contenders.len(), 2);

        // The tablet's write lands after the user looked
        let report = vaults[0]
            .apply_remote_operations(vaults[2].outbound_operations(&acme(), 0, 100).unwrap())
            .unwrap();
        assert_eq!(report.conflicts, vec![id.clone()]);
        assert_eq!(vaults[0].get_conflict(&acme(), &id).unwrap().status, ConflictStatus::Detected);
        assert!(matches!(
            vaults[0].resolve_conflict(&acme(), &id, ResolutionStrategy::KeepRemote, &FieldSelections::new()),
            Err(VaultError::InvalidTransition { .. })
        ));

        let view = vaults[0].present_conflict(&acme(), &id).unwrap();
        let contenders = &view.fields[0].contenders;
        assert_eq!(contenders.len(), 3);
        assert!(contenders.iter().any(|c| c.value == FieldValue::text("tablet memo")));

        vaults[0]
            .resolve_conflict(&acme(), &id, ResolutionStrategy::KeepLocal, &FieldSelections::new())
            .unwrap();
        assert_eq!(
            vaults[0].get_entity(&tx).unwrap().value("memo"),
            Some(&FieldValue::text("laptop memo"))
        );
    }

    #[test]
    fn test_listing_skips_closed() {
        let (vaults, id) = conflicted();
        let page = vaults[0].list_unresolved_conflicts(&acme(), &PageRequest::first(10)).unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].fields, vec!["memo".to_string()]);

        vaults[0].present_conflict(&acme(), &id).unwrap();
        vaults[0]
            .resolve_conflict(&acme(), &id, ResolutionStrategy::KeepLocal, &FieldSelections::new())
            .unwrap();
        let page = vaults[0].list_unresolved_conflicts(&acme(), &PageRequest::first(10)).unwrap();
        assert!(page.items.is_empty());
    }
}
