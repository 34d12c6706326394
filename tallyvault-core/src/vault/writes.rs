//! Local writes, remote merges and entity reads.
//!
//! Each local write or remote op commits its op-log entry, the updated
//! entity, any conflict record change and exactly one audit entry in one
//! batch, under the vault write lock.

use tracing::{debug, error, info, warn};

use super::Vault;
use crate::core_audit::{AuditAction, AuditEvent};
use crate::core_conflict::{ConflictRecord, ContenderRef};
use crate::core_crdt::MergeStatus;
use crate::core_store::clock::{HlcTimestamp, VectorClock};
use crate::core_store::entity::{Entity, FieldHead};
use crate::core_store::model::{
    CompanyId, ConflictId, DeviceId, EntityKind, EntityRef, FieldValue, OpId, Timestamp,
};
use crate::core_store::oplog::{last_writer_cmp, OperationLogEntry};
use crate::core_store::store::{Page, PageRequest, WriteBatch};
use crate::errors::{handle_poison, VaultError, VaultResult};
use crate::metrics::{record_counter, Timer};

/// Decrypted view of one field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldView {
    pub name: String,
    pub value: FieldValue,
    pub op_id: OpId,
    pub author: DeviceId,
    pub hlc: HlcTimestamp,
    /// The field is part of the entity's open conflict
    pub conflicted: bool,
    /// Values of the other concurrent heads, most recent writer first
    pub alternatives: Vec<FieldValue>,
}

/// Decrypted view of an entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySnapshot {
    pub entity_ref: EntityRef,
    /// Sorted by field name; empty once deleted
    pub fields: Vec<FieldView>,
    pub version_vector: VectorClock,
    pub hlc: HlcTimestamp,
    pub deleted: bool,
    pub open_conflict: Option<ConflictId>,
}

impl EntitySnapshot {
    pub fn field(&self, name: &str) -> Option<&FieldView> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn value(&self, name: &str) -> Option<&FieldValue> {
        self.field(name).map(|f| &f.value)
    }
}

/// Listing entry; nothing is decrypted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySummary {
    pub entity_ref: EntityRef,
    pub hlc: HlcTimestamp,
    pub field_count: usize,
    pub deleted: bool,
    pub open_conflict: Option<ConflictId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedOp {
    pub op_id: OpId,
    pub reason: String,
}

/// Outcome of [`Vault::apply_remote_operations`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Ops newly stored (including obsolete and ignored ones)
    pub applied: usize,
    pub duplicates: usize,
    pub obsolete: usize,
    pub auto_merged: usize,
    /// Conflict records created or updated, without repeats
    pub conflicts: Vec<ConflictId>,
    pub rejected: Vec<RejectedOp>,
}

impl ApplyReport {
    fn record(&mut self, status: &MergeStatus, conflict: Option<ConflictId>) {
        match status {
            MergeStatus::AlreadyApplied => self.duplicates += 1,
            MergeStatus::Obsolete => {
                self.applied += 1;
                self.obsolete += 1;
            }
            MergeStatus::AutoMerged => {
                self.applied += 1;
                self.auto_merged += 1;
            }
            _ => self.applied += 1,
        }
        if let Some(id) = conflict {
            if !self.conflicts.contains(&id) {
                self.conflicts.push(id);
            }
        }
    }

    /// Fold a later batch's outcome into this one
    pub fn absorb(&mut self, other: ApplyReport) {
        self.applied += other.applied;
        self.duplicates += other.duplicates;
        self.obsolete += other.obsolete;
        self.auto_merged += other.auto_merged;
        for id in other.conflicts {
            if !self.conflicts.contains(&id) {
                self.conflicts.push(id);
            }
        }
        self.rejected.extend(other.rejected);
    }
}

/// Remote input problems that reject one op without failing the batch
fn is_rejection(err: &VaultError) -> bool {
    matches!(
        err,
        VaultError::Validation(_) | VaultError::CausalViolation(_) | VaultError::QuotaExceeded(_)
    )
}

impl Vault {
    // ===== Local writes =====

    /// Encrypt and write one field. Returns the new op id.
    pub fn mutate_field(&self, entity: &EntityRef, field: &str, value: FieldValue) -> VaultResult<OpId> {
        entity.validate()?;
        let timer = Timer::new("vault.mutation.duration_ms");
        let _guard = self.write_lock.lock().map_err(handle_poison)?;
        let company = &entity.company_id;

        let mut batch = WriteBatch::new();
        let mut state = self.load_or_create(&mut batch, entity)?;
        if state.tombstone {
            return Err(VaultError::NotFound(format!("{} is deleted", entity)));
        }

        let key = self.keys.write_key(company)?;
        let sealed = self.cipher.seal(entity, field, &value, &key)?;
        let op_id = OpId::new(self.device.clone(), self.store.device_seq(company, &self.device)? + 1);
        let hlc = self.clock.observe(state.hlc)?;
        let op = OperationLogEntry::set_field(
            op_id.clone(),
            entity.clone(),
            field,
            sealed,
            hlc,
            state.version_vector.clone(),
        );

        let now = self.now();
        let shown_before = state.field(field).and_then(|f| f.current()).map(|h| h.op_id.clone());
        let status = self.merge.apply(&mut state, &op, &self.comparator())?;
        self.reconcile_conflict(&mut batch, &mut state, &op, &status, shown_before, now)?;

        let event = AuditEvent::new(self.device.clone(), AuditAction::FieldWritten)
            .entity(entity.clone())
            .field(field)
            .op(op_id.clone());
        self.stage_local_op(&mut batch, &state, &op, &event, now)?;
        self.store.commit(batch)?;

        record_counter("vault.mutations", 1);
        timer.stop();
        debug!(entity = %entity, field, op = %op_id, "Field written");
        Ok(op_id)
    }

    /// Tombstone an entity. Deleting a deleted entity returns the op that
    /// deleted it.
    pub fn delete_entity(&self, entity: &EntityRef) -> VaultResult<OpId> {
        entity.validate()?;
        let _guard = self.write_lock.lock().map_err(handle_poison)?;
        let mut state = self
            .store
            .get_entity(entity)?
            .ok_or_else(|| VaultError::NotFound(entity.to_string()))?;
        if state.tombstone {
            if let Some(deleted_by) = &state.deleted_by {
                return Ok(deleted_by.clone());
            }
        }

        let company = &entity.company_id;
        let op_id = OpId::new(self.device.clone(), self.store.device_seq(company, &self.device)? + 1);
        let hlc = self.clock.observe(state.hlc)?;
        let op = OperationLogEntry::delete(op_id.clone(), entity.clone(), hlc, state.version_vector.clone());

        let now = self.now();
        let mut batch = WriteBatch::new();
        let status = self.merge.apply(&mut state, &op, &self.comparator())?;
        self.reconcile_conflict(&mut batch, &mut state, &op, &status, None, now)?;

        let event = AuditEvent::new(self.device.clone(), AuditAction::EntityDeleted)
            .entity(entity.clone())
            .op(op_id.clone());
        self.stage_local_op(&mut batch, &state, &op, &event, now)?;
        self.store.commit(batch)?;

        record_counter("vault.mutations", 1);
        info!(entity = %entity, op = %op_id, "Entity deleted");
        Ok(op_id)
    }

    fn load_or_create(&self, batch: &mut WriteBatch, entity: &EntityRef) -> VaultResult<Entity> {
        match self.store.get_entity(entity)? {
            Some(existing) => Ok(existing),
            None => {
                self.store.stage_new_entity(batch, &entity.company_id)?;
                Ok(Entity::new(entity.clone(), self.now()))
            }
        }
    }

    /// Stage a local op with its entity, sequence and audit entry
    fn stage_local_op(
        &self,
        batch: &mut WriteBatch,
        entity: &Entity,
        op: &OperationLogEntry,
        event: &AuditEvent,
        now: Timestamp,
    ) -> VaultResult<()> {
        let company = &entity.entity_ref.company_id;
        self.store.stage_op(batch, op)?;
        self.store.stage_entity(batch, entity)?;
        self.store
            .stage_device_seq(batch, company, &self.device, op.op_id.seq)?;
        let audit_key = self.audit_key(company)?;
        self.audit.stage(batch, company, event, &audit_key, now)?;
        Ok(())
    }

    /// Bring the entity's conflict record in line with a merge result
    fn reconcile_conflict(
        &self,
        batch: &mut WriteBatch,
        entity: &mut Entity,
        op: &OperationLogEntry,
        status: &MergeStatus,
        shown_before: Option<OpId>,
        now: Timestamp,
    ) -> VaultResult<Option<ConflictId>> {
        let company = entity.entity_ref.company_id.clone();
        match status {
            MergeStatus::Conflicted { .. } => {
                let Some(field) = op.field() else {
                    return Ok(None);
                };
                let Some(state) = entity.field(field) else {
                    return Ok(None);
                };
                let contenders: Vec<ContenderRef> = state
                    .heads
                    .iter()
                    .map(|h| ContenderRef {
                        op_id: h.op_id.clone(),
                        author: h.op_id.device.clone(),
                        hlc: h.hlc,
                    })
                    .collect();
                let local = self
                    .local_contender(&state.heads, shown_before)
                    .ok_or_else(|| VaultError::Validation(format!("field '{}' has no heads", field)))?;

                let existing = match &entity.open_conflict {
                    Some(id) => Some(self.conflicts.get(&company, id)?).filter(ConflictRecord::is_open),
                    None => None,
                };
                let mut record = match existing {
                    Some(record) => record,
                    None => {
                        record_counter("crdt.conflicts.detected", 1);
                        ConflictRecord::new(entity.entity_ref.clone(), now)
                    }
                };
                record.contend(field, local, contenders, now);
                self.conflicts.stage(batch, &record)?;
                info!(
                    entity = %entity.entity_ref,
                    field,
                    conflict = %record.id,
                    "Concurrent writes need a decision"
                );
                entity.open_conflict = Some(record.id.clone());
                Ok(Some(record.id))
            }
            MergeStatus::Advanced | MergeStatus::Converged | MergeStatus::AutoMerged => {
                let (Some(id), Some(field)) = (entity.open_conflict.clone(), op.field()) else {
                    return Ok(None);
                };
                let mut record = self.conflicts.get(&company, &id)?;
                if !record.is_open() || record.field(field).is_none() {
                    return Ok(None);
                }
                if record.supersede_field(field, now) {
                    entity.open_conflict = None;
                    record_counter("crdt.conflicts.superseded", 1);
                    info!(entity = %entity.entity_ref, conflict = %id, "Conflict superseded by a later write");
                }
                self.conflicts.stage(batch, &record)?;
                Ok(None)
            }
            MergeStatus::Tombstoned => {
                if let Some(id) = entity.open_conflict.take() {
                    let mut record = self.conflicts.get(&company, &id)?;
                    if record.abandon(now) {
                        self.conflicts.stage(batch, &record)?;
                        info!(entity = %entity.entity_ref, conflict = %id, "Conflict abandoned; entity deleted");
                    }
                }
                Ok(None)
            }
            MergeStatus::AlreadyApplied | MergeStatus::Obsolete | MergeStatus::IgnoredDeleted => Ok(None),
        }
    }

    /// This device's latest head, else the head that was on display
    fn local_contender(&self, heads: &[FieldHead], shown_before: Option<OpId>) -> Option<OpId> {
        heads
            .iter()
            .filter(|h| h.op_id.device == self.device)
            .max_by(|a, b| last_writer_cmp((&a.hlc, &a.op_id), (&b.hlc, &b.op_id)))
            .map(|h| h.op_id.clone())
            .or_else(|| shown_before.filter(|id| heads.iter().any(|h| &h.op_id == id)))
            .or_else(|| heads.first().map(|h| h.op_id.clone()))
    }

    // ===== Remote operations =====

    /// Merge op-log entries received from other devices.
    ///
    /// Malformed ops, ops from a clock too far ahead and values that fail
    /// authentication are rejected one by one and reported; nothing of a
    /// rejected op is stored. Storage and key failures abort the call. Ops
    /// before the failing one stay applied.
    pub fn apply_remote_operations(&self, ops: Vec<OperationLogEntry>) -> VaultResult<ApplyReport> {
        let _guard = self.write_lock.lock().map_err(handle_poison)?;
        let mut report = ApplyReport::default();
        for op in ops {
            match self.apply_remote(&op) {
                Ok((status, conflict)) => report.record(&status, conflict),
                Err(e @ VaultError::Integrity(_)) => {
                    error!(op = %op.op_id, entity = %op.entity, error = %e, "Remote operation failed authentication");
                    report.rejected.push(RejectedOp {
                        op_id: op.op_id.clone(),
                        reason: e.to_string(),
                    });
                }
                Err(e) if is_rejection(&e) => {
                    warn!(op = %op.op_id, error = %e, "Rejected remote operation");
                    report.rejected.push(RejectedOp {
                        op_id: op.op_id.clone(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        record_counter("vault.remote_ops.applied", report.applied as u64);
        record_counter("vault.remote_ops.duplicate", report.duplicates as u64);
        Ok(report)
    }

    fn apply_remote(&self, op: &OperationLogEntry) -> VaultResult<(MergeStatus, Option<ConflictId>)> {
        op.validate()?;
        let company = &op.entity.company_id;
        if self.store.has_op(company, &op.op_id)? {
            return Ok((MergeStatus::AlreadyApplied, None));
        }
        self.authenticate_remote(op)?;
        self.clock.observe(op.hlc)?;

        let now = self.now();
        let mut batch = WriteBatch::new();
        let mut state = self.load_or_create(&mut batch, &op.entity)?;
        let shown_before = op
            .field()
            .and_then(|f| state.field(f))
            .and_then(|f| f.current())
            .map(|h| h.op_id.clone());
        let status = self.merge.apply(&mut state, op, &self.comparator())?;
        let conflict = self.reconcile_conflict(&mut batch, &mut state, op, &status, shown_before, now)?;

        self.store.stage_op(&mut batch, op)?;
        self.store.stage_entity(&mut batch, &state)?;
        // Own ops coming back from the relay after local data loss
        if op.author() == &self.device && op.op_id.seq > self.store.device_seq(company, &self.device)? {
            self.store
                .stage_device_seq(&mut batch, company, &self.device, op.op_id.seq)?;
        }

        let mut event = AuditEvent::new(self.device.clone(), AuditAction::RemoteMerged)
            .entity(op.entity.clone())
            .op(op.op_id.clone())
            .detail(status.as_str());
        if let Some(field) = op.field() {
            event = event.field(field);
        }
        if let Some(id) = &conflict {
            event = event.conflict(id.clone());
        }
        let audit_key = self.audit_key(company)?;
        self.audit.stage(&mut batch, company, &event, &audit_key, now)?;
        self.store.commit(batch)?;

        debug!(op = %op.op_id, entity = %op.entity, status = status.as_str(), "Applied remote operation");
        Ok((status, conflict))
    }

    /// Open an incoming value before it can become a head. Values sealed
    /// under a key this device does not hold are stored unopened.
    fn authenticate_remote(&self, op: &OperationLogEntry) -> VaultResult<()> {
        let (Some(field), Some(sealed)) = (op.field(), op.value()) else {
            return Ok(());
        };
        let key = match self.keys.data_key(&op.entity.company_id, &sealed.key_id) {
            Ok(key) => key,
            Err(VaultError::KeyNotFound(reason)) => {
                debug!(op = %op.op_id, reason = %reason, "No local key for remote value");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.cipher.open(&op.entity, field, sealed, &key)?;
        Ok(())
    }

    /// This device's own ops with a sequence above `after_seq`, oldest first
    pub fn outbound_operations(
        &self,
        company: &CompanyId,
        after_seq: u64,
        limit: usize,
    ) -> VaultResult<Vec<OperationLogEntry>> {
        self.store.ops_by_device(company, &self.device, after_seq, limit)
    }

    /// Highest sequence this device has authored for the company
    pub fn local_seq(&self, company: &CompanyId) -> VaultResult<u64> {
        self.store.device_seq(company, &self.device)
    }

    // ===== Reads =====

    /// Decrypt an entity's displayed values
    pub fn get_entity(&self, entity: &EntityRef) -> VaultResult<EntitySnapshot> {
        let state = self
            .store
            .get_entity(entity)?
            .ok_or_else(|| VaultError::NotFound(entity.to_string()))?;

        let conflicted_fields: Vec<String> = match &state.open_conflict {
            Some(id) => self
                .conflicts
                .get(&entity.company_id, id)?
                .fields
                .into_iter()
                .map(|f| f.field)
                .collect(),
            None => Vec::new(),
        };

        let mut fields = Vec::new();
        if !state.tombstone {
            for (name, field_state) in &state.fields {
                let Some(current) = field_state.current() else {
                    continue;
                };
                let mut others: Vec<&FieldHead> = field_state
                    .heads
                    .iter()
                    .filter(|h| h.op_id != current.op_id)
                    .collect();
                others.sort_by(|a, b| last_writer_cmp((&b.hlc, &b.op_id), (&a.hlc, &a.op_id)));

                let alternatives = others
                    .into_iter()
                    .map(|h| self.open_head(entity, name, h))
                    .collect::<VaultResult<Vec<_>>>()?;
                fields.push(FieldView {
                    name: name.clone(),
                    value: self.open_head(entity, name, current)?,
                    op_id: current.op_id.clone(),
                    author: current.op_id.device.clone(),
                    hlc: current.hlc,
                    conflicted: conflicted_fields.iter().any(|f| f == name),
                    alternatives,
                });
            }
        }

        Ok(EntitySnapshot {
            entity_ref: state.entity_ref,
            fields,
            version_vector: state.version_vector,
            hlc: state.hlc,
            deleted: state.tombstone,
            open_conflict: state.open_conflict,
        })
    }

    pub(super) fn open_head(&self, entity: &EntityRef, field: &str, head: &FieldHead) -> VaultResult<FieldValue> {
        let key = self.keys.data_key(&entity.company_id, &head.value.key_id)?;
        self.cipher.open(entity, field, &head.value, &key)
    }

    pub fn list_entities(
        &self,
        company: &CompanyId,
        kind: Option<EntityKind>,
        page: &PageRequest,
    ) -> VaultResult<Page<EntitySummary>> {
        Ok(self.store.list_entities(company, kind, page)?.map(|entity| EntitySummary {
            field_count: entity.fields.values().filter(|f| !f.heads.is_empty()).count(),
            hlc: entity.hlc,
            deleted: entity.tombstone,
            open_conflict: entity.open_conflict,
            entity_ref: entity.entity_ref,
        }))
    }
}
