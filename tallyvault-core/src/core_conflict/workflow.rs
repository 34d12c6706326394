//! Resolution planning and conflict record persistence.
//!
//! Planning is pure: given a record and the user's choice it decides which
//! contender wins each field. Writing the winning values back is the
//! vault's job, since it needs keys, the clock and the write lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::record::{ConflictRecord, ConflictStatus, ContenderRef, FieldContention, ResolutionStrategy};
use crate::core_store::clock::HlcTimestamp;
use crate::core_store::model::{CompanyId, ConflictId, DeviceId, EntityRef, FieldValue, OpId, Timestamp};
use crate::core_store::oplog::last_writer_cmp;
use crate::core_store::store::{LocalStore, Page, PageRequest, Table, WriteBatch};
use crate::errors::{VaultError, VaultResult};

/// Per-field pick for `FieldMerge`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldChoice {
    Local,
    /// Last writer among the non-local contenders
    Remote,
    Op(OpId),
}

/// Winning contender for one field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedField {
    pub field: String,
    pub winner: OpId,
}

fn latest_remote(contention: &FieldContention) -> VaultResult<&ContenderRef> {
    contention
        .remote_contenders()
        .max_by(|a, b| last_writer_cmp((&a.hlc, &a.op_id), (&b.hlc, &b.op_id)))
        .ok_or_else(|| {
            VaultError::Validation(format!("field '{}' has no remote contender", contention.field))
        })
}

fn pick(contention: &FieldContention, choice: &FieldChoice) -> VaultResult<OpId> {
    match choice {
        FieldChoice::Local => Ok(contention.local.clone()),
        FieldChoice::Remote => Ok(latest_remote(contention)?.op_id.clone()),
        FieldChoice::Op(op_id) => contention
            .contender(op_id)
            .map(|c| c.op_id.clone())
            .ok_or_else(|| {
                VaultError::Validation(format!(
                    "{} is not a contender for field '{}'",
                    op_id, contention.field
                ))
            }),
    }
}

/// Decide the winner of every contended field
pub fn plan_resolution(
    record: &ConflictRecord,
    strategy: ResolutionStrategy,
    selections: &BTreeMap<String, FieldChoice>,
) -> VaultResult<Vec<PlannedField>> {
    if !record.is_open() {
        return Err(VaultError::ConflictAlreadyResolved(format!(
            "conflict {} is {}",
            record.id, record.status
        )));
    }

    let choice_for = |contention: &FieldContention| -> VaultResult<FieldChoice> {
        match strategy {
            ResolutionStrategy::KeepLocal => Ok(FieldChoice::Local),
            ResolutionStrategy::KeepRemote => Ok(FieldChoice::Remote),
            ResolutionStrategy::FieldMerge => selections.get(&contention.field).cloned().ok_or_else(|| {
                VaultError::Validation(format!(
                    "field merge needs a choice for '{}'",
                    contention.field
                ))
            }),
            ResolutionStrategy::Superseded => Err(VaultError::Validation(
                "superseded is not a user resolution strategy".into(),
            )),
        }
    };

    if strategy == ResolutionStrategy::FieldMerge {
        if let Some(extra) = selections.keys().find(|name| record.field(name).is_none()) {
            return Err(VaultError::Validation(format!("field '{}' is not contended", extra)));
        }
    }

    record
        .fields
        .iter()
        .map(|contention| {
            let choice = choice_for(contention)?;
            Ok(PlannedField {
                field: contention.field.clone(),
                winner: pick(contention, &choice)?,
            })
        })
        .collect()
}

/// A contender with its decrypted value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContenderView {
    pub op_id: OpId,
    pub author: DeviceId,
    pub hlc: HlcTimestamp,
    pub value: FieldValue,
    pub is_local: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldConflictView {
    pub field: String,
    pub contenders: Vec<ContenderView>,
}

/// Everything a user needs to decide a conflict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictView {
    pub id: ConflictId,
    pub entity: EntityRef,
    pub status: ConflictStatus,
    pub detected_at: Timestamp,
    pub fields: Vec<FieldConflictView>,
}

/// Conflict records in `Table::Conflicts`, keyed by id
pub struct ConflictStore {
    store: Arc<LocalStore>,
}

impl ConflictStore {
    pub fn new(store: Arc<LocalStore>) -> Self {
        ConflictStore { store }
    }

    pub fn get(&self, company: &CompanyId, id: &ConflictId) -> VaultResult<ConflictRecord> {
        self.store
            .get_record(Table::Conflicts, company, id.as_str())?
            .ok_or_else(|| VaultError::NotFound(format!("conflict {} in company {}", id, company)))
    }

    pub fn stage(&self, batch: &mut WriteBatch, record: &ConflictRecord) -> VaultResult<()> {
        self.store.stage_put(
            batch,
            Table::Conflicts,
            &record.entity.company_id,
            record.id.as_str(),
            record,
        )
    }

    /// Open conflicts, oldest id first. Closed records are skipped, so a page
    /// may hold fewer items than requested.
    pub fn list_unresolved(&self, company: &CompanyId, page: &PageRequest) -> VaultResult<Page<ConflictRecord>> {
        let page = self
            .store
            .page_records::<ConflictRecord>(Table::Conflicts, company, None, page)?;
        Ok(Page {
            items: page
                .items
                .into_iter()
                .map(|(_, record)| record)
                .filter(ConflictRecord::is_open)
                .collect(),
            next_cursor: page.next_cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::model::{EntityId, EntityKind};

    fn contender(device: &str, seq: u64, wall: u64) -> ContenderRef {
        ContenderRef {
            op_id: OpId::new(DeviceId::new(device), seq),
            author: DeviceId::new(device),
            hlc: HlcTimestamp::new(wall, 0),
        }
    }

    fn record() -> ConflictRecord {
        let mut record = ConflictRecord::new(
            EntityRef::new(CompanyId::new("acme"), EntityKind::Transaction, EntityId::new("tx-1")),
            Timestamp::from_millis(1),
        );
        let local = contender("laptop", 1, 10);
        record.contend(
            "voided_reason",
            local.op_id.clone(),
            vec![local.clone(), contender("phone", 1, 30), contender("tablet", 1, 20)],
            Timestamp::from_millis(1),
        );
        record.contend(
            "memo",
            local.op_id.clone(),
            vec![local, contender("phone", 2, 5)],
            Timestamp::from_millis(1),
        );
        record
    }

    #[test]
    fn test_keep_local() {
        let plan = plan_resolution(&record(), ResolutionStrategy::KeepLocal, &BTreeMap::new()).unwrap();
        assert!(plan.iter().all(|p| p.winner.device == DeviceId::new("laptop")));
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn test_keep_remote_picks_latest_remote() {
        let plan = plan_resolution(&record(), ResolutionStrategy::KeepRemote, &BTreeMap::new()).unwrap();
        let voided = plan.iter().find(|p| p.field == "voided_reason").unwrap();
        assert_eq!(voided.winner, OpId::new(DeviceId::new("phone"), 1));
    }

    #[test]
    fn test_field_merge_requires_every_field() {
        let mut selections = BTreeMap::new();
        selections.insert("memo".to_string(), FieldChoice::Remote);
        assert!(plan_resolution(&record(), ResolutionStrategy::FieldMerge, &selections).is_err());

        selections.insert(
            "voided_reason".to_string(),
            FieldChoice::Op(OpId::new(DeviceId::new("tablet"), 1)),
        );
        let plan = plan_resolution(&record(), ResolutionStrategy::FieldMerge, &selections).unwrap();
        assert_eq!(plan[0].winner, OpId::new(DeviceId::new("phone"), 2));
        assert_eq!(plan[1].winner, OpId::new(DeviceId::new("tablet"), 1));
    }

    #[test]
    fn test_field_merge_rejects_strangers() {
        let mut selections = BTreeMap::new();
        selections.insert("memo".to_string(), FieldChoice::Local);
        selections.insert(
            "voided_reason".to_string(),
            FieldChoice::Op(OpId::new(DeviceId::new("nobody"), 1)),
        );
        assert!(plan_resolution(&record(), ResolutionStrategy::FieldMerge, &selections).is_err());

        selections.insert("voided_reason".to_string(), FieldChoice::Local);
        selections.insert("amount".to_string(), FieldChoice::Local);
        assert!(plan_resolution(&record(), ResolutionStrategy::FieldMerge, &selections).is_err());
    }

    #[test]
    fn test_closed_record_cannot_be_planned() {
        let mut r = record();
        r.abandon(Timestamp::from_millis(2));
        assert!(matches!(
            plan_resolution(&r, ResolutionStrategy::KeepLocal, &BTreeMap::new()),
            Err(VaultError::ConflictAlreadyResolved(_))
        ));
    }
}
