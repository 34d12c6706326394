/*
    record.rs - Conflict records and their state machine

    Detected -> Presented -> Resolving -> Resolved
    Presented -> Detected         (a new contender arrived)
    Any open state -> Abandoned   (entity deleted)
    Any open state -> Resolved    (superseded by a causally later op)

    A record lists, per contended field, every competing op and which of them
    is the local one. Values are never copied into the record; they are read
    from the entity heads when presented.
*/

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core_store::clock::HlcTimestamp;
use crate::core_store::model::{ConflictId, DeviceId, EntityRef, OpId, Timestamp};
use crate::errors::{VaultError, VaultResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictStatus {
    Detected,
    Presented,
    Resolving,
    Resolved,
    Abandoned,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStatus::Detected => "detected",
            ConflictStatus::Presented => "presented",
            ConflictStatus::Resolving => "resolving",
            ConflictStatus::Resolved => "resolved",
            ConflictStatus::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConflictStatus::Resolved | ConflictStatus::Abandoned)
    }

    /// Single forward step of the user-driven path
    fn next_allowed(&self, next: ConflictStatus) -> bool {
        matches!(
            (self, next),
            (ConflictStatus::Detected, ConflictStatus::Presented)
                | (ConflictStatus::Presented, ConflictStatus::Resolving)
                | (ConflictStatus::Resolving, ConflictStatus::Resolved)
        )
    }
}

impl fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionStrategy {
    KeepLocal,
    KeepRemote,
    FieldMerge,
    /// Closed by a causally later op rather than by a user
    Superseded,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::KeepLocal => "keep_local",
            ResolutionStrategy::KeepRemote => "keep_remote",
            ResolutionStrategy::FieldMerge => "field_merge",
            ResolutionStrategy::Superseded => "superseded",
        }
    }

    pub fn parse(s: &str) -> VaultResult<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "keep_local" | "local" => Ok(ResolutionStrategy::KeepLocal),
            "keep_remote" | "remote" => Ok(ResolutionStrategy::KeepRemote),
            "field_merge" | "merge" => Ok(ResolutionStrategy::FieldMerge),
            other => Err(VaultError::Validation(format!(
                "unknown resolution strategy '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One competing op
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContenderRef {
    pub op_id: OpId,
    pub author: DeviceId,
    pub hlc: HlcTimestamp,
}

/// The contenders for one field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldContention {
    pub field: String,
    /// Contender this device was showing, or wrote itself
    pub local: OpId,
    pub contenders: Vec<ContenderRef>,
}

impl FieldContention {
    pub fn contender(&self, op_id: &OpId) -> Option<&ContenderRef> {
        self.contenders.iter().find(|c| &c.op_id == op_id)
    }

    pub fn remote_contenders(&self) -> impl Iterator<Item = &ContenderRef> {
        self.contenders.iter().filter(move |c| c.op_id != self.local)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: ConflictId,
    pub entity: EntityRef,
    /// Sorted by field name
    pub fields: Vec<FieldContention>,
    pub status: ConflictStatus,
    pub strategy: Option<ResolutionStrategy>,
    pub resolved_by: Option<DeviceId>,
    pub resolved_at: Option<Timestamp>,
    /// Ops written to resolve the conflict, one per field
    pub resolution_ops: Vec<OpId>,
    pub detected_at: Timestamp,
    pub updated_at: Timestamp,
}

impl ConflictRecord {
    pub fn new(entity: EntityRef, now: Timestamp) -> Self {
        ConflictRecord {
            id: ConflictId::generate(),
            entity,
            fields: Vec::new(),
            status: ConflictStatus::Detected,
            strategy: None,
            resolved_by: None,
            resolved_at: None,
            resolution_ops: Vec::new(),
            detected_at: now,
            updated_at: now,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn field(&self, name: &str) -> Option<&FieldContention> {
        self.fields.iter().find(|f| f.field == name)
    }

    /// Record (or refresh) the contenders of a field.
    ///
    /// A presented record whose contenders change drops back to `Detected`
    /// and must be presented again before it can be resolved.
    pub fn contend(&mut self, field: &str, local: OpId, contenders: Vec<ContenderRef>, now: Timestamp) {
        let changed = match self.fields.iter_mut().find(|f| f.field == field) {
            Some(existing) => {
                let changed = existing.contenders.len() != contenders.len()
                    || contenders.iter().any(|c| existing.contender(&c.op_id).is_none());
                // Keep the original local contender while it is still competing
                if !contenders.iter().any(|c| c.op_id == existing.local) {
                    existing.local = local;
                }
                existing.contenders = contenders;
                changed
            }
            None => {
                self.fields.push(FieldContention {
                    field: field.to_string(),
                    local,
                    contenders,
                });
                self.fields.sort_by(|a, b| a.field.cmp(&b.field));
                true
            }
        };
        if changed && self.status == ConflictStatus::Presented {
            self.status = ConflictStatus::Detected;
        }
        self.updated_at = now;
    }

    /// Strict user-path transition
    pub fn transition(&mut self, next: ConflictStatus, now: Timestamp) -> VaultResult<()> {
        if self.status.is_terminal() {
            return Err(VaultError::ConflictAlreadyResolved(format!(
                "conflict {} is {}",
                self.id, self.status
            )));
        }
        if !self.status.next_allowed(next) {
            return Err(VaultError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Drop a field whose heads collapsed. Returns true when that closed the
    /// whole record.
    pub fn supersede_field(&mut self, field: &str, now: Timestamp) -> bool {
        if !self.is_open() {
            return false;
        }
        self.fields.retain(|f| f.field != field);
        self.updated_at = now;
        if self.fields.is_empty() {
            self.status = ConflictStatus::Resolved;
            self.strategy = Some(ResolutionStrategy::Superseded);
            self.resolved_at = Some(now);
            true
        } else {
            false
        }
    }

    pub fn abandon(&mut self, now: Timestamp) -> bool {
        if !self.is_open() {
            return false;
        }
        self.status = ConflictStatus::Abandoned;
        self.updated_at = now;
        true
    }

    /// Close the record after its resolution ops were written
    pub fn complete(
        &mut self,
        strategy: ResolutionStrategy,
        by: DeviceId,
        ops: Vec<OpId>,
        now: Timestamp,
    ) -> VaultResult<()> {
        self.transition(ConflictStatus::Resolved, now)?;
        self.strategy = Some(strategy);
        self.resolved_by = Some(by);
        self.resolved_at = Some(now);
        self.resolution_ops = ops;
        Ok(())
    }
}
