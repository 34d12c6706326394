/*
    policy.rs - What to do when a field has concurrent writes with different values

    Every field type raises a conflict by default. Text, Boolean, Date and
    Reference fields may opt into last-writer-wins; Money and Integer fields
    never may.
*/

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::core_store::model::FieldType;
use crate::errors::{VaultError, VaultResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergePolicy {
    /// Keep every contender and open a conflict record
    RaiseConflict,
    /// Keep every contender but show the last writer without a conflict
    LastWriterWins,
}

/// Merge policy per field type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictPolicy {
    last_writer_wins: BTreeSet<FieldType>,
}

impl ConflictPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_last_writer_wins(types: &[FieldType]) -> VaultResult<Self> {
        let mut policy = Self::new();
        for ty in types {
            policy.allow_last_writer_wins(*ty)?;
        }
        Ok(policy)
    }

    pub fn allow_last_writer_wins(&mut self, field_type: FieldType) -> VaultResult<()> {
        if field_type.is_never_auto_merged() {
            return Err(VaultError::Config(format!(
                "{:?} fields cannot use last-writer-wins",
                field_type
            )));
        }
        self.last_writer_wins.insert(field_type);
        Ok(())
    }

    pub fn policy_for(&self, field_type: FieldType) -> MergePolicy {
        if self.last_writer_wins.contains(&field_type) {
            MergePolicy::LastWriterWins
        } else {
            MergePolicy::RaiseConflict
        }
    }
}
