/*
    core_conflict - Conflict resolution workflow

    Records the contenders of concurrent field writes and walks them through
    Detected -> Presented -> Resolving -> Resolved (or Abandoned).
*/

pub mod record;
pub mod workflow;

pub use record::{
    ConflictRecord, ConflictStatus, ContenderRef, FieldContention, ResolutionStrategy,
};
pub use workflow::{
    plan_resolution, ConflictStore, ConflictView, ContenderView, FieldChoice, FieldConflictView,
    PlannedField,
};
