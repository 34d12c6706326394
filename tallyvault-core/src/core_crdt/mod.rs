/*
    core_crdt - Conflict engine

    Field-granular merge of operation log entries into entity state:
    - merge: multi-value register per field, order-independent
    - policy: which field types may settle concurrent writes automatically
*/

pub mod merge;
pub mod policy;

pub use merge::{MergeEngine, MergeStatus, ValueComparator};
pub use policy::{ConflictPolicy, MergePolicy};
