//! TallyVault core: an encrypted, CRDT-synchronized local-first store for
//! financial records.
//!
//! Each device opens a [`Vault`] with the user's passphrase. Field values are
//! sealed before they reach storage or the relay, concurrent edits converge
//! per field, and every mutation is recorded in a hash-chained audit trail.

pub mod config;
pub mod core_audit;
pub mod core_conflict;
pub mod core_crdt;
pub mod core_crypto;
pub mod core_keys;
pub mod core_store;
pub mod core_sync;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod test_utils;
pub mod vault;

pub use config::Config;
pub use errors::{VaultError, VaultResult};
pub use logging::{init_logging, LogLevel};
pub use vault::{Vault, VaultBuilder};
