//! Key Management
//!
//! Passphrase-derived master key, wrapped per-company data keys, the
//! unlocked key session and resumable key rotation.

pub mod data_key;
pub mod master_key;
pub mod passphrase;
pub mod rotation;
pub mod session;

pub use data_key::{DataKey, KeyRecord, KeyStatus};
pub use master_key::{derive_master_key, KdfParams, MasterKey, PassphraseVerifier, WrappedKey};
pub use passphrase::validate_passphrase;
pub use rotation::{
    KeyRotationJob, RotationControl, RotationDirection, RotationReport, RotationRunner, RotationStatus,
};
pub use session::KeySession;
